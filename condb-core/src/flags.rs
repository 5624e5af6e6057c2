//! Detector and simulation flags.
//!
//! A context names exactly one detector and one sim flag; stored validity
//! ranges carry masks so that a single row can serve several of them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// MASKS
// ============================================================================

bitflags! {
    /// Set of detectors a validity range applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct DetectorMask: u32 {
        const MCAPTAIN = 1;
        const CAPTAIN = 2;
    }
}

bitflags! {
    /// Set of simulation/data kinds a validity range applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct SimMask: u32 {
        const DATA = 1;
        const DAQ_FAKE_DATA = 2;
        const MC = 4;
        const REROOT = 8;
    }
}

/// Error when parsing an invalid flag name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagParseError(pub String);

impl fmt::Display for FlagParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid flag name: {}", self.0)
    }
}

impl std::error::Error for FlagParseError {}

// ============================================================================
// DETECTOR
// ============================================================================

/// The detector a context refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum Detector {
    Unknown = 0,
    MCaptain = 1,
    Captain = 2,
}

impl Detector {
    /// All named detectors, unknown excluded.
    pub const ALL: [Detector; 2] = [Detector::MCaptain, Detector::Captain];

    pub fn as_str(&self) -> &'static str {
        match self {
            Detector::Unknown => "Unknown",
            Detector::MCaptain => "mCAPTAIN",
            Detector::Captain => "CAPTAIN",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, FlagParseError> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(Detector::Unknown),
            "mcaptain" => Ok(Detector::MCaptain),
            "captain" => Ok(Detector::Captain),
            _ => Err(FlagParseError(s.to_string())),
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    /// The single-detector mask matching this detector.
    pub fn mask(self) -> DetectorMask {
        DetectorMask::from_bits_retain(self.bits())
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Detector {
    type Err = FlagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// SIM FLAG
// ============================================================================

/// Whether a context describes real data or some flavour of simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum SimFlag {
    Unknown = 0,
    Data = 1,
    DaqFakeData = 2,
    MC = 4,
    Reroot = 8,
}

impl SimFlag {
    /// All named flags, unknown excluded.
    pub const ALL: [SimFlag; 4] = [
        SimFlag::Data,
        SimFlag::DaqFakeData,
        SimFlag::MC,
        SimFlag::Reroot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SimFlag::Unknown => "Unknown",
            SimFlag::Data => "Data",
            SimFlag::DaqFakeData => "DaqFakeData",
            SimFlag::MC => "MC",
            SimFlag::Reroot => "Reroot",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, FlagParseError> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(SimFlag::Unknown),
            "data" => Ok(SimFlag::Data),
            "daqfakedata" => Ok(SimFlag::DaqFakeData),
            "mc" => Ok(SimFlag::MC),
            "reroot" => Ok(SimFlag::Reroot),
            _ => Err(FlagParseError(s.to_string())),
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn mask(self) -> SimMask {
        SimMask::from_bits_retain(self.bits())
    }
}

impl fmt::Display for SimFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SimFlag {
    type Err = FlagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_round_trip() {
        for det in Detector::ALL {
            assert_eq!(det.as_str().parse::<Detector>().unwrap(), det);
        }
        assert_eq!("MCAPTAIN".parse::<Detector>().unwrap(), Detector::MCaptain);
        assert!("ND280".parse::<Detector>().is_err());
    }

    #[test]
    fn test_sim_flag_round_trip() {
        for sim in SimFlag::ALL {
            assert_eq!(sim.as_str().parse::<SimFlag>().unwrap(), sim);
        }
        assert_eq!("mc".parse::<SimFlag>().unwrap(), SimFlag::MC);
        let err = "Pythia".parse::<SimFlag>().unwrap_err();
        assert!(err.to_string().contains("Pythia"));
    }

    #[test]
    fn test_masks_from_flags() {
        assert_eq!(SimFlag::MC.mask(), SimMask::MC);
        assert_eq!(Detector::Captain.mask(), DetectorMask::CAPTAIN);
        assert!(SimFlag::Unknown.mask().is_empty());
        let both = DetectorMask::MCAPTAIN | DetectorMask::CAPTAIN;
        assert!(both.intersects(Detector::MCaptain.mask()));
    }
}
