//! Sim flag associations.
//!
//! Lets a query for one kind of data fall back to constants stored for
//! another, e.g. Monte-Carlo contexts reading data calibrations. The list of a
//! flag is tried in order; a flag without an entry maps to itself.

use crate::flags::SimFlag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Registry key prefix of association entries.
pub const SIM_ASSOCIATION_PREFIX: &str = "SimFlagAssociation:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimFlagAssociation {
    associations: BTreeMap<SimFlag, Vec<SimFlag>>,
}

impl SimFlagAssociation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags to try, in order, for a query made with `sim`.
    pub fn get(&self, sim: SimFlag) -> Vec<SimFlag> {
        self.associations
            .get(&sim)
            .cloned()
            .unwrap_or_else(|| vec![sim])
    }

    pub fn set(&mut self, sim: SimFlag, list: Vec<SimFlag>) {
        self.associations.insert(sim, list);
    }

    pub fn clear(&mut self) {
        self.associations.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    /// Consume every `SimFlagAssociation:<Flag>` = `"A,B"` entry of a
    /// registry. Illegal entries are dropped with a warning. Returns whether
    /// any association changed.
    pub fn apply_registry(&mut self, registry: &mut BTreeMap<String, String>) -> bool {
        let keys: Vec<String> = registry
            .keys()
            .filter(|k| k.starts_with(SIM_ASSOCIATION_PREFIX))
            .cloned()
            .collect();

        let mut changed = false;
        for key in keys {
            let Some(value) = registry.remove(&key) else {
                continue;
            };
            match Self::parse_entry(&key[SIM_ASSOCIATION_PREFIX.len()..], &value) {
                Some((sim, list)) => {
                    self.set(sim, list);
                    changed = true;
                }
                None => {
                    tracing::warn!(key = %key, value = %value, "Illegal SimFlagAssociation registry item");
                }
            }
        }
        if changed {
            tracing::info!(associations = %self, "SimFlag associations updated");
        }
        changed
    }

    fn parse_entry(name: &str, list: &str) -> Option<(SimFlag, Vec<SimFlag>)> {
        let sim = name.parse::<SimFlag>().ok().filter(|s| *s != SimFlag::Unknown)?;
        let mut flags = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let flag = item.parse::<SimFlag>().ok().filter(|s| *s != SimFlag::Unknown)?;
            flags.push(flag);
        }
        if flags.is_empty() {
            return None;
        }
        Some((sim, flags))
    }
}

impl fmt::Display for SimFlagAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.associations.is_empty() {
            return write!(f, "Not enabled");
        }
        let mut first = true;
        for (sim, list) in &self.associations {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            let names: Vec<String> = list
                .iter()
                .map(|s| format!("{}({})", s, s.bits()))
                .collect();
            write!(f, "{}({}) maps to: {}", sim, sim.bits(), names.join(", "))?;
        }
        Ok(())
    }
}
