//! condb Core - Value Types
//!
//! Pure data structures and policy shared by every condb crate: flags and
//! contexts, validity records and their trimming rules, result fingerprints,
//! time gates, sim-flag associations, rollbacks, configuration and errors.
//! Nothing here talks to a backend.

pub mod config;
pub mod context;
pub mod error;
pub mod exception;
pub mod fingerprint;
pub mod flags;
pub mod identity;
pub mod rollback;
pub mod sim_association;
pub mod status;
pub mod time_gate;
pub mod validity;

pub use config::{
    BackendDescriptor, CascadeConfig, DbiConfig, DEFAULT_MAX_CONNECTION_ATTEMPTS, DEFAULT_RETRY_DELAY,
    VALIDATED_MAX_CONNECTION_ATTEMPTS,
};
pub use context::{ValidityContext, ValidityRange};
pub use error::{
    BackendError, ConfigError, ConnectionError, DbiError, DbiResult, L2CacheError, RowError,
};
pub use exception::{DbException, ExceptionLog};
pub use fingerprint::{ResultKey, VrecKey};
pub use flags::{Detector, DetectorMask, FlagParseError, SimFlag, SimMask};
pub use identity::*;
pub use rollback::{wildcard_match, EpochRollback, RollbackDates, RollbackType};
pub use sim_association::SimFlagAssociation;
pub use status::{CascadeStatus, ConnectionStatus, EntryStatus};
pub use time_gate::{TimeGates, DEFAULT_TIME_GATE_SECS, MAX_TIME_GATE_SECS, MIN_TIME_GATE_SECS};
pub use validity::{ValidityRecord, DATABASE_SOURCE, GAP_SOURCE};
