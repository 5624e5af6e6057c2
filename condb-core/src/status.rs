//! Connection status reporting.

use crate::identity::DbNo;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one cascade entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Reachable but currently closed (temporary connection at rest).
    Closed,
    Open,
    /// Could not be opened within the retry budget.
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Closed => "Closed",
            ConnectionStatus::Open => "Open",
            ConnectionStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Padded so that status columns line up.
        write!(f, "{:<6}", self.as_str())
    }
}

/// One line of a cascade status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStatus {
    pub db_no: DbNo,
    pub status: ConnectionStatus,
    pub authorizing: bool,
    pub permanent: bool,
    pub url: String,
}

/// Status of every entry of a cascade, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeStatus {
    pub entries: Vec<EntryStatus>,
}

impl CascadeStatus {
    pub fn is_healthy(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status != ConnectionStatus::Failed)
    }

    pub fn authorizing(&self) -> Option<DbNo> {
        self.entries.iter().find(|e| e.authorizing).map(|e| e.db_no)
    }
}

impl fmt::Display for CascadeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cascade Status:-")?;
        writeln!(f, "Status   URL")?;
        writeln!(f)?;
        for entry in &self.entries {
            writeln!(
                f,
                "{} {}{}",
                entry.status,
                if entry.authorizing { "(auth)  " } else { "        " },
                entry.url
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_entry(db_no: DbNo, status: ConnectionStatus, authorizing: bool) -> EntryStatus {
        EntryStatus {
            db_no,
            status,
            authorizing,
            permanent: false,
            url: format!("sqlite:///tmp/db{}.sqlite", db_no),
        }
    }

    #[test]
    fn test_report_marks_authorizing_entry() {
        let status = CascadeStatus {
            entries: vec![
                make_test_entry(0, ConnectionStatus::Open, false),
                make_test_entry(1, ConnectionStatus::Closed, true),
            ],
        };
        let text = status.to_string();
        assert!(text.contains("Open   "));
        assert!(text.contains("Closed (auth)  sqlite:///tmp/db1.sqlite"));
        assert_eq!(status.authorizing(), Some(1));
        assert!(status.is_healthy());
    }

    #[test]
    fn test_failed_entry_is_unhealthy() {
        let status = CascadeStatus {
            entries: vec![make_test_entry(0, ConnectionStatus::Failed, false)],
        };
        assert!(!status.is_healthy());
        assert_eq!(status.authorizing(), None);
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
    }
}
