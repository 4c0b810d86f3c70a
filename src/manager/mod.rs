//! Interaction with the external drop manager processes: the REST client used
//! to talk to running managers, and the supervisor that launches and tears
//! down manager subprocesses on this host.

use std::fmt;

use serde::{Deserialize, Serialize};

// Public submodules
pub mod client;
pub mod supervisor;

// Public exports
pub use client::{submit_graph, ManagerInterface, RestManagerClient};
pub use supervisor::ManagedProcess;

/// Well-known REST port of a node manager.
pub const NODE_MANAGER_REST_PORT: u16 = 8000;
/// Well-known REST port of a data island manager.
pub const ISLAND_MANAGER_REST_PORT: u16 = 8001;
/// Well-known REST port of a master manager.
pub const MASTER_MANAGER_REST_PORT: u16 = 8002;
/// Default port of an external execution monitor.
pub const DEFAULT_MONITOR_PORT: u16 = 8081;

/// The place a manager occupies in the manager hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerRole {
    /// Per-host manager executing individual drops.
    Node,
    /// Manager overseeing a group of node managers.
    Island,
    /// Top-level manager overseeing the island managers.
    Master,
}

impl ManagerRole {
    /// The subcommand the manager binary uses for this role.
    pub fn subcommand(self) -> &'static str {
        match self {
            ManagerRole::Node => "nm",
            ManagerRole::Island => "dim",
            ManagerRole::Master => "mm",
        }
    }

    /// The well-known REST port a manager of this role listens on.
    pub fn rest_port(self) -> u16 {
        match self {
            ManagerRole::Node => NODE_MANAGER_REST_PORT,
            ManagerRole::Island => ISLAND_MANAGER_REST_PORT,
            ManagerRole::Master => MASTER_MANAGER_REST_PORT,
        }
    }
}

impl fmt::Display for ManagerRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ManagerRole::Node => write!(f, "node manager"),
            ManagerRole::Island => write!(f, "island manager"),
            ManagerRole::Master => write!(f, "master manager"),
        }
    }
}

/// The lifecycle states a manager session moves through.
///
/// Sessions are owned by the remote manager; this crate only observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "ERROR")]
    Error,
}

impl SessionStatus {
    /// Whether the session can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Finished | SessionStatus::Error)
    }
}

/// One tracked execution instance of a submitted physical graph, as reported
/// by a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: SessionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!SessionStatus::Scheduled.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Finished.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
    }

    #[test]
    fn test_session_wire_names() {
        let session: Session =
            serde_json::from_str(r#"{"sessionId": "s-1", "status": "RUNNING"}"#).unwrap();
        assert_eq!(session.session_id, "s-1");
        assert_eq!(session.status, SessionStatus::Running);
        let encoded = serde_json::to_string(&session).unwrap();
        assert!(encoded.contains("\"RUNNING\""));
        assert!(encoded.contains("\"sessionId\""));
    }
}
