use std::{fmt, io};

use crate::manager::ManagerRole;

/// Error raised by the cluster orchestration layer.
///
/// The variants mirror how failures are treated by the
/// [`ExecutionCoordinator`](crate::cluster::ExecutionCoordinator):
/// configuration and launch failures are fatal, submission failures stay
/// inside the detached submission task, and snapshot persistence failures
/// abort only the [`ExecutionMonitor`](crate::monitor::ExecutionMonitor).
#[derive(Debug)]
pub enum ClusterError {
    /// Contradictory or invalid settings: bad flag combinations, an unknown
    /// graph modifier or partition algorithm, or fewer healthy hosts than the
    /// requested partitioning needs.
    Configuration(String),
    /// A manager subprocess could not be started.
    ManagerLaunch {
        role: ManagerRole,
        source: io::Error,
    },
    /// A graph submission failed, or the target manager never became ready.
    Submission(String),
    /// Persisting a monitor snapshot failed.
    MonitorIo(io::Error),
    /// The node list exchange between cluster ranks failed.
    Exchange(CodecError),
    /// A REST request to a manager failed.
    Client(reqwest::Error),
    /// Miscellaneous I/O failure outside the monitor's snapshot files.
    Io(io::Error),
    /// The operator requested a stop; owned subprocesses are torn down.
    Interrupted,
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClusterError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            ClusterError::ManagerLaunch { role, source } => {
                write!(f, "failed to start the {}: {}", role, source)
            }
            ClusterError::Submission(msg) => write!(f, "graph submission failed: {}", msg),
            ClusterError::MonitorIo(e) => {
                write!(f, "failed to persist a monitor snapshot: {}", e)
            }
            ClusterError::Exchange(e) => write!(f, "node list exchange failed: {}", e),
            ClusterError::Client(e) => write!(f, "manager request failed: {}", e),
            ClusterError::Io(e) => write!(f, "I/O error: {}", e),
            ClusterError::Interrupted => write!(f, "interrupted by the operator"),
        }
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        ClusterError::Client(e)
    }
}

impl From<io::Error> for ClusterError {
    fn from(e: io::Error) -> Self {
        ClusterError::Io(e)
    }
}

impl From<CodecError> for ClusterError {
    fn from(e: CodecError) -> Self {
        ClusterError::Exchange(e)
    }
}

/// Error raised by the exchange codec when node list notifications cannot be
/// encoded or decoded.
#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    /// Bincode serialization/deserialization error. Raised when a notification
    /// cannot be read back from the wire.
    Bincode(bincode::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Io(e) => write!(f, "{}", e),
            CodecError::Bincode(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Bincode(e)
    }
}
