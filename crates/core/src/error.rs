use std::fmt;
use std::time::Duration;

/// Why a snapshot operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFailure {
    /// A snapshot with this name is already known to the machine.
    AlreadyExists,
    /// No snapshot with this name is known to the machine.
    NotFound,
    /// The hypervisor refused or failed the command.
    Rejected(String),
    /// The command did not complete within its deadline.
    TimedOut,
}

impl fmt::Display for SnapshotFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotFailure::AlreadyExists => write!(f, "snapshot already exists"),
            SnapshotFailure::NotFound => write!(f, "no such snapshot"),
            SnapshotFailure::Rejected(reason) => write!(f, "rejected: {reason}"),
            SnapshotFailure::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Errors that can occur when driving machines and networks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("machine failed to start: {0}")]
    StartupFailed(String),

    #[error("hypervisor process exited unexpectedly (exit code {exit_code:?})")]
    ProcessExited { exit_code: Option<i32> },

    #[error("cannot {operation} while machine is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("snapshot '{name}': {failure}")]
    Snapshot {
        name: String,
        failure: SnapshotFailure,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("pattern not found in console output: {pattern}")]
    PatternNotFound { pattern: String },

    #[error("no DHCP address observed for {mac} within {timeout:?}")]
    DhcpTimeout { mac: String, timeout: Duration },

    #[error("network resource error: {0}")]
    NetworkResource(String),

    #[error("control channel error: {0}")]
    Control(String),

    #[error("teardown failed: {}", .0.join("; "))]
    Teardown(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn snapshot(name: impl Into<String>, failure: SnapshotFailure) -> Self {
        Error::Snapshot {
            name: name.into(),
            failure,
        }
    }

    /// Returns true when the error means the hypervisor process is gone.
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Error::ProcessExited { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
