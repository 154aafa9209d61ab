use thiserror::Error;

use crate::process_id::ProcessId;
use crate::state::ProcessStatus;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown process id {id}")]
    ProcessNotFound { id: ProcessId },
    #[error("process {id} is already running")]
    AlreadyRunning { id: ProcessId },
    #[error("failed to spawn process {id}: {source}")]
    SpawnFailed {
        id: ProcessId,
        #[source]
        source: anyhow::Error,
    },
    #[error("process {id} is {status}; {operation} is not permitted")]
    PermissionDenied {
        id: ProcessId,
        operation: &'static str,
        status: ProcessStatus,
    },
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },
    #[error("{operation} failed for process {id}: {source}")]
    Backend {
        id: ProcessId,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("process {id} shut down before completing {operation}")]
    InstanceGone {
        id: ProcessId,
        operation: &'static str,
    },
}

impl SupervisorError {
    pub(crate) fn not_found(id: &ProcessId) -> Self {
        Self::ProcessNotFound { id: id.clone() }
    }

    pub(crate) fn already_running(id: &ProcessId) -> Self {
        Self::AlreadyRunning { id: id.clone() }
    }

    pub(crate) fn spawn_failed(id: &ProcessId, source: anyhow::Error) -> Self {
        Self::SpawnFailed {
            id: id.clone(),
            source,
        }
    }

    pub(crate) fn backend(id: &ProcessId, operation: &'static str, source: anyhow::Error) -> Self {
        Self::Backend {
            id: id.clone(),
            operation,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
