//! Boundary between the supervisor and whatever actually creates
//! pseudo-terminals. [`PortablePtyBackend`] is the default; tests plug in
//! scripted fakes.

mod portable;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::config::ProcessConfig;
use crate::config::TerminalSize;

pub use portable::PortablePtyBackend;

/// Everything a backend needs to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub size: TerminalSize,
}

impl From<&ProcessConfig> for SpawnRequest {
    fn from(config: &ProcessConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            env: config.env.clone(),
            size: config.terminal_size(),
        }
    }
}

/// How a process ended. Both fields are `None` when the backend lost track of
/// the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }
}

/// A freshly spawned process plus the streams it reports through.
pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    /// Raw terminal output in arrival order. Closes when the terminal does.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Fires once when the process exits. A dropped sender counts as an exit
    /// with unknown status.
    pub exit: oneshot::Receiver<ExitInfo>,
}

impl fmt::Debug for SpawnedPty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedPty")
            .field("pid", &self.process.pid())
            .finish_non_exhaustive()
    }
}

/// Control surface for one running process. Owned exclusively by its
/// instance actor.
#[async_trait]
pub trait PtyProcess: Send {
    fn pid(&self) -> Option<u32>;

    async fn write(&mut self, data: Vec<u8>) -> anyhow::Result<()>;

    fn resize(&mut self, size: TerminalSize) -> anyhow::Result<()>;

    fn kill(&mut self) -> anyhow::Result<()>;
}

pub trait PtyBackend: Send + Sync + fmt::Debug {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<SpawnedPty>;
}
