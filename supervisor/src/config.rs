use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::process_id::ProcessId;

pub const DEFAULT_IDLE_THRESHOLD_MS: u64 = 5_000;
pub const MIN_IDLE_THRESHOLD_MS: u64 = 10;
pub const MAX_IDLE_THRESHOLD_MS: u64 = 86_400_000; // 24h
pub const DEFAULT_REDRAW_SUPPRESSION_MS: u64 = 2_000;
const MAX_REDRAW_SUPPRESSION_MS: u64 = 60_000;
pub const DEFAULT_RESTART_SETTLE_MS: u64 = 100;
const MAX_RESTART_SETTLE_MS: u64 = 10_000;
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

/// What to run and how. Retained by the supervisor so `restart` can re-spawn
/// the same command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub id: ProcessId,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default)]
    pub idle_threshold_ms: Option<u64>,
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

impl ProcessConfig {
    pub fn new(id: impl Into<ProcessId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            idle_threshold_ms: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold_ms = Some(duration_to_ms(threshold));
        self
    }

    pub fn terminal_size(&self) -> TerminalSize {
        TerminalSize::new(self.rows, self.cols)
    }

    /// Preview of the command line for logs and snapshots.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        format!("{} {}", self.command, self.args.join(" "))
    }
}

/// Supervisor-wide settings, usually loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub idle_threshold_ms: u64,
    pub redraw_suppression_ms: u64,
    pub restart_settle_ms: u64,
    pub default_rows: u16,
    pub default_cols: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            redraw_suppression_ms: DEFAULT_REDRAW_SUPPRESSION_MS,
            restart_settle_ms: DEFAULT_RESTART_SETTLE_MS,
            default_rows: DEFAULT_ROWS,
            default_cols: DEFAULT_COLS,
        }
    }
}

impl SupervisorConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(
            self.idle_threshold_ms
                .clamp(MIN_IDLE_THRESHOLD_MS, MAX_IDLE_THRESHOLD_MS),
        )
    }

    /// Threshold for one process: its own override, else the supervisor default.
    pub fn idle_threshold_for(&self, process: &ProcessConfig) -> Duration {
        match process.idle_threshold_ms {
            Some(ms) => {
                Duration::from_millis(ms.clamp(MIN_IDLE_THRESHOLD_MS, MAX_IDLE_THRESHOLD_MS))
            }
            None => self.idle_threshold(),
        }
    }

    pub fn redraw_suppression(&self) -> Duration {
        Duration::from_millis(self.redraw_suppression_ms.min(MAX_REDRAW_SUPPRESSION_MS))
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms.min(MAX_RESTART_SETTLE_MS))
    }

    pub fn default_size(&self) -> TerminalSize {
        TerminalSize::new(self.default_rows, self.default_cols)
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
