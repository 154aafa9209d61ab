use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

use crate::process_id::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    /// Pseudo-terminals merge stderr into the same stream.
    Stdout,
}

/// One unit of terminal output. Delivered to current subscribers and then
/// dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputChunk {
    pub process_id: ProcessId,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub channel: OutputChannel,
}

impl OutputChunk {
    pub(crate) fn stdout(process_id: ProcessId, data: Vec<u8>) -> Self {
        Self {
            process_id,
            data,
            timestamp: Utc::now(),
            channel: OutputChannel::Stdout,
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEventKind {
    /// The process came up. This fires inside `spawn`, before any handler
    /// can be registered for the id, so callers learn about it from the
    /// state `spawn` returns rather than from a subscription.
    Started,
    Active,
    Idle,
    Stopped,
    Error,
}

impl fmt::Display for ProcessEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessEventKind::Started => write!(f, "started"),
            ProcessEventKind::Active => write!(f, "active"),
            ProcessEventKind::Idle => write!(f, "idle"),
            ProcessEventKind::Stopped => write!(f, "stopped"),
            ProcessEventKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lifecycle notification for one process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessEvent {
    pub process_id: ProcessId,
    pub kind: ProcessEventKind,
    pub timestamp: DateTime<Utc>,
    pub metadata: EventMetadata,
}

impl ProcessEvent {
    pub(crate) fn new(process_id: ProcessId, kind: ProcessEventKind) -> Self {
        Self {
            process_id,
            kind,
            timestamp: Utc::now(),
            metadata: EventMetadata::default(),
        }
    }

    pub(crate) fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
