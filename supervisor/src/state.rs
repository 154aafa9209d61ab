//! Activity state machine for one supervised process.
//!
//! [`ActivityTracker`] is a pure value: callers pass the current instant into
//! every method and act on the returned [`Transition`]. The instance actor is
//! its only owner, which is what makes the idle check and the transition it
//! guards a single step.

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::TerminalSize;
use crate::process_id::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Idle,
    Stopped,
    Error,
}

impl ProcessStatus {
    /// `Starting`, `Running` and `Idle` count as live for the registry.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Idle)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        match (self, next) {
            (Starting, Idle) => true,
            (Idle, Running) | (Running, Idle) => true,
            (Running | Idle, Stopped) => true,
            (Starting | Running | Idle, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Idle => write!(f, "idle"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time copy of a process's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessState {
    pub id: ProcessId,
    pub command: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub idle_threshold: Duration,
    pub size: TerminalSize,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: ProcessStatus,
    pub to: ProcessStatus,
}

/// Result of feeding one piece of activity into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Activity {
    pub transition: Option<Transition>,
    /// Output landed inside the post-resize window and was treated as a
    /// repaint.
    pub suppressed: bool,
    /// The idle timer must be restarted.
    pub reschedule: bool,
}

impl Activity {
    fn ignored() -> Self {
        Self {
            transition: None,
            suppressed: false,
            reschedule: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ActivityTracker {
    status: ProcessStatus,
    idle_threshold: Duration,
    redraw_window: Duration,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    last_resize: Option<Instant>,
}

impl ActivityTracker {
    pub fn new(idle_threshold: Duration, redraw_window: Duration, now: Instant) -> Self {
        Self {
            status: ProcessStatus::Starting,
            idle_threshold,
            redraw_window,
            last_activity: now,
            last_activity_at: Utc::now(),
            last_resize: None,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Backend confirmed the spawn. A fresh terminal counts as idle until it
    /// produces something.
    pub fn spawned(&mut self, now: Instant) -> Option<Transition> {
        self.touch(now);
        self.transition_to(ProcessStatus::Idle)
    }

    /// Output arrived from the terminal.
    pub fn output(&mut self, now: Instant) -> Activity {
        if self.status.is_terminal() {
            return Activity::ignored();
        }
        self.touch(now);
        let suppressed = self.within_redraw_window(now);
        let transition = if suppressed || self.status != ProcessStatus::Idle {
            None
        } else {
            self.transition_to(ProcessStatus::Running)
        };
        Activity {
            transition,
            suppressed,
            reschedule: true,
        }
    }

    /// Caller wrote to the terminal. Input is never classified as a redraw.
    pub fn input(&mut self, now: Instant) -> Activity {
        if self.status.is_terminal() {
            return Activity::ignored();
        }
        self.touch(now);
        let transition = if self.status == ProcessStatus::Idle {
            self.transition_to(ProcessStatus::Running)
        } else {
            None
        };
        Activity {
            transition,
            suppressed: false,
            reschedule: true,
        }
    }

    pub fn resized(&mut self, now: Instant) {
        if self.status.is_live() {
            self.last_resize = Some(now);
        }
    }

    /// Re-checks elapsed time against the threshold and moves a running
    /// process to idle. Returns `None` when newer activity has reset the
    /// clock or the process is not running.
    pub fn idle_elapsed(&mut self, now: Instant) -> Option<Transition> {
        if self.status != ProcessStatus::Running {
            return None;
        }
        if now.saturating_duration_since(self.last_activity) < self.idle_threshold {
            return None;
        }
        self.transition_to(ProcessStatus::Idle)
    }

    /// Time left until the idle threshold is reached, measured from `now`.
    pub fn idle_remaining(&self, now: Instant) -> Duration {
        self.idle_threshold
            .saturating_sub(now.saturating_duration_since(self.last_activity))
    }

    pub fn stopped(&mut self) -> Option<Transition> {
        self.transition_to(ProcessStatus::Stopped)
    }

    pub fn failed(&mut self) -> Option<Transition> {
        self.transition_to(ProcessStatus::Error)
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_activity_at = Utc::now();
    }

    fn within_redraw_window(&self, now: Instant) -> bool {
        self.last_resize
            .is_some_and(|at| now.saturating_duration_since(at) < self.redraw_window)
    }

    fn transition_to(&mut self, next: ProcessStatus) -> Option<Transition> {
        if !self.status.can_transition_to(next) {
            return None;
        }
        let from = self.status;
        self.status = next;
        Some(Transition { from, to: next })
    }
}
