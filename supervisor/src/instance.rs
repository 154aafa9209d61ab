//! One supervised process and the task that owns it.
//!
//! Every mutation of an instance (output, writes, resizes, kills, idle timer
//! expiry and exit) is a message handled by a single actor task, so the
//! activity state machine never sees two updates at once. Callers hold a
//! [`ProcessHandle`]: a mailbox sender plus a `watch` receiver carrying the
//! latest published [`ProcessState`].

use chrono::DateTime;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::backend::ExitInfo;
use crate::backend::PtyProcess;
use crate::backend::SpawnedPty;
use crate::config::ProcessConfig;
use crate::config::TerminalSize;
use crate::error::SupervisorError;
use crate::event::EventMetadata;
use crate::event::OutputChunk;
use crate::event::ProcessEvent;
use crate::event::ProcessEventKind;
use crate::fanout::Fanout;
use crate::fanout::Subscription;
use crate::process_id::ProcessId;
use crate::state::Activity;
use crate::state::ActivityTracker;
use crate::state::ProcessState;
use crate::state::ProcessStatus;
use crate::state::Transition;
use crate::timer::TimerHandle;
use crate::timer::TimerService;

const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(100);

type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

enum Command {
    Write { data: Vec<u8>, reply: Reply<()> },
    Resize { size: TerminalSize, reply: Reply<()> },
    Kill { reply: Reply<()> },
    IdleTimerFired { generation: u64 },
}

/// Timing knobs resolved from the supervisor config for one instance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InstanceSettings {
    pub idle_threshold: Duration,
    pub redraw_window: Duration,
}

#[derive(Debug)]
pub(crate) struct ProcessHandle {
    id: ProcessId,
    config: ProcessConfig,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ProcessState>,
    output: Arc<Fanout<OutputChunk>>,
    events: Arc<Fanout<ProcessEvent>>,
}

impl ProcessHandle {
    /// Starts the actor for a process the backend has already spawned and
    /// returns the handle together with the state right after start.
    pub fn start(
        config: ProcessConfig,
        spawned: SpawnedPty,
        settings: InstanceSettings,
        timer: Arc<dyn TimerService>,
    ) -> (Arc<Self>, ProcessState) {
        let id = config.id.clone();
        let now = Instant::now();
        let started_at = Utc::now();
        let SpawnedPty {
            process,
            output: output_rx,
            exit: exit_rx,
        } = spawned;
        let pid = process.pid();

        let mut tracker = ActivityTracker::new(settings.idle_threshold, settings.redraw_window, now);
        let spawned_transition = tracker.spawned(now);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let output = Arc::new(Fanout::new("output"));
        let events = Arc::new(Fanout::new("events"));

        let mut actor = InstanceActor {
            id: id.clone(),
            command: config.command_line(),
            process,
            tracker,
            mailbox: commands_rx,
            timer_sender: commands_tx.downgrade(),
            output_rx,
            output_open: true,
            exit_rx,
            exit_seen: false,
            timer,
            idle_timer: None,
            timer_generation: 0,
            state_tx: None,
            output: Arc::clone(&output),
            events: Arc::clone(&events),
            pid,
            started_at,
            size: config.terminal_size(),
            exit_code: None,
            exit_signal: None,
            error: None,
        };
        let initial = actor.snapshot();
        let (state_tx, state_rx) = watch::channel(initial.clone());
        actor.state_tx = Some(state_tx);
        // Nobody can be subscribed yet; this publishes the `Idle` state.
        if let Some(transition) = spawned_transition {
            actor.emit_transition(transition, EventMetadata::default());
        }

        info!(process_id = %id, pid, command = %actor.command, "process started");
        tokio::spawn(actor.run());

        let handle = Arc::new(Self {
            id,
            config,
            commands: commands_tx,
            state: state_rx,
            output,
            events,
        });
        (handle, initial)
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.borrow().status
    }

    pub fn subscribe_output<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&OutputChunk) + Send + Sync + 'static,
    {
        self.output.subscribe(handler)
    }

    pub fn subscribe_events<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ProcessEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.output.len() + self.events.len()
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<(), SupervisorError> {
        self.request("write", |reply| Command::Write { data, reply }).await
    }

    pub async fn resize(&self, size: TerminalSize) -> Result<(), SupervisorError> {
        self.request("resize", |reply| Command::Resize { size, reply }).await
    }

    /// Succeeds without doing anything if the process already stopped.
    pub async fn kill(&self) -> Result<(), SupervisorError> {
        match self.request("kill", |reply| Command::Kill { reply }).await {
            Err(SupervisorError::PermissionDenied { .. }) => Ok(()),
            other => other,
        }
    }

    /// Resolves once the instance reaches a terminal state.
    pub async fn wait_terminal(&self) -> ProcessState {
        let mut state = self.state.clone();
        match state.wait_for(|s| s.status.is_terminal()).await {
            Ok(s) => s.clone(),
            // Actor gone; its last published value is final.
            Err(_) => self.state(),
        }
    }

    async fn request<T>(
        &self,
        operation: &'static str,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(command(reply_tx)).is_err() {
            return Err(self.unavailable(operation));
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.unavailable(operation)),
        }
    }

    /// The actor only exits after publishing a terminal state, so a closed
    /// mailbox normally means the process is already stopped.
    fn unavailable(&self, operation: &'static str) -> SupervisorError {
        let status = self.status();
        if status.is_terminal() {
            SupervisorError::PermissionDenied {
                id: self.id.clone(),
                operation,
                status,
            }
        } else {
            SupervisorError::InstanceGone {
                id: self.id.clone(),
                operation,
            }
        }
    }
}

struct InstanceActor {
    id: ProcessId,
    command: String,
    process: Box<dyn PtyProcess>,
    tracker: ActivityTracker,
    mailbox: mpsc::UnboundedReceiver<Command>,
    // Weak so pending timers don't keep the actor alive after every handle
    // is gone.
    timer_sender: mpsc::WeakUnboundedSender<Command>,
    output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    output_open: bool,
    exit_rx: oneshot::Receiver<ExitInfo>,
    exit_seen: bool,
    timer: Arc<dyn TimerService>,
    idle_timer: Option<TimerHandle>,
    timer_generation: u64,
    state_tx: Option<watch::Sender<ProcessState>>,
    output: Arc<Fanout<OutputChunk>>,
    events: Arc<Fanout<ProcessEvent>>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    size: TerminalSize,
    exit_code: Option<i32>,
    exit_signal: Option<String>,
    error: Option<String>,
}

impl InstanceActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                // Commands first so a chatty process cannot starve a kill.
                command = self.mailbox.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.abandon();
                        break;
                    }
                },
                chunk = self.output_rx.recv(), if self.output_open => match chunk {
                    Some(data) => self.on_output(data),
                    None => self.output_open = false,
                },
                exit = &mut self.exit_rx, if !self.exit_seen => {
                    self.exit_seen = true;
                    self.on_exit(exit.unwrap_or_default()).await;
                }
            }
            if self.tracker.status().is_terminal() {
                break;
            }
        }
        self.cancel_idle_timer();
        debug!(process_id = %self.id, status = %self.tracker.status(), "process actor finished");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Write { data, reply } => {
                let result = self.on_write(data).await;
                let _ = reply.send(result);
            }
            Command::Resize { size, reply } => {
                let result = self.on_resize(size);
                let _ = reply.send(result);
            }
            Command::Kill { reply } => {
                let result = self.on_kill();
                let _ = reply.send(result);
            }
            Command::IdleTimerFired { generation } => self.on_idle_timer(generation),
        }
    }

    fn on_output(&mut self, data: Vec<u8>) {
        let activity = self.tracker.output(Instant::now());
        if activity.suppressed {
            trace!(process_id = %self.id, bytes = data.len(), "output treated as redraw");
        }
        self.apply_activity(activity);
        let chunk = OutputChunk::stdout(self.id.clone(), data);
        self.output.deliver(&chunk);
    }

    async fn on_write(&mut self, data: Vec<u8>) -> Result<(), SupervisorError> {
        self.ensure_live("write")?;
        match self.process.write(data).await {
            Ok(()) => {
                let activity = self.tracker.input(Instant::now());
                self.apply_activity(activity);
                Ok(())
            }
            Err(err) => {
                let message = format!("write failed: {err:#}");
                self.fail(message);
                Err(SupervisorError::backend(&self.id, "write", err))
            }
        }
    }

    fn on_resize(&mut self, size: TerminalSize) -> Result<(), SupervisorError> {
        self.ensure_live("resize")?;
        if let Err(err) = self.process.resize(size) {
            self.fail(format!("resize failed: {err:#}"));
            return Err(SupervisorError::backend(&self.id, "resize", err));
        }
        self.tracker.resized(Instant::now());
        self.size = size;
        debug!(process_id = %self.id, rows = size.rows, cols = size.cols, "terminal resized");
        self.publish();
        Ok(())
    }

    fn on_kill(&mut self) -> Result<(), SupervisorError> {
        self.ensure_live("kill")?;
        match self.process.kill() {
            Ok(()) => {
                info!(process_id = %self.id, "process killed");
                self.stop(ExitInfo::default(), Some("killed".to_string()));
                Ok(())
            }
            Err(err) => {
                // Losing the race with a natural exit is not a failure.
                if let Ok(exit) = self.exit_rx.try_recv() {
                    self.exit_seen = true;
                    info!(process_id = %self.id, exit_code = ?exit.code, "process exited before kill");
                    self.stop(exit, None);
                    return Ok(());
                }
                warn!(process_id = %self.id, error = %err, "failed to kill process");
                self.fail(format!("kill failed: {err:#}"));
                Err(SupervisorError::backend(&self.id, "kill", err))
            }
        }
    }

    fn on_idle_timer(&mut self, generation: u64) {
        if generation != self.timer_generation || self.tracker.status().is_terminal() {
            trace!(process_id = %self.id, generation, "ignoring stale idle timer");
            return;
        }
        self.idle_timer = None;
        let now = Instant::now();
        if let Some(transition) = self.tracker.idle_elapsed(now) {
            debug!(process_id = %self.id, "process went idle");
            self.emit_transition(transition, EventMetadata::default());
            return;
        }
        if self.tracker.status() == ProcessStatus::Running {
            let remaining = self.tracker.idle_remaining(now);
            self.schedule_idle_timer(remaining);
        }
    }

    async fn on_exit(&mut self, exit: ExitInfo) {
        self.drain_output().await;
        info!(
            process_id = %self.id,
            exit_code = ?exit.code,
            signal = ?exit.signal,
            "process exited"
        );
        self.stop(exit, None);
    }

    /// Output written just before exit may still be in flight from the
    /// reader. Take what arrives until the stream closes or the grace period
    /// runs out.
    async fn drain_output(&mut self) {
        let deadline = Instant::now() + EXIT_OUTPUT_GRACE;
        while self.output_open {
            match tokio::time::timeout_at(deadline, self.output_rx.recv()).await {
                Ok(Some(data)) => self.on_output(data),
                Ok(None) => self.output_open = false,
                Err(_) => break,
            }
        }
    }

    /// Every handle dropped without a kill. Nobody can observe this instance
    /// again, so reap the process.
    fn abandon(&mut self) {
        if self.tracker.status().is_terminal() {
            return;
        }
        if let Err(err) = self.process.kill() {
            debug!(process_id = %self.id, error = %err, "kill of abandoned process failed");
        }
        self.stop(ExitInfo::default(), Some("abandoned".to_string()));
    }

    fn ensure_live(&self, operation: &'static str) -> Result<(), SupervisorError> {
        let status = self.tracker.status();
        if status.is_terminal() {
            return Err(SupervisorError::PermissionDenied {
                id: self.id.clone(),
                operation,
                status,
            });
        }
        Ok(())
    }

    fn apply_activity(&mut self, activity: Activity) {
        if activity.reschedule {
            self.schedule_idle_timer(self.tracker.idle_threshold());
        }
        match activity.transition {
            Some(transition) => self.emit_transition(transition, EventMetadata::default()),
            None => self.publish(),
        }
    }

    fn stop(&mut self, exit: ExitInfo, message: Option<String>) {
        self.cancel_idle_timer();
        let Some(transition) = self.tracker.stopped() else {
            return;
        };
        self.exit_code = exit.code;
        self.exit_signal = exit.signal.clone();
        let metadata = EventMetadata {
            pid: self.pid,
            exit_code: exit.code,
            signal: exit.signal,
            message,
        };
        self.emit_transition(transition, metadata);
    }

    fn fail(&mut self, message: String) {
        self.cancel_idle_timer();
        let Some(transition) = self.tracker.failed() else {
            return;
        };
        warn!(process_id = %self.id, error = %message, "process entered error state");
        if let Err(err) = self.process.kill() {
            debug!(process_id = %self.id, error = %err, "cleanup kill failed");
        }
        self.error = Some(message.clone());
        let metadata = EventMetadata {
            pid: self.pid,
            message: Some(message),
            ..EventMetadata::default()
        };
        self.emit_transition(transition, metadata);
    }

    /// Publishes the new state, then tells event subscribers about it.
    fn emit_transition(&mut self, transition: Transition, mut metadata: EventMetadata) {
        self.publish();
        let kind = match (transition.from, transition.to) {
            (ProcessStatus::Starting, ProcessStatus::Idle) => {
                metadata.pid = self.pid;
                ProcessEventKind::Started
            }
            (_, ProcessStatus::Running) => ProcessEventKind::Active,
            (_, ProcessStatus::Idle) => ProcessEventKind::Idle,
            (_, ProcessStatus::Stopped) => ProcessEventKind::Stopped,
            (_, ProcessStatus::Error) => ProcessEventKind::Error,
            (_, ProcessStatus::Starting) => return,
        };
        trace!(process_id = %self.id, from = %transition.from, to = %transition.to, "state transition");
        self.events
            .deliver(&ProcessEvent::new(self.id.clone(), kind).with_metadata(metadata));
    }

    fn schedule_idle_timer(&mut self, delay: Duration) {
        self.cancel_idle_timer();
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let sender = self.timer_sender.clone();
        let handle = self.timer.after(
            delay,
            Box::new(move || {
                if let Some(sender) = sender.upgrade() {
                    let _ = sender.send(Command::IdleTimerFired { generation });
                }
            }),
        );
        self.idle_timer = Some(handle);
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(handle) = self.idle_timer.take() {
            handle.cancel();
        }
    }

    fn publish(&self) {
        if let Some(state_tx) = &self.state_tx {
            state_tx.send_replace(self.snapshot());
        }
    }

    fn snapshot(&self) -> ProcessState {
        ProcessState {
            id: self.id.clone(),
            command: self.command.clone(),
            status: self.tracker.status(),
            pid: self.pid,
            started_at: self.started_at,
            last_activity: self.tracker.last_activity_at(),
            idle_threshold: self.tracker.idle_threshold(),
            size: self.size,
            exit_code: self.exit_code,
            exit_signal: self.exit_signal.clone(),
            error: self.error.clone(),
        }
    }
}
