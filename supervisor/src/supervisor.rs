use std::sync::Arc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::PortablePtyBackend;
use crate::backend::PtyBackend;
use crate::backend::SpawnRequest;
use crate::config::ProcessConfig;
use crate::config::SupervisorConfig;
use crate::config::TerminalSize;
use crate::error::SupervisorError;
use crate::event::OutputChunk;
use crate::event::ProcessEvent;
use crate::fanout::Subscription;
use crate::instance::InstanceSettings;
use crate::instance::ProcessHandle;
use crate::process_id::ProcessId;
use crate::registry::KillTarget;
use crate::registry::Registry;
use crate::state::ProcessState;
use crate::timer::TimerService;
use crate::timer::TokioTimer;

/// Owns every supervised process. Cheap to clone; clones share the same
/// registry.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: SupervisorConfig,
    registry: Registry,
    backend: Arc<dyn PtyBackend>,
    timer: Arc<dyn TimerService>,
}

impl Supervisor {
    /// Uses the host pseudo-terminal system and the current tokio runtime.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_backend(
            config,
            Arc::new(PortablePtyBackend::new()),
            Arc::new(TokioTimer::current()),
        )
    }

    pub fn with_backend(
        config: SupervisorConfig,
        backend: Arc<dyn PtyBackend>,
        timer: Arc<dyn TimerService>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Registry::new(),
                backend,
                timer,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Starts `config.command` on a new pseudo-terminal. Returns the state
    /// right after start, which is `Idle` unless a concurrent kill already
    /// stopped it.
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ProcessState, SupervisorError> {
        let size = config.terminal_size();
        if !size.is_valid() {
            return Err(SupervisorError::InvalidSize {
                rows: size.rows,
                cols: size.cols,
            });
        }
        let id = config.id.clone();
        // Released on every early return, and if this future is dropped.
        let reservation = self.inner.registry.reserve(&id)?;

        let request = SpawnRequest::from(&config);
        let spawned = match self.inner.backend.spawn(&request) {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(process_id = %id, command = %config.command_line(), error = %err, "failed to spawn process");
                return Err(SupervisorError::spawn_failed(&id, err));
            }
        };

        let settings = InstanceSettings {
            idle_threshold: self.inner.config.idle_threshold_for(&config),
            redraw_window: self.inner.config.redraw_suppression(),
        };
        let (handle, state) =
            ProcessHandle::start(config, spawned, settings, Arc::clone(&self.inner.timer));

        if reservation.commit(Arc::clone(&handle)).is_err() {
            debug!(process_id = %id, "spawn cancelled by concurrent kill");
            if let Err(err) = handle.kill().await {
                warn!(process_id = %id, error = %err, "failed to kill cancelled spawn");
            }
            return Ok(handle.state());
        }
        Ok(state)
    }

    /// Terminates the process and forgets it. Killing an instance that
    /// already stopped just removes it.
    pub async fn kill(&self, id: &ProcessId) -> Result<(), SupervisorError> {
        match self.inner.registry.claim_for_kill(id) {
            KillTarget::Live(handle) => self.kill_handle(id, &handle).await,
            KillTarget::PendingSpawn => Ok(()),
            KillTarget::Missing => Err(SupervisorError::not_found(id)),
        }
    }

    async fn kill_handle(
        &self,
        id: &ProcessId,
        handle: &Arc<ProcessHandle>,
    ) -> Result<(), SupervisorError> {
        let result = handle.kill().await;
        // Removed even when the kill failed; the instance is in `Error` then.
        self.inner.registry.remove_if_same(id, handle);
        result
    }

    /// Kills the process, waits for the settle delay and spawns it again
    /// with the configuration it was started with.
    pub async fn restart(&self, id: &ProcessId) -> Result<ProcessState, SupervisorError> {
        let handle = self.inner.registry.lookup(id)?;
        let config = handle.config().clone();
        info!(process_id = %id, "restarting process");
        self.kill_handle(id, &handle).await?;
        tokio::time::sleep(self.inner.config.restart_settle()).await;
        self.spawn(config).await
    }

    pub async fn write(
        &self,
        id: &ProcessId,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), SupervisorError> {
        let handle = self.inner.registry.lookup(id)?;
        handle.write(data.into()).await
    }

    pub async fn resize(
        &self,
        id: &ProcessId,
        rows: u16,
        cols: u16,
    ) -> Result<(), SupervisorError> {
        let size = TerminalSize::new(rows, cols);
        if !size.is_valid() {
            return Err(SupervisorError::InvalidSize { rows, cols });
        }
        let handle = self.inner.registry.lookup(id)?;
        handle.resize(size).await
    }

    pub async fn get_state(&self, id: &ProcessId) -> Result<ProcessState, SupervisorError> {
        Ok(self.inner.registry.lookup(id)?.state())
    }

    /// Every registered process, including stopped ones not yet replaced or
    /// killed, sorted by id.
    pub async fn list_processes(&self) -> Vec<ProcessState> {
        self.inner.registry.snapshot_all()
    }

    /// Registers `handler` for output chunks from `id`. Only chunks produced
    /// after this call are delivered.
    pub async fn subscribe<F>(&self, id: &ProcessId, handler: F) -> Result<Subscription, SupervisorError>
    where
        F: Fn(&OutputChunk) + Send + Sync + 'static,
    {
        let handle = self.inner.registry.lookup(id)?;
        Ok(handle.subscribe_output(handler))
    }

    /// Registers `handler` for lifecycle events from `id`.
    pub async fn subscribe_to_events<F>(
        &self,
        id: &ProcessId,
        handler: F,
    ) -> Result<Subscription, SupervisorError>
    where
        F: Fn(&ProcessEvent) + Send + Sync + 'static,
    {
        let handle = self.inner.registry.lookup(id)?;
        Ok(handle.subscribe_events(handler))
    }

    /// Output plus event handlers currently registered on `id`.
    pub async fn subscriber_count(&self, id: &ProcessId) -> Result<usize, SupervisorError> {
        Ok(self.inner.registry.lookup(id)?.subscriber_count())
    }

    /// Waits until `id` stops or fails and returns its final state.
    pub async fn wait(&self, id: &ProcessId) -> Result<ProcessState, SupervisorError> {
        let handle = self.inner.registry.lookup(id)?;
        Ok(handle.wait_terminal().await)
    }

    /// Kills every process and empties the registry.
    pub async fn shutdown(&self) {
        let handles = self.inner.registry.drain();
        info!(count = handles.len(), "shutting down supervisor");
        let kills = handles.iter().map(|handle| async move {
            if let Err(err) = handle.kill().await {
                warn!(error = %err, "failed to kill process during shutdown");
            }
        });
        futures::future::join_all(kills).await;
    }
}
