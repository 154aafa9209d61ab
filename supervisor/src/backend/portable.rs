use anyhow::Context;
use async_trait::async_trait;
use portable_pty::Child;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::TryLockError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use super::ExitInfo;
use super::PtyBackend;
use super::PtyProcess;
use super::SpawnRequest;
use super::SpawnedPty;
use crate::config::TerminalSize;

const READ_BUFFER_BYTES: usize = 8192;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long a child gets to act on SIGHUP before it is killed outright.
const KILL_GRACE: Duration = Duration::from_millis(250);

type SharedChild = Arc<StdMutex<Box<dyn Child + Send + Sync>>>;

/// Spawns processes on the host's native pseudo-terminal system. Must be used
/// from inside a tokio runtime; reads and waits run on the blocking pool.
#[derive(Debug, Default, Clone)]
pub struct PortablePtyBackend;

impl PortablePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyBackend for PortablePtyBackend {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<SpawnedPty> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(request.size))
            .context("failed to open pseudo-terminal")?;

        let mut command_builder = CommandBuilder::new(&request.command);
        command_builder.args(&request.args);
        let cwd = match &request.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().context("failed to resolve working directory")?,
        };
        command_builder.cwd(cwd);
        for (key, value) in &request.env {
            command_builder.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(command_builder)
            .with_context(|| format!("failed to start {}", request.command))?;
        // Keeping the slave open would hide EOF from the reader after exit.
        drop(pair.slave);
        let pid = child.process_id();
        let killer = child.clone_killer();

        let mut reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;

        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    // EIO once the child side is gone.
                    Err(_) => break,
                }
            }
        });

        let child: SharedChild = Arc::new(StdMutex::new(child));
        let (exit_tx, exit_rx) = oneshot::channel::<ExitInfo>();
        tokio::spawn(watch_exit(Arc::clone(&child), pid, exit_tx));

        debug!(pid, command = %request.command, "spawned pty process");
        Ok(SpawnedPty {
            process: Box::new(PortablePtyProcess {
                master: pair.master,
                writer: Arc::new(StdMutex::new(writer)),
                killer,
                child,
                pid,
            }),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

/// Polls the child instead of blocking in `wait()` so `kill` can still reach
/// it. Skips a tick while a kill escalation holds the lock.
async fn watch_exit(child: SharedChild, pid: Option<u32>, exit_tx: oneshot::Sender<ExitInfo>) {
    let info = loop {
        let polled = match child.try_lock() {
            Ok(mut child) => Some(child.try_wait()),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner().try_wait()),
            Err(TryLockError::WouldBlock) => None,
        };
        match polled {
            Some(Ok(Some(status))) => {
                let code = status.exit_code() as i32;
                break match status.signal() {
                    Some(signal) => ExitInfo {
                        code: Some(code),
                        signal: Some(signal.to_string()),
                    },
                    None => ExitInfo::code(code),
                };
            }
            Some(Err(err)) => {
                warn!(error = ?err, pid, "failed to wait for pty child");
                break ExitInfo::default();
            }
            Some(Ok(None)) | None => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
        }
    };
    let _ = exit_tx.send(info);
}

/// Kills the child if it is still running after the grace period. Checking
/// `try_wait` under the lock first keeps a reaped pid from being signalled.
fn escalate_kill(child: &SharedChild, pid: Option<u32>) {
    std::thread::sleep(KILL_GRACE);
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    if let Ok(None) = child.try_wait() {
        debug!(pid, "child survived SIGHUP; killing");
        if let Err(err) = child.kill() {
            warn!(error = %err, pid, "failed to force-kill pty child");
        }
    }
}

struct PortablePtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Arc<StdMutex<Box<dyn Write + Send>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    child: SharedChild,
    pid: Option<u32>,
}

#[async_trait]
impl PtyProcess for PortablePtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut guard = writer
                .lock()
                .map_err(|_| anyhow::anyhow!("pty writer poisoned"))?;
            guard.write_all(&data)?;
            guard.flush()?;
            Ok(())
        })
        .await
        .context("pty writer task failed")?
    }

    fn resize(&mut self, size: TerminalSize) -> anyhow::Result<()> {
        self.master.resize(pty_size(size))
    }

    /// Sends SIGHUP now and SIGKILL later if the child ignores it.
    fn kill(&mut self) -> anyhow::Result<()> {
        {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            self.killer.kill().context("failed to kill pty child")?;
        }
        let child = Arc::clone(&self.child);
        let pid = self.pid;
        tokio::task::spawn_blocking(move || escalate_kill(&child, pid));
        Ok(())
    }
}
