use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use ptysup_supervisor::OutputChunk;
use ptysup_supervisor::ProcessConfig;
use ptysup_supervisor::ProcessEvent;
use ptysup_supervisor::ProcessId;
use ptysup_supervisor::ProcessStatus;
use ptysup_supervisor::Supervisor;
use ptysup_supervisor::SupervisorConfig;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Exit code reported when Ctrl-C ends the run.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Supervisor config file. Defaults to `ptysup/config.toml` in the
    /// platform config directory when present.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Identifier for the supervised process.
    #[arg(long = "id", value_name = "ID", default_value = "main")]
    pub id: String,

    /// Silence, in milliseconds, after which the process counts as idle.
    #[arg(long = "idle-ms", value_name = "MS")]
    pub idle_ms: Option<u64>,

    /// Working directory for the command.
    #[arg(long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Print lifecycle events as JSON lines on stderr.
    #[arg(long = "json-events", default_value_t = false)]
    pub json_events: bool,

    /// Command to run, followed by its arguments.
    #[arg(trailing_var_arg = true, required = true, num_args = 1.., value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl RunCommand {
    fn supervisor_config(&self) -> Result<SupervisorConfig> {
        let mut config = crate::load_config(self.config.as_deref())?;
        if let Some(idle_ms) = self.idle_ms {
            config.idle_threshold_ms = idle_ms;
        }
        Ok(config)
    }

    fn process_config(&self, config: &SupervisorConfig) -> Result<ProcessConfig> {
        let Some((program, args)) = self.command.split_first() else {
            anyhow::bail!("no command given");
        };
        let size = config.default_size();
        let mut process = ProcessConfig::new(self.id.as_str(), program.as_str())
            .args(args.iter().cloned())
            .size(size.rows, size.cols);
        if let Some(cwd) = &self.cwd {
            process = process.cwd(cwd.clone());
        }
        Ok(process)
    }
}

pub async fn run(command: RunCommand) -> Result<i32> {
    let config = command.supervisor_config()?;
    let process = command.process_config(&config)?;
    let id = ProcessId::new(command.id.clone());
    let supervisor = Supervisor::new(config);

    supervisor
        .spawn(process)
        .await
        .with_context(|| format!("failed to start {}", command.command.join(" ")))?;

    supervisor.subscribe(&id, print_output).await?;
    if command.json_events {
        supervisor.subscribe_to_events(&id, print_event_json).await?;
    } else {
        supervisor.subscribe_to_events(&id, log_event).await?;
    }

    let forwarder = tokio::spawn(forward_stdin(supervisor.clone(), id.clone()));

    let exit_code = tokio::select! {
        state = supervisor.wait(&id) => {
            let state = state?;
            match state.status {
                ProcessStatus::Error => 1,
                _ => state.exit_code.unwrap_or(1),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(process_id = %id, "interrupted; shutting down");
            INTERRUPTED_EXIT_CODE
        }
    };

    forwarder.abort();
    supervisor.shutdown().await;
    Ok(exit_code)
}

fn print_output(chunk: &OutputChunk) {
    let mut stdout = std::io::stdout().lock();
    if let Err(err) = stdout.write_all(&chunk.data).and_then(|()| stdout.flush()) {
        debug!(error = %err, "failed to write output chunk");
    }
}

fn print_event_json(event: &ProcessEvent) {
    match serde_json::to_string(event) {
        Ok(line) => eprintln!("{line}"),
        Err(err) => warn!(error = %err, "failed to encode event"),
    }
}

fn log_event(event: &ProcessEvent) {
    info!(
        process_id = %event.process_id,
        kind = %event.kind,
        exit_code = ?event.metadata.exit_code,
        message = ?event.metadata.message,
        "process event"
    );
}

/// Sends each stdin line to the process until stdin closes.
async fn forward_stdin(supervisor: Supervisor, id: ProcessId) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                line.push('\n');
                if let Err(err) = supervisor.write(&id, line).await {
                    debug!(process_id = %id, error = %err, "stopped forwarding stdin");
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "failed to read stdin");
                return;
            }
        }
    }
}
