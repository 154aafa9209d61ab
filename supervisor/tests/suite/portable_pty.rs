//! End-to-end runs against the host pseudo-terminal system.

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use ptysup_supervisor::OutputChunk;
use ptysup_supervisor::ProcessConfig;
use ptysup_supervisor::ProcessEvent;
use ptysup_supervisor::ProcessEventKind;
use ptysup_supervisor::ProcessId;
use ptysup_supervisor::ProcessStatus;
use ptysup_supervisor::Supervisor;
use ptysup_supervisor::SupervisorError;
use ptysup_supervisor::TerminalSize;
use ptysup_test_support::Recorder;
use ptysup_test_support::config_with_idle;
use ptysup_test_support::skip_if_no_pty;
use ptysup_test_support::wait_for_status;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn joined(chunks: &[OutputChunk]) -> String {
    chunks.iter().map(|chunk| chunk.text()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_loop_goes_idle_active_idle_then_stops() -> anyhow::Result<()> {
    skip_if_no_pty!(Ok(()));

    let supervisor = Supervisor::new(config_with_idle(Duration::from_millis(200)));
    let id = ProcessId::from("echo");
    let state = supervisor
        .spawn(ProcessConfig::new("echo", "/bin/sh").args([
            "-c",
            "while read line; do echo \"got:$line\"; done",
        ]))
        .await?;
    assert_eq!(state.status, ProcessStatus::Idle);
    assert!(state.pid.is_some());

    let output: Recorder<OutputChunk> = Recorder::new();
    let events: Recorder<ProcessEvent> = Recorder::new();
    supervisor.subscribe(&id, output.handler()).await?;
    supervisor
        .subscribe_to_events(&id, events.handler())
        .await?;

    supervisor.write(&id, "hello\n").await?;
    assert!(
        output
            .wait_for(WAIT, |chunks| joined(chunks).contains("got:hello"))
            .await
    );
    wait_for_status(&supervisor, &id, ProcessStatus::Idle, WAIT).await?;

    supervisor.write(&id, "again\n").await?;
    assert_eq!(
        supervisor.get_state(&id).await?.status,
        ProcessStatus::Running
    );

    supervisor.kill(&id).await?;
    let seen_output = output.len();
    let seen_events = events.len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(output.len(), seen_output);
    assert_eq!(events.len(), seen_events);

    let kinds: Vec<ProcessEventKind> = events.items().iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&ProcessEventKind::Active));
    assert!(kinds.contains(&ProcessEventKind::Idle));
    assert_eq!(kinds.last(), Some(&ProcessEventKind::Stopped));
    assert_matches!(
        supervisor.get_state(&id).await,
        Err(SupervisorError::ProcessNotFound { .. })
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_code_and_trailing_output_are_reported() -> anyhow::Result<()> {
    skip_if_no_pty!(Ok(()));

    let supervisor = Supervisor::new(config_with_idle(Duration::from_secs(5)));
    let id = ProcessId::from("exit");
    supervisor
        .spawn(ProcessConfig::new("exit", "/bin/sh").args(["-c", "sleep 0.3; printf done; exit 7"]))
        .await?;
    let output: Recorder<OutputChunk> = Recorder::new();
    supervisor.subscribe(&id, output.handler()).await?;

    let state = supervisor.wait(&id).await?;
    assert_eq!(state.status, ProcessStatus::Stopped);
    assert_eq!(state.exit_code, Some(7));
    assert!(joined(&output.items()).contains("done"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resize_reaches_the_terminal() -> anyhow::Result<()> {
    skip_if_no_pty!(Ok(()));

    let supervisor = Supervisor::new(config_with_idle(Duration::from_secs(5)));
    let id = ProcessId::from("resize");
    supervisor
        .spawn(ProcessConfig::new("resize", "/bin/sh").args(["-c", "read line; stty size"]))
        .await?;
    let output: Recorder<OutputChunk> = Recorder::new();
    supervisor.subscribe(&id, output.handler()).await?;

    supervisor.resize(&id, 33, 101).await?;
    assert_eq!(
        supervisor.get_state(&id).await?.size,
        TerminalSize::new(33, 101)
    );
    supervisor.write(&id, "go\n").await?;
    assert!(
        output
            .wait_for(WAIT, |chunks| joined(chunks).contains("33 101"))
            .await
    );

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_binary_fails_to_spawn() {
    skip_if_no_pty!(());

    let supervisor = Supervisor::new(config_with_idle(Duration::from_secs(5)));
    assert_matches!(
        supervisor
            .spawn(ProcessConfig::new("nope", "/definitely/not/a/binary"))
            .await,
        Err(SupervisorError::SpawnFailed { .. })
    );
    assert!(supervisor.list_processes().await.is_empty());
}

fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_reaps_a_child_that_ignores_sighup() -> anyhow::Result<()> {
    skip_if_no_pty!(Ok(()));

    let supervisor = Supervisor::new(config_with_idle(Duration::from_secs(5)));
    let id = ProcessId::from("stubborn");
    let state = supervisor
        .spawn(ProcessConfig::new("stubborn", "/bin/sh").args([
            "-c",
            "trap '' HUP; read go; echo armed; exec sleep 30",
        ]))
        .await?;
    let Some(pid) = state.pid else {
        anyhow::bail!("spawned process has no pid");
    };
    let output: Recorder<OutputChunk> = Recorder::new();
    supervisor.subscribe(&id, output.handler()).await?;
    supervisor.write(&id, "go\n").await?;
    assert!(
        output
            .wait_for(WAIT, |chunks| joined(chunks).contains("armed"))
            .await
    );

    supervisor.kill(&id).await?;

    let deadline = tokio::time::Instant::now() + WAIT;
    while pid_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!pid_alive(pid), "pid {pid} survived kill");
    Ok(())
}
