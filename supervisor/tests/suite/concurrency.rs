use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use ptysup_supervisor::ProcessConfig;
use ptysup_supervisor::ProcessEvent;
use ptysup_supervisor::ProcessEventKind;
use ptysup_supervisor::ProcessId;
use ptysup_supervisor::ProcessStatus;
use ptysup_supervisor::SupervisorConfig;
use ptysup_supervisor::SupervisorError;
use ptysup_test_support::Recorder;
use ptysup_test_support::fake_supervisor;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_spawns_of_one_id_admit_exactly_one() {
    let (supervisor, backend) = fake_supervisor(SupervisorConfig::default());

    let attempts: Vec<_> = (0..8)
        .map(|i| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .spawn(ProcessConfig::new("shared", format!("cmd-{i}")))
                    .await
            })
        })
        .collect();

    let mut won = 0;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.expect("spawn task") {
            Ok(_) => won += 1,
            Err(SupervisorError::AlreadyRunning { .. }) => rejected += 1,
            Err(other) => panic!("unexpected spawn error: {other}"),
        }
    }

    assert_eq!((won, rejected), (1, 7));
    assert_eq!(backend.spawn_count(), 1);
    assert_eq!(supervisor.list_processes().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_during_spawn_tears_the_new_process_down() {
    let (supervisor, backend) = fake_supervisor(SupervisorConfig::default());
    backend.set_spawn_delay(Duration::from_millis(200));
    let id = ProcessId::from("slow");

    let spawner = supervisor.clone();
    let spawn = tokio::spawn(async move { spawner.spawn(ProcessConfig::new("slow", "sh")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Not visible yet, but the kill is accepted and cancels the spawn.
    assert_matches!(
        supervisor.get_state(&id).await,
        Err(SupervisorError::ProcessNotFound { .. })
    );
    supervisor.kill(&id).await.expect("kill in-flight spawn");

    let state = spawn.await.expect("spawn task").expect("spawn");
    assert_eq!(state.status, ProcessStatus::Stopped);
    assert_eq!(backend.latest().kill_count(), 1);
    assert_matches!(
        supervisor.get_state(&id).await,
        Err(SupervisorError::ProcessNotFound { .. })
    );

    // The id is free again.
    backend.set_spawn_delay(Duration::ZERO);
    supervisor
        .spawn(ProcessConfig::new("slow", "sh"))
        .await
        .expect("respawn");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_racing_writes_ends_stopped() {
    let (supervisor, backend) = fake_supervisor(SupervisorConfig::default());
    let id = ProcessId::from("a");
    supervisor
        .spawn(ProcessConfig::new("a", "sh"))
        .await
        .expect("spawn");
    let events: Recorder<ProcessEvent> = Recorder::new();
    supervisor
        .subscribe_to_events(&id, events.handler())
        .await
        .expect("subscribe");

    let writer = supervisor.clone();
    let writer_id = id.clone();
    let writes = tokio::spawn(async move {
        for i in 0..200 {
            match writer.write(&writer_id, format!("{i}\n")).await {
                Ok(()) => {}
                Err(SupervisorError::PermissionDenied { .. })
                | Err(SupervisorError::ProcessNotFound { .. }) => break,
                Err(other) => panic!("unexpected write error: {other}"),
            }
            tokio::task::yield_now().await;
        }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    supervisor.kill(&id).await.expect("kill");
    writes.await.expect("writer task");

    assert_eq!(backend.latest().kill_count(), 1);
    let kinds: Vec<ProcessEventKind> = events.items().iter().map(|e| e.kind).collect();
    assert_eq!(kinds.last(), Some(&ProcessEventKind::Stopped));
    assert_eq!(
        kinds
            .iter()
            .filter(|kind| **kind == ProcessEventKind::Stopped)
            .count(),
        1
    );
    assert_matches!(
        supervisor.get_state(&id).await,
        Err(SupervisorError::ProcessNotFound { .. })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshots_never_show_half_started_instances() {
    let (supervisor, backend) = fake_supervisor(SupervisorConfig::default());
    backend.set_spawn_delay(Duration::from_millis(2));

    let churn = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            for round in 0..20 {
                let id = format!("p{}", round % 4);
                let _ = supervisor.spawn(ProcessConfig::new(id.as_str(), "sh")).await;
                if round % 3 == 0 {
                    let _ = supervisor.kill(&ProcessId::from(id)).await;
                }
            }
        })
    };

    while !churn.is_finished() {
        for state in supervisor.list_processes().await {
            assert_ne!(state.status, ProcessStatus::Starting);
            assert!(state.pid.is_some());
        }
        tokio::task::yield_now().await;
    }
    churn.await.expect("churn task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_in_flight_spawn() {
    let (supervisor, backend) = fake_supervisor(SupervisorConfig::default());
    supervisor
        .spawn(ProcessConfig::new("ready", "sh"))
        .await
        .expect("spawn");
    backend.set_spawn_delay(Duration::from_millis(200));

    let spawner = supervisor.clone();
    let spawn = tokio::spawn(async move { spawner.spawn(ProcessConfig::new("late", "sh")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    supervisor.shutdown().await;
    let late = spawn.await.expect("spawn task").expect("spawn");

    assert_eq!(late.status, ProcessStatus::Stopped);
    assert!(supervisor.list_processes().await.is_empty());
    assert_eq!(backend.controller(0).kill_count(), 1);
    assert_eq!(backend.controller(1).kill_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_spawn_does_not_leave_the_id_reserved() {
    let (supervisor, backend) = fake_supervisor(SupervisorConfig::default());
    backend.set_spawn_delay(Duration::from_millis(200));
    let id = ProcessId::from("flaky");

    let spawner = supervisor.clone();
    let spawn = tokio::spawn(async move { spawner.spawn(ProcessConfig::new("flaky", "sh")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    spawn.abort();
    let _ = spawn.await;

    // Whatever the aborted spawn got to, one kill leaves the id free.
    let _ = supervisor.kill(&id).await;
    backend.set_spawn_delay(Duration::ZERO);
    let state = supervisor
        .spawn(ProcessConfig::new("flaky", "sh"))
        .await
        .expect("respawn after aborted spawn");
    assert_eq!(state.status, ProcessStatus::Idle);
    assert_eq!(supervisor.list_processes().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_spawn_caller_can_spawn_again() {
    let (supervisor, backend) = fake_supervisor(SupervisorConfig::default());
    backend.set_spawn_delay(Duration::from_millis(100));
    let id = ProcessId::from("slow");

    let _ = tokio::time::timeout(
        Duration::from_millis(10),
        supervisor.spawn(ProcessConfig::new("slow", "sh")),
    )
    .await;
    let _ = supervisor.kill(&id).await;

    backend.set_spawn_delay(Duration::ZERO);
    supervisor
        .spawn(ProcessConfig::new("slow", "sh"))
        .await
        .expect("respawn after timeout");
}
