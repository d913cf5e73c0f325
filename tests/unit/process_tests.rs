//! Process supervision: spawn, exit classification, soft terminate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use arras_node::supervisor::{
    ExitKind, ExitObserver, ExitStatus, ProcessManager, ProcessState, SpawnArgs,
};

fn manager() -> ProcessManager {
    ProcessManager::new(4096, false, false, false, false)
}

fn shell_args(script: &str) -> SpawnArgs {
    let mut environment = HashMap::new();
    environment.insert("PATH".into(), "/bin:/usr/bin".into());
    SpawnArgs {
        program: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        environment,
        cleanup_process_group: true,
        ..SpawnArgs::default()
    }
}

struct Recorder {
    fired: AtomicBool,
}

impl ExitObserver for Recorder {
    fn on_exit(&self, _id: Uuid, _session_id: Uuid, _status: ExitStatus) {
        self.fired.store(true, Ordering::Release);
    }
}

#[tokio::test]
async fn clean_exit_is_classified_with_its_code() {
    let manager = manager();
    let handle = manager.add_process(Uuid::new_v4(), "true-comp", Uuid::new_v4());
    handle.spawn(shell_args("exit 0"), None).expect("spawn must succeed");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    assert!(handle.wait_until_exit(deadline).await, "child must exit");

    match handle.state() {
        ProcessState::Exited(exit) => {
            assert_eq!(exit.kind, ExitKind::Exit);
            assert_eq!(exit.status, 0);
        }
        other => panic!("expected exited state, got {other:?}"),
    }
}

#[tokio::test]
async fn nonzero_exit_code_is_preserved() {
    let manager = manager();
    let handle = manager.add_process(Uuid::new_v4(), "fail-comp", Uuid::new_v4());
    handle.spawn(shell_args("exit 3"), None).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    assert!(handle.wait_until_exit(deadline).await);
    assert_eq!(
        handle.state(),
        ProcessState::Exited(ExitStatus {
            kind: ExitKind::Exit,
            status: 3
        })
    );
}

#[tokio::test]
async fn soft_terminate_signals_and_reports_the_exit() {
    let manager = manager();
    let handle = manager.add_process(Uuid::new_v4(), "sleeper", Uuid::new_v4());
    let observer = Arc::new(Recorder {
        fired: AtomicBool::new(false),
    });
    handle
        .spawn(shell_args("sleep 30"), Some(observer.clone()))
        .unwrap();

    // give the shell a moment to exec
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.terminate(true);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    assert!(handle.wait_until_exit(deadline).await, "SIGTERM must end it");
    match handle.state() {
        ProcessState::Exited(exit) => assert_eq!(exit.kind, ExitKind::Signal),
        other => panic!("expected exited state, got {other:?}"),
    }
    assert!(observer.fired.load(Ordering::Acquire), "observer must fire");
}

#[tokio::test]
async fn wait_until_exit_times_out_while_running() {
    let manager = manager();
    let handle = manager.add_process(Uuid::new_v4(), "sleeper", Uuid::new_v4());
    handle.spawn(shell_args("sleep 30"), None).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
    assert!(!handle.wait_until_exit(deadline).await, "still running");

    handle.terminate(false);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    assert!(handle.wait_until_exit(deadline).await);
}

#[tokio::test]
async fn spawn_failure_leaves_a_launch_error() {
    let manager = manager();
    let handle = manager.add_process(Uuid::new_v4(), "ghost", Uuid::new_v4());
    let args = SpawnArgs {
        program: "/nonexistent/program".into(),
        ..SpawnArgs::default()
    };

    assert!(handle.spawn(args, None).is_err());
    match handle.state() {
        ProcessState::Exited(exit) => assert_eq!(exit.kind, ExitKind::Internal),
        other => panic!("expected exited state, got {other:?}"),
    }
}

#[tokio::test]
async fn double_spawn_is_refused() {
    let manager = manager();
    let handle = manager.add_process(Uuid::new_v4(), "once", Uuid::new_v4());
    handle.spawn(shell_args("sleep 5"), None).unwrap();

    assert!(handle.spawn(shell_args("exit 0"), None).is_err());
    handle.terminate(false);
}

#[test]
fn exit_reasons_distinguish_expected_from_unexpected() {
    let clean = ExitStatus {
        kind: ExitKind::Exit,
        status: 0,
    };
    assert_eq!(clean.describe(false), "exited normally (code 0)");

    let crash = ExitStatus {
        kind: ExitKind::Exit,
        status: 9,
    };
    assert!(crash.describe(false).contains("unexpectedly"));
    assert!(crash.describe(true).contains("as requested"));

    let signalled = ExitStatus {
        kind: ExitKind::Signal,
        status: 15,
    };
    assert!(signalled.describe(true).contains("during shutdown"));
    assert!(signalled.describe(false).contains("signal 15"));
}
