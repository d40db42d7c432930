//! End-to-end tests for the raw spawn handle. These drive the real
//! `aexpect-helper` binary built alongside this workspace.

use aexpect::{Spawn, SpawnConfig};
use std::time::{Duration, Instant};

fn wait_for(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    predicate()
}

#[test]
fn test_spawn_records_output_and_status() {
    let mut session = Spawn::spawn("echo HELLO; exit 7").expect("spawn should succeed");

    assert_eq!(session.get_status(), Some(7));
    let output = session.get_output().expect("output file should exist");
    assert!(
        output.contains("HELLO\n"),
        "output should contain the echoed line, got {output:?}"
    );
    session.close();
}

#[test]
fn test_get_pid_points_at_child_shell() {
    let mut session = Spawn::spawn("sleep 30").expect("spawn should succeed");

    let pid = session.get_pid().expect("pid file should be readable");
    assert!(pid > 0);
    assert!(
        std::fs::metadata(format!("/proc/{pid}")).is_ok(),
        "child {pid} should exist"
    );
    session.close();
    assert!(
        wait_for(
            || std::fs::metadata(format!("/proc/{pid}")).is_err(),
            Duration::from_secs(5)
        ),
        "child {pid} should be gone after close"
    );
}

#[test]
fn test_send_reaches_child_stdin() {
    let mut session = Spawn::spawn("read line; echo got:$line").expect("spawn should succeed");

    session.sendline("ping");
    assert_eq!(session.get_status(), Some(0));
    let output = session.get_output().expect("output file should exist");
    assert!(
        output.contains("got:ping"),
        "child should have echoed the sent line, got {output:?}"
    );
    session.close();
}

#[test]
fn test_is_alive_tracks_helper_lifetime() {
    let mut session = Spawn::spawn("sleep 30").expect("spawn should succeed");

    assert!(session.is_alive());
    session.kill();
    assert!(
        wait_for(|| !session.is_alive(), Duration::from_secs(10)),
        "session should die after kill"
    );
    session.close();
}

#[test]
fn test_close_removes_session_directory_and_is_idempotent() {
    let mut session = Spawn::spawn("sleep 30").expect("spawn should succeed");
    let path = session.session_path().to_path_buf();
    assert!(path.is_dir());

    session.close();
    assert!(!path.exists(), "close should remove the session directory");
    assert!(!session.is_alive());

    // A second close is a no-op.
    session.close();
    assert!(!path.exists());
}

#[test]
fn test_attach_reads_same_stream() {
    let mut first = Spawn::spawn("echo SHARED; sleep 30").expect("spawn should succeed");

    let second = Spawn::attach(first.id()).expect("attach should succeed");
    assert_eq!(second.id(), first.id());
    assert_eq!(second.get_pid(), first.get_pid());
    assert!(
        wait_for(
            || second
                .get_output()
                .is_some_and(|output| output.contains("SHARED")),
            Duration::from_secs(10)
        ),
        "attached handle should observe the same output stream"
    );
    first.close();
}

#[test]
fn test_spawn_with_explicit_id() {
    let config = SpawnConfig {
        id: Some("itestid1".to_string()),
        ..SpawnConfig::default()
    };
    let mut session = Spawn::spawn_with_config("true", &config).expect("spawn should succeed");
    assert_eq!(session.id(), "itestid1");
    assert_eq!(session.get_status(), Some(0));
    session.close();
}

#[test]
fn test_run_fg_collects_status_and_output() {
    let (status, output) = aexpect::run_fg(
        "echo FG; exit 3",
        aexpect::TailConfig::default(),
        Duration::from_secs(10),
    )
    .expect("run_fg should succeed");

    assert_eq!(status, Some(3));
    assert!(output.expect("output should exist").contains("FG"));
}
