//! End-to-end tests for background line streaming.

use aexpect::{SessionGroup, Tail, TailConfig};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn collecting_config() -> (TailConfig, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<i32>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let mut config = TailConfig::default();
    let sink = lines.clone();
    config.output_func = Some(Box::new(move |line: &str| {
        sink.lock().unwrap().push(line.to_string());
    }));
    let status_sink = statuses.clone();
    config.termination_func = Some(Box::new(move |status| {
        status_sink.lock().unwrap().push(status);
    }));

    (config, lines, statuses)
}

#[test]
fn test_tail_delivers_lines_in_order_then_termination() {
    let (config, lines, statuses) = collecting_config();
    let mut tail = Tail::spawn_with_config("for i in 1 2 3; do echo L$i; done", config)
        .expect("spawn should succeed");

    assert_eq!(tail.get_status(), Some(0));
    tail.close();

    assert_eq!(
        *lines.lock().unwrap(),
        vec!["L1", "L2", "L3", "(Process terminated with status 0)"]
    );
    assert_eq!(*statuses.lock().unwrap(), vec![0]);
}

#[test]
fn test_tail_applies_output_prefix() {
    let (mut config, lines, _statuses) = collecting_config();
    config.output_prefix = "[vm] ".to_string();
    let mut tail =
        Tail::spawn_with_config("echo payload", config).expect("spawn should succeed");

    assert_eq!(tail.get_status(), Some(0));
    tail.close();

    let lines = lines.lock().unwrap();
    assert!(
        lines.iter().all(|line| line.starts_with("[vm] ")),
        "every line should carry the prefix, got {lines:?}"
    );
    assert!(lines.contains(&"[vm] payload".to_string()));
}

#[test]
fn test_tail_flushes_promptless_partial_line() {
    let (config, lines, _statuses) = collecting_config();
    // The child prints a prompt-like fragment with no newline and then
    // stalls; the quiet-interval flush must still surface it.
    let mut tail = Tail::spawn_with_config("printf 'password: '; sleep 30", config)
        .expect("spawn should succeed");

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains("password:"))
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(
        lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains("password:")),
        "partial line should have been flushed"
    );
    tail.close();
}

#[test]
fn test_termination_callback_runs_before_close_returns() {
    let (config, _lines, statuses) = collecting_config();
    let mut tail = Tail::spawn_with_config("exit 9", config).expect("spawn should succeed");

    tail.close();
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![9],
        "termination callback must have fired by the time close returns"
    );
}

#[test]
fn test_group_shutdown_stops_workers_without_killing_children() {
    let group = SessionGroup::new();
    let (mut config, _lines, _statuses) = collecting_config();
    config.group = Some(group.clone());
    let mut tail = Tail::spawn_with_config("sleep 30", config).expect("spawn should succeed");

    let started = Instant::now();
    group.shutdown(Duration::from_secs(10));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "workers should acknowledge the stop request promptly"
    );
    assert!(tail.is_alive(), "the child itself must keep running");
    tail.close();
}
