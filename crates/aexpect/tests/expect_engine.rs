//! End-to-end tests for the expect engine against live sessions.

use aexpect::{Expect, ExpectError};
use std::time::Duration;

#[test]
fn test_read_until_last_line_matches_prompt() {
    let mut session = Expect::spawn("sh").expect("spawn sh should succeed");

    let (index, buffer) = session
        .read_until_last_line_matches(&[r"\$\s*$"], Duration::from_secs(5), None, None)
        .expect("prompt should appear");
    assert_eq!(index, 0);
    assert!(
        buffer.trim_end().ends_with('$'),
        "buffer should end with a prompt line, got {buffer:?}"
    );
    session.close();
}

#[test]
fn test_zero_timeout_raises_timeout_without_reading() {
    let mut session = Expect::spawn("echo data; sleep 30").expect("spawn should succeed");

    let result = session.read_until_output_matches(
        &["data"],
        |text| text.to_string(),
        Duration::ZERO,
        None,
        None,
    );
    match result {
        Err(ExpectError::Timeout { output, .. }) => {
            assert!(output.is_empty(), "nothing should have been read");
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    session.close();
}

#[test]
fn test_empty_patterns_are_skipped_but_keep_indices() {
    let mut session = Expect::spawn("echo data; sleep 30").expect("spawn should succeed");

    let (index, _) = session
        .read_until_output_matches(
            &["", "data"],
            |text| text.to_string(),
            Duration::from_secs(10),
            None,
            None,
        )
        .expect("second pattern should match");
    assert_eq!(index, 1);
    session.close();
}

#[test]
fn test_any_line_matcher_prefers_last_pattern() {
    let mut session = Expect::spawn("echo marker; sleep 30").expect("spawn should succeed");

    // Both entries match the same line; the multi-line matcher must report
    // the later one.
    let (index, _) = session
        .read_until_any_line_matches(
            &["marker", "marker"],
            Duration::from_secs(10),
            None,
            None,
        )
        .expect("pattern should match");
    assert_eq!(index, 1);
    session.close();
}

#[test]
fn test_last_word_matcher() {
    let mut session = Expect::spawn("echo one two three; sleep 30").expect("spawn should succeed");

    let (index, _) = session
        .read_until_last_word_matches(&["^three$"], Duration::from_secs(10), None, None)
        .expect("last word should match");
    assert_eq!(index, 0);
    session.close();
}

#[test]
fn test_dead_child_raises_process_terminated() {
    let mut session = Expect::spawn("exit 5").expect("spawn should succeed");

    let result = session.read_until_output_matches(
        &["never appears"],
        |text| text.to_string(),
        Duration::from_secs(30),
        None,
        None,
    );
    match result {
        Err(ExpectError::ProcessTerminated { status, .. }) => {
            assert_eq!(status, Some(5));
        }
        other => panic!("expected ProcessTerminated, got {other:?}"),
    }
    session.close();
}

#[test]
fn test_read_nonblocking_returns_pending_output() {
    let mut session = Expect::spawn("echo burst; sleep 30").expect("spawn should succeed");

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut collected = String::new();
    while std::time::Instant::now() < deadline && !collected.contains("burst") {
        collected.push_str(&session.read_nonblocking(None, Some(Duration::from_millis(500))));
    }
    assert!(
        collected.contains("burst"),
        "read_nonblocking should surface pending output, got {collected:?}"
    );
    session.close();
}

#[test]
fn test_invalid_pattern_reported_before_reading() {
    let mut session = Expect::spawn("sleep 30").expect("spawn should succeed");

    let result = session.read_until_output_matches(
        &["["],
        |text| text.to_string(),
        Duration::from_secs(5),
        None,
        None,
    );
    assert!(matches!(result, Err(ExpectError::InvalidPattern(_))));
    session.close();
}

#[test]
fn test_print_func_observes_lines() {
    let mut session = Expect::spawn("echo visible; sleep 30").expect("spawn should succeed");

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen_handle = seen.clone();
    let mut print = move |line: &str| seen_handle.borrow_mut().push(line.to_string());
    session
        .read_until_output_matches(
            &["visible"],
            |text| text.to_string(),
            Duration::from_secs(10),
            None,
            Some(&mut print),
        )
        .expect("pattern should match");
    let seen = seen.borrow();
    assert!(
        seen.iter().any(|line| line.contains("visible")),
        "print callback should have seen the output, got {seen:?}"
    );
    session.close();
}
