//! End-to-end tests for shell command execution.

use aexpect::{CmdOptions, ShellError, ShellSession};
use std::time::Duration;

fn sh() -> ShellSession {
    ShellSession::spawn("sh").expect("spawn sh should succeed")
}

#[test]
fn test_cmd_status_output_true_and_false() {
    let mut session = sh();

    let (status, output) = session
        .cmd_status_output("true")
        .expect("true should run cleanly");
    assert_eq!((status, output.as_str()), (0, ""));

    let (status, output) = session
        .cmd_status_output("false")
        .expect("false runs fine, it just fails");
    assert_eq!((status, output.as_str()), (1, ""));

    session.close();
}

#[test]
fn test_cmd_output_strips_echo_and_prompt() {
    let mut session = sh();

    let output = session.cmd_output("echo hi").expect("echo should run");
    assert_eq!(output, "hi\n");

    let output = session
        .cmd_output("printf 'a\\nb\\n'")
        .expect("printf should run");
    assert_eq!(output, "a\nb\n");

    session.close();
}

#[test]
fn test_cmd_raises_on_unaccepted_status() {
    let mut session = sh();

    match session.cmd("false") {
        Err(ShellError::CmdFailed { cmd, status, .. }) => {
            assert_eq!(cmd, "false");
            assert_eq!(status, 1);
        }
        other => panic!("expected CmdFailed, got {other:?}"),
    }

    let options = CmdOptions {
        ok_status: vec![0, 1],
        ..CmdOptions::default()
    };
    session
        .cmd_with("false", &options, None)
        .expect("status 1 should be accepted");

    session.close();
}

#[test]
fn test_cmd_ignore_all_errors_swallows_failures() {
    let mut session = sh();

    let options = CmdOptions {
        ignore_all_errors: true,
        ..CmdOptions::default()
    };
    let output = session
        .cmd_with("false", &options, None)
        .expect("errors should be swallowed");
    assert_eq!(output, "");

    session.close();
}

#[test]
fn test_killing_the_shell_reports_termination_with_command() {
    let mut session = sh();

    match session.cmd("kill $$") {
        Err(ShellError::ProcessTerminated { cmd, .. }) => {
            assert_eq!(cmd, "kill $$");
        }
        other => panic!("expected ProcessTerminated, got {other:?}"),
    }
    session.close();
}

#[test]
fn test_cmd_output_safe_collects_slow_output_in_order() {
    let mut session = sh();

    let output = session
        .cmd_output_safe(
            "echo A; sleep 2; echo B; sleep 2; echo C",
            Duration::from_secs(10),
        )
        .expect("safe mode should ride out the pauses");

    let a = output.find('A').expect("output should contain A");
    let b = output.find('B').expect("output should contain B");
    let c = output.find('C').expect("output should contain C");
    assert!(a < b && b < c, "lines should arrive in order, got {output:?}");

    session.close();
}

#[test]
fn test_is_responsive() {
    let mut session = sh();
    assert!(session.is_responsive(Duration::from_secs(5)));
    session.close();
}

#[test]
fn test_status_probe_failure_is_status_error() {
    let mut session = sh();
    // A probe that prints no digits-only line cannot deliver a status.
    session.set_status_test_command("echo not-a-number");

    match session.cmd_status_output("true") {
        Err(ShellError::StatusUnavailable { cmd, .. }) => assert_eq!(cmd, "true"),
        other => panic!("expected StatusUnavailable, got {other:?}"),
    }
    session.close();
}

#[test]
fn test_custom_prompt() {
    let mut session = sh();

    // Switch the expected prompt first so the read after the PS1
    // assignment already waits for the new one.
    session.set_prompt("PROMPT> $");
    session
        .cmd_output("PS1='PROMPT> '")
        .expect("setting PS1 should work");

    let (status, output) = session
        .cmd_status_output("echo custom")
        .expect("command should run under the new prompt");
    assert_eq!(status, 0);
    assert_eq!(output, "custom\n");
    session.close();
}
