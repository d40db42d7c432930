//! Signal and inspect whole process trees by reading `/proc`.
//!
//! The child of a session is typically a shell with its own descendants;
//! killing only the shell would leak them. Linux-only, like the rest of the
//! session machinery.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Signal `pid` and every process below it.
///
/// The root is stopped first so it cannot spawn replacements while its
/// descendants are being signalled, then signalled and continued. Processes
/// that disappear mid-walk are skipped.
pub(crate) fn kill_process_tree(pid: i32, sig: Signal) {
    if !send_signal(pid, Signal::SIGSTOP) {
        return;
    }
    for child in children_of(pid) {
        kill_process_tree(child, sig);
    }
    send_signal(pid, sig);
    send_signal(pid, Signal::SIGCONT);
}

/// Whether `pid` or any direct child of it is a zombie.
pub(crate) fn tree_has_defunct(pid: i32) -> bool {
    std::iter::once(pid)
        .chain(children_of(pid))
        .any(|p| proc_state(p) == Some('Z'))
}

fn send_signal(pid: i32, sig: Signal) -> bool {
    kill(Pid::from_raw(pid), sig).is_ok()
}

/// Direct children of `pid`, collected across all of its threads.
fn children_of(pid: i32) -> Vec<i32> {
    let mut pids = Vec::new();
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return pids;
    };
    for task in tasks.flatten() {
        if let Ok(list) = std::fs::read_to_string(task.path().join("children")) {
            pids.extend(list.split_whitespace().filter_map(|p| p.parse::<i32>().ok()));
        }
    }
    pids
}

/// Process state letter from `/proc/<pid>/stat`.
///
/// The stat format is `pid (comm) state ...`; comm can contain spaces and
/// parentheses, so the last `)` is located to skip it safely.
fn proc_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let idx = stat.rfind(')')?;
    stat.get(idx + 2..)?.chars().next()
}
