//! Coordinated shutdown for background tail workers.
//!
//! Replaces a process-global kill flag: tails register their workers with a
//! group at construction, and [`SessionGroup::shutdown`] stops every
//! registered worker with a bounded grace period. Cloning a group yields
//! another handle to the same membership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct SessionGroup {
    inner: Arc<GroupInner>,
}

#[derive(Default)]
struct GroupInner {
    members: Mutex<Vec<Member>>,
}

struct Member {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl SessionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, stop: Arc<AtomicBool>, finished: Arc<AtomicBool>) {
        if let Ok(mut members) = self.inner.members.lock() {
            members.push(Member { stop, finished });
        }
    }

    /// Ask every registered worker to stop and wait up to `grace` for them
    /// to wind down. Workers notice the request at their next poll slice.
    pub fn shutdown(&self, grace: Duration) {
        let members: Vec<Member> = match self.inner.members.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => return,
        };
        for member in &members {
            member.stop.store(true, Ordering::Relaxed);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline
            && members
                .iter()
                .any(|member| !member.finished.load(Ordering::Relaxed))
        {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl std::fmt::Debug for SessionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.members.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("SessionGroup").field("members", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signals_and_waits_for_members() {
        let group = SessionGroup::new();
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        group.register(stop.clone(), finished.clone());

        let worker = {
            let (stop, finished) = (stop.clone(), finished.clone());
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                finished.store(true, Ordering::Relaxed);
            })
        };

        let started = Instant::now();
        group.shutdown(Duration::from_secs(5));
        assert!(stop.load(Ordering::Relaxed), "stop flag should be raised");
        assert!(finished.load(Ordering::Relaxed), "worker should have finished");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "shutdown should return as soon as members finish"
        );
        worker.join().expect("worker should join");
    }

    #[test]
    fn test_shutdown_gives_up_after_grace() {
        let group = SessionGroup::new();
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        group.register(stop, finished);

        // Nobody ever marks the member finished.
        let started = Instant::now();
        group.shutdown(Duration::from_millis(200));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_shutdown_of_empty_group_is_immediate() {
        let group = SessionGroup::new();
        let started = Instant::now();
        group.shutdown(Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
