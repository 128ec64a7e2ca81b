//! The scheduler hook the channel core parks and resumes fibers through.
//!
//! The channel core depends on exactly two operations: park the current
//! fiber, and mark some other fiber runnable again. A thread-per-fiber
//! model, a stackful coroutine runtime, or an async task system can all
//! satisfy this contract equally — this crate ships the thread-per-fiber
//! instantiation: one OS thread plays the role of one fiber, `reschedule`
//! is `std::thread::park`, and `restore` is `Thread::unpark` on a captured
//! handle.
//!
//! A real fiber runtime (a stackful-coroutine scheduler multiplexing many
//! fibers onto few OS threads) is out of scope for this crate: it is
//! consumed through this same narrow seam.

use std::thread::{self, Thread, ThreadId};
use std::time::Duration;

/// A totally-comparable identity for the currently running fiber.
///
/// Under the thread-per-fiber instantiation this is simply the OS thread's
/// [`ThreadId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(ThreadId);

/// A handle capable of restoring (waking) one parked fiber.
///
/// Cloning a `FiberHandle` is cheap and yields another handle to the same
/// fiber — restoring through any of the clones wakes the same fiber.
#[derive(Debug, Clone)]
pub struct FiberHandle {
    id: FiberId,
    thread: Thread,
}

impl FiberHandle {
    /// The identity of the fiber this handle refers to.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Marks this handle's fiber runnable again. Safe to call while holding
    /// a channel's lock.
    ///
    /// If the fiber is not currently parked, this is remembered and the
    /// next call to [`reschedule`] returns immediately (the same spurious-
    /// wakeup-tolerant semantics as `std::thread::park`).
    pub fn restore(&self) {
        self.thread.unpark();
    }
}

/// Returns a handle to the fiber currently executing.
pub fn current() -> FiberHandle {
    let thread = thread::current();
    FiberHandle {
        id: FiberId(thread.id()),
        thread,
    }
}

/// The identity of the fiber currently executing.
pub fn current_fiber() -> FiberId {
    FiberId(thread::current().id())
}

/// Parks the current fiber until some other fiber calls
/// [`FiberHandle::restore`] on a handle to it (or a spurious wakeup
/// occurs — callers must re-check their condition after this returns, the
/// channel core always does).
///
/// Must never be called while holding a channel's lock: the core always
/// releases the lock across this call and reacquires it afterwards.
pub fn reschedule() {
    thread::park();
}

/// Like [`reschedule`], but gives up and returns `false` after `timeout`
/// elapses without a matching `restore`. Returns `true` if woken (whether
/// by a genuine restore or spuriously — same caveat as [`reschedule`]).
pub fn reschedule_timeout(timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    thread::park_timeout(timeout);
    start.elapsed() < timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn restore_wakes_parked_fiber() {
        let woken = Arc::new(Mutex::new(false));
        let handle_slot = Arc::new(Mutex::new(None));

        let w = Arc::clone(&woken);
        let hs = Arc::clone(&handle_slot);
        let t = std::thread::spawn(move || {
            *hs.lock().unwrap() = Some(current());
            reschedule();
            *w.lock().unwrap() = true;
        });

        let handle = loop {
            if let Some(h) = handle_slot.lock().unwrap().clone() {
                break h;
            }
            std::thread::yield_now();
        };
        // give the spawned fiber a chance to park; if it hasn't parked yet
        // `restore` is remembered and `reschedule` returns immediately.
        std::thread::sleep(Duration::from_millis(10));
        handle.restore();
        t.join().unwrap();
        assert!(*woken.lock().unwrap());
    }

    #[test]
    fn reschedule_timeout_expires_without_restore() {
        assert!(!reschedule_timeout(Duration::from_millis(5)));
    }
}
