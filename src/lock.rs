//! The lock adapter backing every channel.
//!
//! A thin, non-reentrant mutex with `lock`/`try_lock`/`unlock` and a stable
//! total order across instances (needed by the select coordinator's
//! ordered-locking rule). In single-threaded builds (the `multi-thread`
//! feature disabled) it reduces to a no-op; in multi-threaded builds (the
//! default) it is a spin-lock, mirroring the `smp`-feature split of a
//! kernel-style spin lock crate.
//!
//! [`Mutex`] pairs a [`RawLatch`] with the data it protects, the same
//! layering `fiber::mutex::Mutex` uses over `fiber::Latch`.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

////////////////////////////////////////////////////////////////////////////////
// RawLatch
////////////////////////////////////////////////////////////////////////////////

/// A lock for a cooperative multitasking environment.
///
/// Carries no data of its own; pair it with [`Mutex`] to guard data, or use
/// it bare when the "critical section" is really several independent
/// pieces of shared state (as the select coordinator does when it needs to
/// hold several channels' locks at once).
pub struct RawLatch {
    inner: imp::Imp,
}

impl RawLatch {
    /// Creates a new latch in an unlocked state.
    pub fn new() -> Self {
        Self {
            inner: imp::Imp::new(),
        }
    }

    /// Locks the latch, blocking the calling thread until it is able to do
    /// so.
    pub fn lock(&self) -> RawLatchGuard<'_> {
        self.inner.lock();
        RawLatchGuard { latch: self }
    }

    /// Tries to lock the latch without blocking.
    pub fn try_lock(&self) -> Option<RawLatchGuard<'_>> {
        if self.inner.try_lock() {
            Some(RawLatchGuard { latch: self })
        } else {
            None
        }
    }

    /// A stable, total-orderable identity for this latch (its address).
    ///
    /// Used by the select coordinator to acquire several channels' locks in
    /// a globally consistent order, preventing deadlock between concurrent
    /// selects whose channel sets intersect.
    pub fn id(&self) -> usize {
        self as *const Self as usize
    }

    fn unlock(&self) {
        self.inner.unlock();
    }

    /// Locks the latch without producing a scoped guard.
    ///
    /// Must be paired with exactly one later call to [`raw_unlock`]. This
    /// exists only for the select coordinator, which must hold several
    /// channels' locks across a non-lexical span (arming every
    /// action, then releasing all of them) that an RAII guard cannot
    /// express. Everywhere else, prefer [`lock`](Self::lock).
    ///
    /// [`raw_unlock`]: Self::raw_unlock
    pub fn raw_lock(&self) {
        self.inner.lock();
    }

    /// Unlocks a latch previously locked with [`raw_lock`](Self::raw_lock).
    pub fn raw_unlock(&self) {
        self.inner.unlock();
    }
}

impl Default for RawLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawLatch").finish_non_exhaustive()
    }
}

/// An RAII scoped lock of a [`RawLatch`]. The latch is unlocked when this
/// guard is dropped.
#[must_use = "the latch is immediately unlocked if the guard is not held"]
pub struct RawLatchGuard<'a> {
    latch: &'a RawLatch,
}

impl Drop for RawLatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.unlock();
    }
}

#[cfg(feature = "multi-thread")]
mod imp {
    use crossbeam_utils::Backoff;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A spin-lock: appropriate when critical sections are short and
    /// fibers may run on different OS threads.
    pub struct Imp {
        locked: AtomicBool,
    }

    impl Imp {
        pub fn new() -> Self {
            Self {
                locked: AtomicBool::new(false),
            }
        }

        pub fn lock(&self) {
            let backoff = Backoff::new();
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                backoff.snooze();
            }
        }

        pub fn try_lock(&self) -> bool {
            self.locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }

        pub fn unlock(&self) {
            self.locked.store(false, Ordering::Release);
        }
    }
}

#[cfg(not(feature = "multi-thread"))]
mod imp {
    use std::cell::Cell;

    /// A no-op lock: sound only because a single-threaded build never has
    /// more than one fiber actually running at a time, so "locked" only
    /// needs to detect reentrancy bugs, not cross-thread contention.
    pub struct Imp {
        locked: Cell<bool>,
    }

    impl Imp {
        pub fn new() -> Self {
            Self {
                locked: Cell::new(false),
            }
        }

        pub fn lock(&self) {
            assert!(!self.locked.get(), "RawLatch locked reentrantly");
            self.locked.set(true);
        }

        pub fn try_lock(&self) -> bool {
            if self.locked.get() {
                false
            } else {
                self.locked.set(true);
                true
            }
        }

        pub fn unlock(&self) {
            self.locked.set(false);
        }
    }
}

// SAFETY: `Imp` only ever exposes its data through `&self` methods that
// internally synchronize (spin-lock) or are only sound on a single thread
// at a time (no-op build, which is never used across threads).
unsafe impl Sync for RawLatch {}

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

/// A [`RawLatch`] paired with the data it protects.
pub struct Mutex<T: ?Sized> {
    latch: RawLatch,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state, ready for use.
    pub fn new(t: T) -> Self {
        Self {
            latch: RawLatch::new(),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so. Returns an RAII guard granting scoped access to the data.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let _token = self.latch.lock();
        MutexGuard {
            mutex: self,
            _token,
        }
    }

    /// A stable, total-orderable identity for this mutex (its address).
    pub fn id(&self) -> usize {
        self.latch.id()
    }

    /// The raw latch backing this mutex.
    ///
    /// Exposed for the select coordinator, which needs to lock several
    /// channels' mutexes across a non-lexical span; see
    /// [`RawLatch::raw_lock`].
    pub fn raw_latch(&self) -> &RawLatch {
        &self.latch
    }

    /// Accesses the protected data without going through the latch.
    ///
    /// # Safety
    ///
    /// The caller must already hold the lock, e.g. via a prior call to
    /// `self.raw_latch().raw_lock()`.
    pub unsafe fn data_mut_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.latch.try_lock() {
            Some(_guard) => f.debug_struct("Mutex").field("data", unsafe { &*self.data.get() }).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

/// An RAII implementation of a "scoped lock" of a [`Mutex`]. When this
/// structure is dropped, the lock is released.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _token: RawLatchGuard<'a>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion() {
        const N: usize = 64;
        let counter = Arc::new(Mutex::new(0usize));
        let handles: Vec<_> = (0..N)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..100 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), N * 100);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let latch = RawLatch::new();
        let _guard = latch.lock();
        assert!(latch.try_lock().is_none());
    }

    #[test]
    fn id_is_stable_and_distinguishes_instances() {
        let a = RawLatch::new();
        let b = RawLatch::new();
        assert_eq!(a.id(), a.id());
        assert_ne!(a.id(), b.id());
    }
}
