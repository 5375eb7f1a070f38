//! A bare spin lock.
//!
//! Unlike `std::sync::Mutex` or a data-wrapping lock, `SpinLock` guards no
//! data of its own -- it is a busy-wait acquire/release primitive used to
//! protect an external invariant (a thread's wait-list membership, a run
//! queue, a mutex's `{owner, waiters}` pair). Every internal invariant in
//! this crate is protected by one of these, and none of them is ever held
//! across a suspension point (`Dispatcher::sleep`).

use std::sync::atomic::{AtomicBool, Ordering};

/// A busy-wait lock with no data of its own.
#[derive(Debug, Default)]
pub struct SpinLock {
    taken: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    pub fn take(&self) {
        while self
            .taken
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.taken.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock. The caller must currently hold it.
    pub fn release(&self) {
        self.taken.store(false, Ordering::Release);
    }

    /// True if the lock currently appears held. Racy by construction --
    /// for diagnostics only, never for correctness decisions.
    pub fn is_locked(&self) -> bool {
        self.taken.load(Ordering::Relaxed)
    }
}

/// A guard that runs an initializer exactly once, even under concurrent
/// callers, built directly on [`SpinLock`].
pub struct Once {
    lock: SpinLock,
    called: AtomicBool,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl Once {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            called: AtomicBool::new(false),
        }
    }

    /// Calls `f` exactly once across all callers of this `Once`.
    pub fn call(&self, f: impl FnOnce()) {
        self.lock.take();
        if !self.called.load(Ordering::Acquire) {
            f();
            self.called.store(true, Ordering::Release);
        }
        self.lock.release();
    }
}

/// A [`SpinLock`] paired with the data it guards, for call sites that
/// never need to hold the lock across a suspension point (run queues,
/// the timer list, event-subsystem queues). Call sites that must hold
/// the lock across `Dispatcher::sleep_current` (mutex/condvar/rwlock
/// `release_and_sleep`) use the bare [`SpinLock`] directly instead, since
/// a RAII guard would release it at the wrong moment relative to the
/// context switch.
#[derive(Debug, Default)]
pub struct Spin<T> {
    lock: SpinLock,
    data: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spin<T> {}
unsafe impl<T: Send> Sync for Spin<T> {}

pub struct SpinGuard<'a, T> {
    owner: &'a Spin<T>,
}

impl<T> Spin<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: std::cell::UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.lock.take();
        SpinGuard { owner: self }
    }
}

impl<'a, T> std::ops::Deref for SpinGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.owner.data.get() }
    }
}

impl<'a, T> std::ops::DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        self.owner.lock.release();
    }
}
