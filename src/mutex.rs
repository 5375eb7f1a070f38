//! FIFO mutex, with an internal spin lock protecting `{owner, waiters}`.
//!
//! Grounded on `ThreadMutex`/`ThreadBaseLock` in `threadmutex.h`/`.cc`:
//! ownership and the waiter queue are guarded by the mutex's own spin
//! lock, never by the mutex's "logical" lock state itself, since a
//! condition variable needs to release that state atomically with the
//! waiter going to sleep.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use crate::dispatcher::Dispatcher;
use crate::queue::WaitQueue;
use crate::spinlock::SpinLock;
use crate::thread::{BlockingNode, ThreadId, UserThread};

/// Implemented by both [`Mutex`] and the write side of the rw-lock, so a
/// [`crate::condvar::Condvar`] can be bound to either (SS4.3
/// `ThreadBaseLock`).
pub trait BaseLock: Send + Sync {
    fn take(&self);
    fn try_lock(&self) -> bool;
    fn release(&self);
    /// Releases this lock and puts `thread` to sleep as one atomic
    /// step, returning only once `thread` has been resumed again.
    fn release_and_sleep(&self, thread: &Arc<UserThread>);
    /// The internal spin lock backing this lock's invariants, for a
    /// condition variable to hold while enqueueing a waiter.
    fn spin(&self) -> &SpinLock;
    /// True iff the calling thread currently owns this lock -- used by
    /// `Condvar::wait`'s misuse check.
    fn is_owned_by_current(&self) -> bool;
}

struct State {
    owner: Option<Arc<UserThread>>,
    waiters: WaitQueue<Arc<UserThread>>,
}

/// A FIFO mutex: a release hands ownership to at most one waiter, chosen
/// in the order they blocked.
pub struct Mutex {
    spin: SpinLock,
    state: StdMutex<State>,
    wait_us: AtomicI64,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            spin: SpinLock::new(),
            state: StdMutex::new(State {
                owner: None,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Cumulative microseconds every acquirer of this mutex has ever
    /// spent blocked (SS4.3 `getWaitUs`).
    pub fn wait_microseconds(&self) -> i64 {
        self.wait_us.load(Ordering::Relaxed)
    }

    fn owner_id(&self) -> Option<ThreadId> {
        self.state.lock().unwrap().owner.as_ref().map(|t| t.id)
    }
}

impl BaseLock for Mutex {
    fn take(&self) {
        let me = Dispatcher::current_thread().expect("lwt: take() called off a dispatcher");

        self.spin.take();
        loop {
            let mut state = self.state.lock().unwrap();
            if state.owner.is_none() {
                state.owner = Some(me.clone());
                drop(state);
                self.spin.release();
                return;
            }
            assert!(
                !matches!(&state.owner, Some(o) if Arc::ptr_eq(o, &me)),
                "lwt: recursive mutex take by the same thread"
            );
            state.waiters.push_back(me.clone());
            drop(state);

            *me.blocking.lock().unwrap() = Some(self_as_blocking_node(self));
            let started = Instant::now();
            Dispatcher::sleep_current(&self.spin);
            *me.blocking.lock().unwrap() = None;
            self.wait_us
                .fetch_add(started.elapsed().as_micros() as i64, Ordering::Relaxed);

            self.spin.take();
        }
    }

    fn try_lock(&self) -> bool {
        let me = Dispatcher::current_thread().expect("lwt: try_lock() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        let acquired = if state.owner.is_none() {
            state.owner = Some(me);
            true
        } else {
            false
        };
        drop(state);
        self.spin.release();
        acquired
    }

    fn release(&self) {
        let me = Dispatcher::current_thread().expect("lwt: release() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        assert!(
            matches!(&state.owner, Some(o) if Arc::ptr_eq(o, &me)),
            "lwt: release of a mutex not owned by the caller"
        );
        state.owner = None;
        let next = state.waiters.pop_front();
        drop(state);
        self.spin.release();

        if let Some(next) = next {
            Dispatcher::queue_thread(next);
        }
    }

    fn release_and_sleep(&self, thread: &Arc<UserThread>) {
        // Caller already holds `self.spin`.
        let mut state = self.state.lock().unwrap();
        assert!(matches!(&state.owner, Some(o) if Arc::ptr_eq(o, thread)));
        state.owner = None;
        let next = state.waiters.pop_front();
        drop(state);

        if let Some(next) = next {
            Dispatcher::queue_thread(next);
        }
        // One atomic transition: the spin lock becomes observably
        // released only after `thread` is physically off its stack.
        Dispatcher::sleep_current(&self.spin);
    }

    fn spin(&self) -> &SpinLock {
        &self.spin
    }

    fn is_owned_by_current(&self) -> bool {
        match Dispatcher::current_thread() {
            Some(me) => matches!(&self.state.lock().unwrap().owner, Some(o) if Arc::ptr_eq(o, &me)),
            None => false,
        }
    }
}

struct MutexBlockingNode {
    mutex: *const Mutex,
}

// Safety: only ever stored in a thread's `blocking` slot for the
// lifetime of that thread's own `take()` call, and the mutex it points
// at outlives that call (callers hold the mutex by reference or Arc for
// the duration).
unsafe impl Send for MutexBlockingNode {}
unsafe impl Sync for MutexBlockingNode {}

impl BlockingNode for MutexBlockingNode {
    fn owner(&self) -> Option<ThreadId> {
        unsafe { (*self.mutex).owner_id() }
    }

    fn describe(&self) -> String {
        format!("mutex@{:p}", self.mutex)
    }
}

fn self_as_blocking_node(mutex: &Mutex) -> Arc<dyn BlockingNode> {
    Arc::new(MutexBlockingNode {
        mutex: mutex as *const Mutex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::thread::UserThread;
    use std::sync::atomic::{AtomicU32, Ordering as O};

    fn ensure_setup() {
        Dispatcher::setup(&RuntimeConfig::default().with_dispatchers(2));
    }

    #[test]
    fn mutual_exclusion_across_many_threads() {
        ensure_setup();
        let mutex = Arc::new(Mutex::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut joins = Vec::new();
        for _ in 0..8 {
            let mutex = mutex.clone();
            let counter = counter.clone();
            joins.push(UserThread::spawn("worker", None, true, move || {
                for _ in 0..500 {
                    mutex.take();
                    let v = counter.load(O::SeqCst);
                    counter.store(v + 1, O::SeqCst);
                    mutex.release();
                }
                Box::new(())
            }));
        }
        for j in joins {
            j.join();
        }
        assert_eq!(counter.load(O::SeqCst), 4000);
    }

    #[test]
    fn try_lock_does_not_block() {
        ensure_setup();
        Dispatcher::adopt_host_thread("try-lock-test");
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.release();
        assert!(mutex.try_lock());
        mutex.release();
    }
}
