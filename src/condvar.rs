//! Condition variable, bound to a [`BaseLock`] (a [`crate::mutex::Mutex`]
//! or the write/upgrade side of an [`crate::rwlock::RwLock`]).
//!
//! Grounded on `ThreadCond` in `threadmutex.h`/`.cc`: a waiter is
//! enqueued only while the base lock's internal spin lock is held, and
//! that spin lock is released atomically with the thread going to sleep
//! via the base lock's own `release_and_sleep`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::mutex::BaseLock;
use crate::queue::WaitQueue;
use crate::thread::UserThread;

/// A condition variable bound to one base lock for its lifetime (or set
/// lazily on first use, matching `ThreadCond::setMutex`/the constructor
/// overload in the source).
pub struct Condvar {
    waiting: StdMutex<WaitQueue<Arc<UserThread>>>,
    base: StdMutex<Option<Arc<dyn BaseLock>>>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            waiting: StdMutex::new(WaitQueue::new()),
            base: StdMutex::new(None),
        }
    }

    pub fn bound_to(base: Arc<dyn BaseLock>) -> Self {
        Self {
            waiting: StdMutex::new(WaitQueue::new()),
            base: StdMutex::new(Some(base)),
        }
    }

    /// Binds (or rebinds, if never bound) the base lock this condvar
    /// sleeps against.
    pub fn bind(&self, base: Arc<dyn BaseLock>) {
        *self.base.lock().unwrap() = Some(base);
    }

    fn base_lock(&self) -> Arc<dyn BaseLock> {
        self.base
            .lock()
            .unwrap()
            .clone()
            .expect("lwt: Condvar used before bind()")
    }

    /// Blocks the caller until signaled or broadcast. The caller must
    /// already hold the bound base lock; it is reacquired before this
    /// call returns.
    pub fn wait(&self) {
        let base = self.base_lock();
        let me = Dispatcher::current_thread().expect("lwt: wait() called off a dispatcher");

        base.spin().take();
        assert!(
            base.is_owned_by_current(),
            "lwt: Condvar::wait called without holding the base lock"
        );
        self.waiting.lock().unwrap().push_back(me.clone());
        // Atomically releases the base lock and sleeps.
        base.release_and_sleep(&me);

        base.take();
    }

    /// Like [`Condvar::wait`], but returns `true` if signaled/broadcast
    /// before `timeout` elapsed, `false` if it timed out.
    ///
    /// Grounded on SS4.6's timed-condvar pattern, adapted to this
    /// crate's FIFO wait queue: a [`crate::timer::Timer`] is armed
    /// alongside the normal wait, and whichever of {a real
    /// signal/broadcast, the timer} gets to this thread first removes
    /// it from the wait queue and requeues it; the other is a no-op.
    /// Takes `self: &Arc<Self>` so the timer's callback -- which must
    /// be `'static` and may run on the timer manager's own kernel
    /// thread well after this call returns -- can hold its own
    /// reference instead of borrowing `self`.
    pub fn timed_wait(self: &Arc<Self>, timeout: Duration) -> bool {
        let base = self.base_lock();
        let me = Dispatcher::current_thread().expect("lwt: timed_wait() called off a dispatcher");

        base.spin().take();
        assert!(
            base.is_owned_by_current(),
            "lwt: Condvar::timed_wait called without holding the base lock"
        );
        self.waiting.lock().unwrap().push_back(me.clone());

        let timed_out = Arc::new(AtomicBool::new(false));
        let cv = self.clone();
        let waiter = me.clone();
        let flag = timed_out.clone();
        let timer = crate::timer::Timer::new(timeout, move || {
            let base = cv.base_lock();
            base.spin().take();
            let removed = cv
                .waiting
                .lock()
                .unwrap()
                .remove_matching(|t| Arc::ptr_eq(t, &waiter))
                .is_some();
            base.spin().release();
            if removed {
                flag.store(true, Ordering::SeqCst);
                Dispatcher::queue_thread(waiter.clone());
            }
        });
        timer.start();

        // Atomically releases the base lock and sleeps; whichever of
        // {the timer, a real signal/broadcast} reaches us first is the
        // one that requeues us.
        base.release_and_sleep(&me);
        base.take();

        // Harmless if the timer already fired: cancel is a no-op past
        // that point (SS4.6 fire-xor-cancel).
        timer.cancel();
        !timed_out.load(Ordering::SeqCst)
    }

    /// Wakes the single longest-waiting thread, if any.
    pub fn signal(&self) {
        let base = self.base_lock();
        base.spin().take();
        let next = self.waiting.lock().unwrap().pop_front();
        base.spin().release();
        if let Some(next) = next {
            Dispatcher::queue_thread(next);
        }
    }

    /// Wakes every waiting thread.
    pub fn broadcast(&self) {
        let base = self.base_lock();
        base.spin().take();
        let all = self.waiting.lock().unwrap().drain_all();
        base.spin().release();
        for thread in all {
            Dispatcher::queue_thread(thread);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::mutex::Mutex;
    use crate::thread::UserThread;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ensure_setup() {
        Dispatcher::setup(&RuntimeConfig::default().with_dispatchers(2));
    }

    #[test]
    fn signal_wakes_a_single_waiter() {
        ensure_setup();
        let mutex: Arc<dyn BaseLock> = Arc::new(Mutex::new());
        let cv = Arc::new(Condvar::bound_to(mutex.clone()));
        let woke = Arc::new(AtomicU32::new(0));

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let mutex = mutex.clone();
            let cv = cv.clone();
            let woke = woke.clone();
            waiters.push(UserThread::spawn("waiter", None, true, move || {
                mutex.take();
                cv.wait();
                woke.fetch_add(1, Ordering::SeqCst);
                mutex.release();
                Box::new(())
            }));
        }

        // Give the waiters a chance to block before signaling.
        std::thread::sleep(Duration::from_millis(100));

        mutex.take();
        cv.signal();
        mutex.release();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(woke.load(Ordering::SeqCst), 1);

        mutex.take();
        cv.broadcast();
        mutex.release();

        for w in waiters {
            w.join();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ping_pong_producer_consumer() {
        ensure_setup();
        let mutex: Arc<dyn BaseLock> = Arc::new(Mutex::new());
        let not_full = Arc::new(Condvar::bound_to(mutex.clone()));
        let not_empty = Arc::new(Condvar::bound_to(mutex.clone()));
        let buffer = Arc::new(StdMutex::new(Vec::<u32>::new()));
        let produced = Arc::new(AtomicU32::new(0));
        let consumed = Arc::new(AtomicU32::new(0));

        const ROUNDS: u32 = 2000;
        const CAP: usize = 3;

        let producer = {
            let mutex = mutex.clone();
            let not_full = not_full.clone();
            let not_empty = not_empty.clone();
            let buffer = buffer.clone();
            let produced = produced.clone();
            UserThread::spawn("producer", None, true, move || {
                for i in 0..ROUNDS {
                    mutex.take();
                    while buffer.lock().unwrap().len() == CAP {
                        not_full.wait();
                    }
                    buffer.lock().unwrap().push(i);
                    produced.fetch_add(1, Ordering::SeqCst);
                    not_empty.signal();
                    mutex.release();
                }
                Box::new(())
            })
        };

        let consumer = UserThread::spawn("consumer", None, true, move || {
            for _ in 0..ROUNDS {
                mutex.take();
                while buffer.lock().unwrap().is_empty() {
                    not_empty.wait();
                }
                buffer.lock().unwrap().pop();
                consumed.fetch_add(1, Ordering::SeqCst);
                not_full.signal();
                mutex.release();
            }
            Box::new(())
        });

        producer.join();
        consumer.join();
        assert_eq!(produced.load(Ordering::SeqCst), ROUNDS);
        assert_eq!(consumed.load(Ordering::SeqCst), ROUNDS);
    }

    #[test]
    fn timed_wait_reports_timeout_when_never_signaled() {
        ensure_setup();
        let mutex: Arc<dyn BaseLock> = Arc::new(Mutex::new());
        let cv = Arc::new(Condvar::bound_to(mutex.clone()));
        let joined = UserThread::spawn("timed-waiter", None, true, move || {
            mutex.take();
            let fired = cv.timed_wait(Duration::from_millis(50));
            mutex.release();
            Box::new(fired)
        });
        let result = joined.join();
        assert_eq!(*result.downcast::<bool>().unwrap(), false);
    }

    #[test]
    fn timed_wait_reports_signal_before_timeout() {
        ensure_setup();
        let mutex: Arc<dyn BaseLock> = Arc::new(Mutex::new());
        let cv = Arc::new(Condvar::bound_to(mutex.clone()));
        let cv_for_waiter = cv.clone();
        let mutex_for_waiter = mutex.clone();
        let waiter = UserThread::spawn("timed-waiter", None, true, move || {
            mutex_for_waiter.take();
            let fired = cv_for_waiter.timed_wait(Duration::from_secs(5));
            mutex_for_waiter.release();
            Box::new(fired)
        });

        std::thread::sleep(Duration::from_millis(50));
        mutex.take();
        cv.signal();
        mutex.release();

        let result = waiter.join();
        assert_eq!(*result.downcast::<bool>().unwrap(), true);
    }
}
