//! Timer service: a globally sorted expiration list served by a single
//! manager kernel thread, plus the cooperative sleep primitive layered
//! on top of it.
//!
//! Grounded on `ThreadTimer`/`ThreadTimerSleep` in `threadtimer.h`/`.cc`.
//! The source wakes its manager thread through a self-pipe polled with
//! `poll()`; this crate uses a `Mutex`+`Condvar` with `wait_timeout`
//! instead, which gives the same "sleep until next expiration or until
//! woken by a new earlier timer" behavior without a raw file descriptor
//! (SS9 Open Questions resolves this substitution explicitly).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar as StdCondvar, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use crate::dispatcher::Dispatcher;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    expiration: Instant,
    seq: u64,
    timer: Arc<TimerInner>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.expiration == other.expiration && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the binary heap is a min-heap on expiration, with
        // insertion order as the tiebreaker (matches the source's
        // sorted-insert-from-the-tail discipline).
        other
            .expiration
            .cmp(&self.expiration)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TimerInner {
    canceled: AtomicBool,
    in_queue: AtomicBool,
    callback: StdMutex<Option<Callback>>,
}

/// A one-shot timer: construct with [`Timer::new`], arm with
/// [`Timer::start`]. Dropping a `Timer` does not cancel it -- call
/// [`Timer::cancel`] explicitly, exactly like the source's
/// reference-counted `ThreadTimer` (SS3 "Lifecycle: ... released when
/// `refcount` hits zero").
pub struct Timer {
    inner: Arc<TimerInner>,
    delay: Duration,
}

impl Timer {
    pub fn new(delay: Duration, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                canceled: AtomicBool::new(false),
                in_queue: AtomicBool::new(false),
                callback: StdMutex::new(Some(Box::new(callback))),
            }),
            delay,
        }
    }

    /// Queues this timer to fire after its delay, waking the manager
    /// thread if it was idle waiting on a later expiration.
    pub fn start(&self) {
        manager().start(self.inner.clone(), self.delay);
    }

    /// Returns `true` if this call is the one that canceled the timer
    /// (i.e. it had not already fired or been canceled).
    pub fn cancel(&self) -> bool {
        manager().cancel(&self.inner)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }
}

struct Manager {
    heap: StdMutex<BinaryHeap<Entry>>,
    wake: StdCondvar,
    next_seq: AtomicU64,
}

static MANAGER: OnceLock<Arc<Manager>> = OnceLock::new();

fn manager() -> Arc<Manager> {
    MANAGER
        .get_or_init(|| {
            let mgr = Arc::new(Manager {
                heap: StdMutex::new(BinaryHeap::new()),
                wake: StdCondvar::new(),
                next_seq: AtomicU64::new(0),
            });
            let runner = mgr.clone();
            std::thread::Builder::new()
                .name("lwt-timer-manager".into())
                .spawn(move || runner.run())
                .expect("lwt: failed to spawn timer manager thread");
            mgr
        })
        .clone()
}

impl Manager {
    fn start(&self, timer: Arc<TimerInner>, delay: Duration) {
        let expiration = Instant::now() + delay;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        timer.in_queue.store(true, Ordering::SeqCst);

        let mut heap = self.heap.lock().unwrap();
        let was_empty_or_later = heap
            .peek()
            .map(|head| head.expiration > expiration)
            .unwrap_or(true);
        heap.push(Entry {
            expiration,
            seq,
            timer,
        });
        drop(heap);
        if was_empty_or_later {
            self.wake.notify_all();
        }
    }

    /// Mirrors `ThreadTimer::cancel`: under the timer mutex, mark
    /// canceled (if not already) and drop the creation reference. If
    /// the timer already fired, this is a harmless no-op (the fired
    /// flag and the canceled flag are mutually exclusive in practice,
    /// since the manager marks `canceled` itself right after a
    /// callback returns -- SS4.6 "fire xor cancel").
    fn cancel(&self, timer: &Arc<TimerInner>) -> bool {
        let _heap = self.heap.lock().unwrap();
        !timer.canceled.swap(true, Ordering::SeqCst)
    }

    fn run(self: Arc<Self>) {
        // The manager thread invokes arbitrary user callbacks, which may
        // themselves call blocking lwt primitives (SS4.6's `ThreadTimer::init`
        // calls `pthreadTop` for exactly this reason).
        Dispatcher::adopt_host_thread("lwt-timer-manager");

        let mut heap = self.heap.lock().unwrap();
        loop {
            let now = Instant::now();
            let due = matches!(heap.peek(), Some(head) if head.expiration <= now);
            if due {
                let entry = heap.pop().unwrap();
                entry.timer.in_queue.store(false, Ordering::SeqCst);
                drop(heap);

                if !entry.timer.canceled.swap(true, Ordering::SeqCst) {
                    if let Some(cb) = entry.timer.callback.lock().unwrap().take() {
                        cb();
                    }
                }

                heap = self.heap.lock().unwrap();
                continue;
            }

            let wait_for = heap
                .peek()
                .map(|head| head.expiration.saturating_duration_since(now));
            heap = match wait_for {
                Some(d) => self.wake.wait_timeout(heap, d).unwrap().0,
                None => self.wake.wait(heap).unwrap(),
            };
        }
    }
}

/// Cooperative sleep: blocks the calling user thread for approximately
/// `ms` milliseconds without occupying its dispatcher (SS4.6
/// `ThreadTimer::sleep`/`ThreadTimerSleep`).
pub fn sleep_ms(ms: u64) {
    let mutex: Arc<dyn crate::mutex::BaseLock> = Arc::new(crate::mutex::Mutex::new());
    let cv = Arc::new(crate::condvar::Condvar::bound_to(mutex.clone()));

    let cv_for_cb = cv.clone();
    let mutex_for_cb = mutex.clone();
    let timer = Timer::new(Duration::from_millis(ms), move || {
        mutex_for_cb.take();
        cv_for_cb.broadcast();
        mutex_for_cb.release();
    });

    mutex.take();
    timer.start();
    cv.wait();
    mutex.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    fn ensure_setup() {
        Dispatcher::setup(&RuntimeConfig::default().with_dispatchers(2));
        Dispatcher::adopt_host_thread("timer-test");
    }

    #[test]
    fn fires_after_delay_not_before() {
        ensure_setup();
        let fired = Arc::new(StdAtomicBool::new(false));
        let flag = fired.clone();
        let timer = Timer::new(Duration::from_millis(80), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timer.start();

        std::thread::sleep(Duration::from_millis(20));
        assert!(!fired.load(Ordering::SeqCst));

        std::thread::sleep(Duration::from_millis(120));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_fire_prevents_callback() {
        ensure_setup();
        let fired = Arc::new(StdAtomicBool::new(false));
        let flag = fired.clone();
        let timer = Timer::new(Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });
        timer.start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.cancel());

        std::thread::sleep(Duration::from_millis(200));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn repeated_cancel_races_never_fire_late() {
        ensure_setup();
        for _ in 0..100 {
            let fired = Arc::new(StdAtomicBool::new(false));
            let flag = fired.clone();
            let timer = Timer::new(Duration::from_millis(5), move || {
                flag.store(true, Ordering::SeqCst);
            });
            timer.start();
            std::thread::sleep(Duration::from_millis(5));
            let canceled_first = timer.cancel();
            // Whichever of {fire, cancel} won, no crash and no double-fire.
            if canceled_first {
                std::thread::sleep(Duration::from_millis(5));
                assert!(!fired.load(Ordering::SeqCst));
            }
        }
    }
}
