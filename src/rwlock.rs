//! Fair read/write/upgrade lock with a starvation bound.
//!
//! Grounded on `ThreadLockRw` in `threadmutex.h`/`.cc`: readers,
//! upgraders and writers queue in three separate FIFOs; an upgrade
//! holder may atomically promote to a write lock without releasing
//! intermediate state. The source declares `readUnfair`/`upgradeUnfair`/
//! `writeUnfair` but never implements them, falling back to a cruder
//! single `_fairness` toggle; this crate actually implements the three
//! predicates against a monotonic `lock_clock`, per SS4.4/SS9's
//! resolution of that gap (`ReadWindow`/`WriteWindow` pinned in
//! [`crate::config::RuntimeConfig`]).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use crate::dispatcher::Dispatcher;
use crate::mutex::BaseLock;
use crate::spinlock::SpinLock;
use crate::thread::{ThreadId, UserThread};

struct Waiter {
    thread: Arc<UserThread>,
    tag: u64,
}

struct State {
    read_count: u32,
    write_count: u8,
    upgrade_count: u8,
    upgrade_to_write: bool,
    lock_clock: u64,
    owner: Option<Arc<UserThread>>,
    reads_waiting: VecDeque<Waiter>,
    writes_waiting: VecDeque<Waiter>,
    upgrades_waiting: VecDeque<Waiter>,
    /// Diagnostic snapshot of current read holders (SS4.4 "Tracker
    /// objects"), kept unconditionally rather than via an opt-in tracker
    /// object the caller must thread through every call -- a direct
    /// simplification over the source's optional `ThreadLockTracker`.
    readers: Vec<ThreadId>,
}

/// Fair RW/upgrade lock (SS3/SS4.4).
pub struct RwLock {
    spin: SpinLock,
    state: StdMutex<State>,
    read_window: u64,
    write_window: u64,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    pub fn new() -> Self {
        Self::with_windows(32, 4)
    }

    /// `read_window`/`write_window` are the `ReadWindow`/`WriteWindow`
    /// fairness constants from SS4.4 (defaults 32/4 per
    /// `RuntimeConfig`, `ReadWindow` much larger so read bursts are
    /// tolerated but bounded).
    pub fn with_windows(read_window: u32, write_window: u32) -> Self {
        Self {
            spin: SpinLock::new(),
            state: StdMutex::new(State {
                read_count: 0,
                write_count: 0,
                upgrade_count: 0,
                upgrade_to_write: false,
                lock_clock: 0,
                owner: None,
                reads_waiting: VecDeque::new(),
                writes_waiting: VecDeque::new(),
                upgrades_waiting: VecDeque::new(),
                readers: Vec::new(),
            }),
            read_window: read_window as u64,
            write_window: write_window as u64,
        }
    }

    fn next_tag(state: &mut State) -> u64 {
        let tag = state.lock_clock;
        state.lock_clock += 1;
        tag
    }

    fn read_unfair(&self, state: &State, candidate_tag: u64) -> bool {
        state
            .writes_waiting
            .front()
            .is_some_and(|w| candidate_tag > w.tag + self.read_window)
    }

    fn upgrade_unfair(&self, state: &State, candidate_tag: u64) -> bool {
        state
            .writes_waiting
            .front()
            .is_some_and(|w| candidate_tag > w.tag + self.write_window)
    }

    fn write_unfair(&self, state: &State, candidate_tag: u64) -> bool {
        state
            .upgrades_waiting
            .front()
            .is_some_and(|u| candidate_tag > u.tag + self.write_window)
    }

    /// Runs under `self.spin`; grants as many waiters as the current
    /// state and fairness windows allow (SS4.4 `wake_next`).
    fn wake_next(&self, state: &mut State) {
        if !state.upgrade_to_write {
            while state.write_count == 0 {
                let Some(front_tag) = state.reads_waiting.front().map(|w| w.tag) else {
                    break;
                };
                if self.read_unfair(state, front_tag) {
                    break;
                }
                let w = state.reads_waiting.pop_front().unwrap();
                state.read_count += 1;
                state.readers.push(w.thread.id);
                Dispatcher::queue_thread(w.thread);
            }
        }

        if state.upgrade_to_write && state.read_count == 0 {
            let w = state
                .writes_waiting
                .pop_front()
                .expect("lwt: pending upgrade-to-write promoter missing from write queue");
            state.upgrade_count = 0;
            state.upgrade_to_write = false;
            state.write_count = 1;
            state.owner = Some(w.thread.clone());
            Dispatcher::queue_thread(w.thread);
            return;
        }

        if state.upgrade_count == 0 && state.write_count == 0 {
            if let Some(front_tag) = state.upgrades_waiting.front().map(|w| w.tag) {
                if !self.upgrade_unfair(state, front_tag) {
                    let w = state.upgrades_waiting.pop_front().unwrap();
                    state.upgrade_count = 1;
                    state.owner = Some(w.thread.clone());
                    Dispatcher::queue_thread(w.thread);
                    return;
                }
            }
        }

        if state.read_count == 0 && state.write_count == 0 && state.upgrade_count == 0 {
            if let Some(front_tag) = state.writes_waiting.front().map(|w| w.tag) {
                if !self.write_unfair(state, front_tag) {
                    let w = state.writes_waiting.pop_front().unwrap();
                    state.write_count = 1;
                    state.owner = Some(w.thread.clone());
                    Dispatcher::queue_thread(w.thread);
                }
            }
        }
    }

    pub fn lock_write(&self) {
        let me = Dispatcher::current_thread().expect("lwt: lock_write() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        if state.read_count + state.upgrade_count as u32 + state.write_count as u32 == 0 {
            state.write_count = 1;
            state.owner = Some(me);
            drop(state);
            self.spin.release();
            return;
        }
        let tag = Self::next_tag(&mut state);
        state.writes_waiting.push_back(Waiter {
            thread: me.clone(),
            tag,
        });
        drop(state);
        Dispatcher::sleep_current(&self.spin);
        // On wake the lock has already been granted (SS4.4).
    }

    pub fn try_write(&self) -> bool {
        let me = Dispatcher::current_thread().expect("lwt: try_write() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        let ok = state.read_count + state.upgrade_count as u32 + state.write_count as u32 == 0;
        if ok {
            state.write_count = 1;
            state.owner = Some(me);
        }
        drop(state);
        self.spin.release();
        ok
    }

    pub fn release_write(&self) {
        let me = Dispatcher::current_thread().expect("lwt: release_write() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        assert!(
            state.write_count > 0 && matches!(&state.owner, Some(o) if Arc::ptr_eq(o, &me)),
            "lwt: release_write by a thread that does not hold the write lock"
        );
        state.write_count = 0;
        state.owner = None;
        self.wake_next(&mut state);
        drop(state);
        self.spin.release();
    }

    pub fn lock_read(&self) {
        let me = Dispatcher::current_thread().expect("lwt: lock_read() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();

        let tag = state.lock_clock; // peek only, not consumed unless we queue
        let must_wait = state.write_count != 0
            || state.upgrade_to_write
            || self.read_unfair(&state, tag);

        if !must_wait {
            state.read_count += 1;
            state.readers.push(me.id);
            drop(state);
            self.spin.release();
            return;
        }

        let tag = Self::next_tag(&mut state);
        state.reads_waiting.push_back(Waiter {
            thread: me.clone(),
            tag,
        });
        drop(state);
        Dispatcher::sleep_current(&self.spin);
    }

    pub fn try_read(&self) -> bool {
        let me = Dispatcher::current_thread().expect("lwt: try_read() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        let ok = state.write_count == 0 && !state.upgrade_to_write;
        if ok {
            state.read_count += 1;
            state.readers.push(me.id);
        }
        drop(state);
        self.spin.release();
        ok
    }

    pub fn release_read(&self) {
        let me = Dispatcher::current_thread().expect("lwt: release_read() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        assert!(state.read_count > 0, "lwt: release_read with no reader held");
        state.read_count -= 1;
        if let Some(pos) = state.readers.iter().position(|id| *id == me.id) {
            state.readers.remove(pos);
        }
        self.wake_next(&mut state);
        drop(state);
        self.spin.release();
    }

    pub fn lock_upgrade(&self) {
        let me = Dispatcher::current_thread().expect("lwt: lock_upgrade() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        if state.owner.is_none() {
            state.owner = Some(me);
            state.upgrade_count = 1;
            state.upgrade_to_write = false;
            drop(state);
            self.spin.release();
            return;
        }
        let tag = Self::next_tag(&mut state);
        state.upgrades_waiting.push_back(Waiter {
            thread: me.clone(),
            tag,
        });
        drop(state);
        Dispatcher::sleep_current(&self.spin);

        self.spin.take();
        let mut state = self.state.lock().unwrap();
        state.upgrade_to_write = false;
        drop(state);
        self.spin.release();
    }

    pub fn release_upgrade(&self) {
        let me = Dispatcher::current_thread().expect("lwt: release_upgrade() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        assert!(
            state.upgrade_count > 0 && matches!(&state.owner, Some(o) if Arc::ptr_eq(o, &me)),
            "lwt: release_upgrade by a thread that does not hold the upgrade lock"
        );
        state.upgrade_count = 0;
        state.owner = None;
        self.wake_next(&mut state);
        drop(state);
        self.spin.release();
    }

    /// Atomically promotes the caller's upgrade lock to a write lock.
    /// No other writer or upgrader can be granted while this is
    /// pending, and no new reads are granted either (SS4.4).
    pub fn upgrade_to_write(&self) {
        let me =
            Dispatcher::current_thread().expect("lwt: upgrade_to_write() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        assert!(
            state.upgrade_count > 0 && matches!(&state.owner, Some(o) if Arc::ptr_eq(o, &me)),
            "lwt: upgrade_to_write by a thread that does not hold the upgrade lock"
        );

        if state.read_count > 0 {
            state.upgrade_to_write = true;
            // The promoter already effectively holds the lock; prepend
            // it at the head of the write-waiters so `wake_next` finds
            // it first once readers drain (SS4.4).
            state.writes_waiting.push_front(Waiter {
                thread: me.clone(),
                tag: 0,
            });
            drop(state);
            Dispatcher::sleep_current(&self.spin);
            // wake_next's promotion branch already set write_count/owner.
        } else {
            state.upgrade_count = 0;
            state.write_count = 1;
            drop(state);
            self.spin.release();
        }

        self.spin.take();
        let mut state = self.state.lock().unwrap();
        state.upgrade_to_write = false;
        drop(state);
        self.spin.release();
    }

    /// Converts a held write lock directly into a read lock, without an
    /// intervening window where the lock is unheld (SS6 `write_to_read`).
    pub fn write_to_read(&self) {
        let me = Dispatcher::current_thread().expect("lwt: write_to_read() called off a dispatcher");
        self.spin.take();
        let mut state = self.state.lock().unwrap();
        assert!(
            state.write_count > 0 && matches!(&state.owner, Some(o) if Arc::ptr_eq(o, &me)),
            "lwt: write_to_read by a thread that does not hold the write lock"
        );
        state.write_count = 0;
        state.owner = None;
        state.read_count += 1;
        state.readers.push(me.id);
        self.wake_next(&mut state);
        drop(state);
        self.spin.release();
    }

    /// Snapshot of the threads currently holding a read lock, for
    /// diagnostics (SS4.4 "Tracker objects").
    pub fn reader_snapshot(&self) -> Vec<ThreadId> {
        self.state.lock().unwrap().readers.clone()
    }
}

/// The write side, used wherever a [`crate::condvar::Condvar`] needs to
/// bind to an rw-lock (SS4.3: "a plain mutex or the write side of an
/// rw-lock"). `release_and_sleep` is generalized to the upgrade holder
/// as well as the writer, per SS9's open question.
impl BaseLock for RwLock {
    fn take(&self) {
        self.lock_write();
    }

    fn try_lock(&self) -> bool {
        self.try_write()
    }

    fn release(&self) {
        self.release_write();
    }

    fn release_and_sleep(&self, thread: &Arc<UserThread>) {
        // Caller already holds `self.spin`.
        let mut state = self.state.lock().unwrap();
        let is_owner = matches!(&state.owner, Some(o) if Arc::ptr_eq(o, thread));
        assert!(is_owner, "lwt: release_and_sleep by a non-owner");
        if state.write_count > 0 {
            state.write_count = 0;
        } else {
            assert!(state.upgrade_count > 0, "lwt: lock held in neither write nor upgrade mode");
            state.upgrade_count = 0;
        }
        state.owner = None;
        self.wake_next(&mut state);
        drop(state);
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
