//! The per-kernel-thread scheduler and the suspend/resume protocol.
//!
//! Grounded on `ThreadDispatcher` in `thread.h`/`thread.cc`: each
//! dispatcher owns a run queue, an idle context used to host the
//! scheduler loop off any user thread's stack, and a sleep mutex/cv used
//! to park the kernel thread when there is no work. The round-robin
//! dispatcher table is separate from the full dispatcher list (which
//! also includes host-adopted "special" dispatchers) exactly as in the
//! source: hashed selection only ever picks among round-robin members.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::spinlock::{Spin, SpinLock};
use crate::switch::{self, Context};
use crate::thread::UserThread;

pub struct Dispatcher {
    /// `Some(i)` for round-robin members, `None` for a host-adopted
    /// special dispatcher.
    pub index: Option<usize>,

    run_queue: Spin<VecDeque<Arc<UserThread>>>,

    /// Scratch storage for "where was the scheduler loop when it last
    /// switched away". For a round-robin dispatcher this is first
    /// populated by the dispatcher's own kernel-thread entry point
    /// (`run_loop`, called directly on that thread's native stack) the
    /// first time it resumes a user thread. For a special dispatcher
    /// there is no independent kernel thread running `run_loop` already
    /// -- the host thread's own call into `sleep_current` is what first
    /// transfers control onto `idle_stack`, via `idle_entry` below.
    idle_context: std::cell::UnsafeCell<Context>,
    idle_stack: Option<crate::thread::Stack>,
    idle_started: AtomicBool,
    idle_entry: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,

    sleeping: Mutex<bool>,
    wake_cv: Condvar,
    pause_count: AtomicUsize,
    paused_observed: AtomicBool,
    spin_micros: u64,

    helper_queue: Spin<VecDeque<Arc<UserThread>>>,
    helper_wake: Mutex<bool>,
    helper_cv: Condvar,

    /// Lock a sleeping thread stashed for the idle side to release,
    /// strictly after the thread is physically off its own stack. Only
    /// ever touched by the OS thread that owns this dispatcher.
    pending_release: Cell<Option<*const SpinLock>>,
}

// `idle_context`/`pending_release` are only touched by the one OS thread
// that currently owns this dispatcher's scheduling loop; every other
// field has its own lock.
unsafe impl Send for Dispatcher {}
unsafe impl Sync for Dispatcher {}

lazy_static::lazy_static! {
    /// Round-robin members only -- what hashed thread selection picks
    /// among.
    static ref DISPATCHERS: Mutex<Vec<Arc<Dispatcher>>> = Mutex::new(Vec::new());
    /// Every dispatcher, including host-adopted special ones -- what the
    /// deadlock detector's pause protocol iterates.
    static ref ALL_DISPATCHERS: Mutex<Vec<Arc<Dispatcher>>> = Mutex::new(Vec::new());
}

thread_local! {
    static CURRENT_DISPATCHER: RefCell<Option<Arc<Dispatcher>>> = const { RefCell::new(None) };
    static CURRENT_THREAD: RefCell<Option<Arc<UserThread>>> = const { RefCell::new(None) };
}

impl Dispatcher {
    fn new_round_robin(index: usize, spin_micros: u64) -> Arc<Self> {
        Arc::new(Self {
            index: Some(index),
            run_queue: Spin::new(VecDeque::new()),
            idle_context: std::cell::UnsafeCell::new(Context::default()),
            idle_stack: None,
            idle_started: AtomicBool::new(true),
            idle_entry: Mutex::new(None),
            sleeping: Mutex::new(false),
            wake_cv: Condvar::new(),
            pause_count: AtomicUsize::new(0),
            paused_observed: AtomicBool::new(false),
            spin_micros,
            helper_queue: Spin::new(VecDeque::new()),
            helper_wake: Mutex::new(false),
            helper_cv: Condvar::new(),
            pending_release: Cell::new(None),
        })
    }

    fn new_special(spin_micros: u64) -> Arc<Self> {
        const IDLE_STACK_SIZE: usize = 64 * 1024;
        let stack = crate::thread::Stack::new(IDLE_STACK_SIZE);
        let ctx = unsafe { switch::init_context(stack.top()) };
        let dispatcher = Arc::new(Self {
            index: None,
            run_queue: Spin::new(VecDeque::new()),
            idle_context: std::cell::UnsafeCell::new(ctx),
            idle_stack: Some(stack),
            idle_started: AtomicBool::new(false),
            idle_entry: Mutex::new(None),
            sleeping: Mutex::new(false),
            wake_cv: Condvar::new(),
            pause_count: AtomicUsize::new(0),
            paused_observed: AtomicBool::new(false),
            spin_micros,
            helper_queue: Spin::new(VecDeque::new()),
            helper_wake: Mutex::new(false),
            helper_cv: Condvar::new(),
            pending_release: Cell::new(None),
        });
        let entry_target = dispatcher.clone();
        *dispatcher.idle_entry.lock().unwrap() =
            Some(Box::new(move || entry_target.run_loop()));
        dispatcher
    }

    /// Brings up the dispatcher pool: `n` round-robin dispatchers, each
    /// with its own kernel thread and helper thread. Idempotent.
    pub fn setup(config: &crate::config::RuntimeConfig) {
        crate::logging::init();
        let mut table = DISPATCHERS.lock().unwrap();
        if !table.is_empty() {
            return;
        }
        let n = config.resolved_dispatcher_count();
        for i in 0..n {
            let dispatcher = Dispatcher::new_round_robin(i, config.spin_micros);
            ALL_DISPATCHERS.lock().unwrap().push(dispatcher.clone());
            table.push(dispatcher.clone());

            let runner = dispatcher.clone();
            std::thread::Builder::new()
                .name(format!("lwt-dispatcher-{i}"))
                .spawn(move || runner.run_loop())
                .expect("lwt: failed to spawn dispatcher kernel thread");

            let helper = dispatcher.clone();
            std::thread::Builder::new()
                .name(format!("lwt-helper-{i}"))
                .spawn(move || helper.helper_loop())
                .expect("lwt: failed to spawn helper kernel thread");
        }
        log::info!("lwt: {n} dispatcher(s) started");
    }

    pub fn current() -> Option<Arc<Dispatcher>> {
        CURRENT_DISPATCHER.with(|c| c.borrow().clone())
    }

    pub fn current_thread() -> Option<Arc<UserThread>> {
        CURRENT_THREAD.with(|c| c.borrow().clone())
    }

    pub fn is_lwt() -> bool {
        Self::current().is_some()
    }

    /// Makes the calling kernel thread LWT-capable. A no-op if it
    /// already is (SS4.1, SS8 boundary behavior).
    pub fn adopt_host_thread(name: impl Into<String>) -> Arc<UserThread> {
        if let Some(existing) = Self::current_thread() {
            return existing;
        }
        let dispatcher = Dispatcher::new_special(200);
        ALL_DISPATCHERS.lock().unwrap().push(dispatcher.clone());
        CURRENT_DISPATCHER.with(|c| *c.borrow_mut() = Some(dispatcher.clone()));
        let wired = UserThread::new_wired(name, dispatcher);
        CURRENT_THREAD.with(|c| *c.borrow_mut() = Some(wired.clone()));
        wired
    }

    /// Dispatcher selection: hashed by thread identity modulo the
    /// round-robin dispatcher count, except wired (host-adopted) threads
    /// which always return to their own dispatcher (SS4.1).
    fn select_dispatcher(thread: &Arc<UserThread>) -> Arc<Dispatcher> {
        if let Some(wired) = &thread.wired_dispatcher {
            return wired.clone();
        }
        let table = DISPATCHERS.lock().unwrap();
        assert!(
            !table.is_empty(),
            "lwt: setup() must run before any thread is queued"
        );
        let hash = Arc::as_ptr(thread) as usize as u64;
        let ix = (hash % 127) % table.len() as u64;
        table[ix as usize].clone()
    }

    /// Appends `thread` to the selected dispatcher's run queue, waking
    /// that dispatcher if it was parked (SS4.1 `queue(thread)`).
    pub fn queue_thread(thread: Arc<UserThread>) {
        let dispatcher = Self::select_dispatcher(&thread);
        *thread.dispatcher.lock().unwrap() = Some(dispatcher.clone());
        dispatcher.run_queue.lock().push_back(thread);

        let mut sleeping = dispatcher.sleeping.lock().unwrap();
        if *sleeping {
            *sleeping = false;
            dispatcher.wake_cv.notify_all();
        }
    }

    pub(crate) fn retire_non_joinable(thread: Arc<UserThread>) {
        let dispatcher = thread
            .dispatcher
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Self::select_dispatcher(&thread));
        dispatcher.helper_queue.lock().push_back(thread);
        let mut ready = dispatcher.helper_wake.lock().unwrap();
        *ready = true;
        dispatcher.helper_cv.notify_all();
    }

    /// The core release-and-sleep primitive (SS4.1). Must be called on
    /// the current user thread's own stack while `lock` is held and
    /// guards whatever wait-list insertion the caller already performed.
    pub fn sleep_current(lock: &SpinLock) {
        let thread = CURRENT_THREAD
            .with(|c| c.borrow_mut().take())
            .expect("lwt: sleep_current called with no current thread");
        let dispatcher = thread
            .dispatcher
            .lock()
            .unwrap()
            .clone()
            .expect("lwt: sleeping thread has no dispatcher");

        thread.going_to_sleep.store(true, Ordering::SeqCst);
        dispatcher.pending_release.set(Some(lock as *const SpinLock));

        if !dispatcher.idle_started.swap(true, Ordering::AcqRel) {
            if let Some(entry) = dispatcher.idle_entry.lock().unwrap().take() {
                switch::set_pending_entry(entry);
            }
        }

        let thread_ctx = thread.context_ptr();
        let idle_ctx = dispatcher.idle_context.get();
        unsafe { switch::switch_context(thread_ctx, idle_ctx) };

        // We only return here once some dispatcher has resumed us again.
        thread.going_to_sleep.store(false, Ordering::SeqCst);
        CURRENT_THREAD.with(|c| *c.borrow_mut() = Some(thread));
    }

    /// Resumes `thread` on this dispatcher. Returns once that thread
    /// next goes back to sleep (or exits for good).
    fn resume(self: &Arc<Self>, thread: Arc<UserThread>) {
        CURRENT_THREAD.with(|c| *c.borrow_mut() = Some(thread.clone()));
        *thread.dispatcher.lock().unwrap() = Some(self.clone());
        thread.record_run_tick();

        if let Some(entry) = thread.take_entry_if_first_run() {
            switch::set_pending_entry(entry);
        }

        let thread_ctx = thread.context_ptr();
        let idle_ctx = self.idle_context.get();
        unsafe { switch::switch_context(idle_ctx, thread_ctx) };

        // Back on the idle side: only now may the lock the thread was
        // protecting its wait-list insertion with become visibly
        // released -- the thread is provably off its own stack.
        if let Some(lock_ptr) = self.pending_release.take() {
            unsafe { (*lock_ptr).release() };
        }
    }

    /// The scheduler loop (SS4.1). For a round-robin dispatcher this
    /// runs directly on its kernel thread's native stack. For a special
    /// (host-adopted) dispatcher it runs on `idle_stack`, entered for
    /// the first time via `sleep_current`'s context switch rather than
    /// a direct call.
    fn run_loop(self: Arc<Self>) {
        CURRENT_DISPATCHER.with(|c| *c.borrow_mut() = Some(self.clone()));
        loop {
            if self.pause_count.load(Ordering::SeqCst) > 0 {
                self.wait_while_paused();
                continue;
            }

            if let Some(thread) = self.run_queue.lock().pop_front() {
                self.resume(thread);
                continue;
            }

            if let Some(thread) = self.spin_for_work() {
                self.resume(thread);
                continue;
            }

            self.park_until_work();
        }
    }

    fn spin_for_work(&self) -> Option<Arc<UserThread>> {
        let deadline = Instant::now() + Duration::from_micros(self.spin_micros);
        while Instant::now() < deadline {
            if let Some(thread) = self.run_queue.lock().pop_front() {
                return Some(thread);
            }
            std::hint::spin_loop();
        }
        None
    }

    fn park_until_work(&self) {
        let mut sleeping = self.sleeping.lock().unwrap();
        *sleeping = true;
        while *sleeping && self.pause_count.load(Ordering::SeqCst) == 0 {
            let (guard, timed_out) = self
                .wake_cv
                .wait_timeout(sleeping, Duration::from_millis(50))
                .unwrap();
            sleeping = guard;
            if timed_out.timed_out() && !self.run_queue.lock().is_empty() {
                *sleeping = false;
            }
        }
        *sleeping = false;
    }

    fn wait_while_paused(&self) {
        self.paused_observed.store(true, Ordering::SeqCst);
        let mut guard = self.sleeping.lock().unwrap();
        while self.pause_count.load(Ordering::SeqCst) > 0 {
            let (g, _) = self
                .wake_cv
                .wait_timeout(guard, Duration::from_millis(20))
                .unwrap();
            guard = g;
        }
        self.paused_observed.store(false, Ordering::SeqCst);
    }

    fn helper_loop(self: Arc<Self>) {
        loop {
            let mut ready = self.helper_wake.lock().unwrap();
            while !*ready {
                ready = self.helper_cv.wait(ready).unwrap();
            }
            *ready = false;
            drop(ready);

            while let Some(thread) = self.helper_queue.lock().pop_front() {
                let id = thread.id;
                drop(thread); // frees the stack; never done by the thread itself.
                crate::thread::forget(id);
            }
        }
    }

    // -- pause protocol (SS4.1, used exclusively by the deadlock detector) --

    pub fn pause_all() {
        for d in ALL_DISPATCHERS.lock().unwrap().iter() {
            d.pause_count.fetch_add(1, Ordering::SeqCst);
            d.wake_cv.notify_all();
        }
    }

    pub fn resume_all() {
        for d in ALL_DISPATCHERS.lock().unwrap().iter() {
            d.pause_count.fetch_sub(1, Ordering::SeqCst);
            d.wake_cv.notify_all();
        }
    }

    pub fn paused_all() -> bool {
        ALL_DISPATCHERS
            .lock()
            .unwrap()
            .iter()
            .all(|d| d.paused_observed.load(Ordering::SeqCst))
    }

    pub fn all() -> Vec<Arc<Dispatcher>> {
        ALL_DISPATCHERS.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::atomic::AtomicU32;

    fn ensure_setup() {
        Dispatcher::setup(&RuntimeConfig::default().with_dispatchers(2));
    }

    #[test]
    fn spawned_thread_runs_and_joins() {
        ensure_setup();
        let flag = Arc::new(AtomicU32::new(0));
        let flag2 = flag.clone();
        let t = UserThread::spawn("test-runner", None, true, move || {
            flag2.store(42, Ordering::SeqCst);
            Box::new(()) as crate::thread::ExitValue
        });
        t.join();
        assert_eq!(flag.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn non_joinable_threads_are_retired_by_the_helper() {
        ensure_setup();
        let flag = Arc::new(AtomicU32::new(0));
        let flag2 = flag.clone();
        let marker = Arc::new(AtomicU32::new(0));
        let marker2 = marker.clone();
        let anchor = UserThread::spawn("anchor", None, true, move || {
            UserThread::spawn("fire-and-forget", None, false, move || {
                flag2.store(7, Ordering::SeqCst);
                Box::new(())
            });
            // Give the non-joinable thread a chance to run before we exit.
            std::thread::sleep(Duration::from_millis(50));
            marker2.store(1, Ordering::SeqCst);
            Box::new(())
        });
        anchor.join();
        assert_eq!(marker.load(Ordering::SeqCst), 1);
        assert_eq!(flag.load(Ordering::SeqCst), 7);
    }
}
