//! User threads: stack, saved context, and the join/exit lifecycle.
//!
//! Grounded on `Thread`/`ThreadDispatcher` in the original `thread.h` /
//! `thread.cc`: a thread is created with a start procedure and an
//! optional stack size, runs cooperatively until it blocks or exits, and
//! -- crucially -- never frees its own stack. A joinable thread with no
//! joiner yet lingers on the global join list; one with a waiting joiner
//! hands its exit value over and lets the joiner do the freeing; a
//! non-joinable thread hands itself to a helper thread instead.

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::dispatcher::Dispatcher;
use crate::spinlock::SpinLock;
use crate::switch::{self, Context};

/// The value a joinable thread hands back to its joiner.
pub type ExitValue = Box<dyn Any + Send>;

/// Stable identity for a [`UserThread`], also used as the hash key for
/// dispatcher selection (SS4.1: "hashed by thread address modulo
/// dispatcher count").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    fn next() -> Self {
        ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Implemented by anything a thread can be recorded as blocked on
/// (`Mutex`, the rw-lock's write/upgrade side), so the deadlock detector
/// can walk `thread -> owner(blocking)` without depending on those types
/// directly.
pub trait BlockingNode: Send + Sync {
    /// The thread currently holding this lock, if any.
    fn owner(&self) -> Option<ThreadId>;
    /// Short description for a deadlock trace line.
    fn describe(&self) -> String;
}

/// A heap-allocated stack, sentinel-filled at creation so
/// [`Stack::high_water_mark`] can report usage on demand (SS4.2).
pub(crate) struct Stack {
    bytes: Box<[u8]>,
    top: *mut u8,
}

const STACK_SENTINEL: u8 = 0xCD;

// The stack's bytes are only ever touched by `switch_context`/the
// trampoline running on whichever OS thread currently owns this user
// thread's execution; the scheduling protocol in `dispatcher.rs`
// guarantees at most one owner at a time.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    pub(crate) fn new(size: usize) -> Self {
        let mut bytes = vec![STACK_SENTINEL; size].into_boxed_slice();
        let top = unsafe { bytes.as_mut_ptr().add(bytes.len()) };
        Self { bytes, top }
    }

    pub(crate) fn top(&self) -> *mut u8 {
        self.top
    }

    fn high_water_mark(&self) -> usize {
        for (used_from_low, byte) in self.bytes.iter().enumerate() {
            if *byte != STACK_SENTINEL {
                return self.bytes.len() - used_from_low;
            }
        }
        0
    }
}

/// A lightweight, cooperatively-scheduled user thread.
pub struct UserThread {
    pub id: ThreadId,
    name: Mutex<String>,
    stack: Option<Stack>,
    context: UnsafeCell<Context>,
    entry: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    started: AtomicBool,

    pub(crate) joinable: AtomicBool,
    pub(crate) exited: AtomicBool,
    pub(crate) going_to_sleep: AtomicBool,
    in_join_list: AtomicBool,
    /// Scratch sweep-generation tag used only by the deadlock detector.
    pub(crate) marked: AtomicU64,

    pub(crate) dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    /// Set only for host-adopted threads: the one dispatcher they always
    /// return to (SS4.1 "wired dispatcher").
    pub(crate) wired_dispatcher: Option<Arc<Dispatcher>>,
    pub(crate) blocking: Mutex<Option<Arc<dyn BlockingNode>>>,

    exit_value: Mutex<Option<ExitValue>>,
    joiner: Mutex<Option<Arc<UserThread>>>,

    created_at: Instant,
    run_ticks: AtomicU64,
}

// `context` is only ever mutated by the dispatcher currently running
// this thread, serialized by the same run-queue/sleep protocol that
// guarantees a thread is never scheduled onto two dispatchers at once.
unsafe impl Sync for UserThread {}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<HashMap<ThreadId, Arc<UserThread>>> = Mutex::new(HashMap::new());
    static ref JOIN_LIST: Mutex<Vec<Arc<UserThread>>> = Mutex::new(Vec::new());
    /// Guards the global thread registry and join list (SS5 "Global
    /// thread registry and join list: protected by one process-wide
    /// spin lock").
    pub(crate) static ref GLOBAL_THREAD_LOCK: SpinLock = SpinLock::new();
}

impl UserThread {
    /// Creates and queues a new user thread. `body` runs on the new
    /// thread's own stack; its return value becomes the join value if
    /// `joinable` is set.
    pub fn spawn(
        name: impl Into<String>,
        stack_size: Option<usize>,
        joinable: bool,
        body: impl FnOnce() -> ExitValue + Send + 'static,
    ) -> Arc<UserThread> {
        let size = stack_size.unwrap_or(128 * 1024);
        let stack = Stack::new(size);
        let ctx = unsafe { switch::init_context(stack.top) };

        let thread = Arc::new(UserThread {
            id: ThreadId::next(),
            name: Mutex::new(name.into()),
            stack: Some(stack),
            context: UnsafeCell::new(ctx),
            entry: Mutex::new(None),
            started: AtomicBool::new(false),
            joinable: AtomicBool::new(joinable),
            exited: AtomicBool::new(false),
            going_to_sleep: AtomicBool::new(false),
            in_join_list: AtomicBool::new(false),
            marked: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
            wired_dispatcher: None,
            blocking: Mutex::new(None),
            exit_value: Mutex::new(None),
            joiner: Mutex::new(None),
            created_at: Instant::now(),
            run_ticks: AtomicU64::new(0),
        });

        let trampoline_body: Box<dyn FnOnce() + Send + 'static> = {
            let thread = thread.clone();
            Box::new(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
                match result {
                    Ok(value) => exit_current(&thread, Some(value)),
                    Err(payload) => {
                        let name = thread.name();
                        log::error!(
                            "lwt: user thread '{name}' ({:?}) panicked: {}",
                            thread.id,
                            panic_message(&payload)
                        );
                        std::process::abort();
                    }
                }
            })
        };
        *thread.entry.lock().unwrap() = Some(trampoline_body);

        REGISTRY.lock().unwrap().insert(thread.id, thread.clone());
        Dispatcher::queue_thread(thread.clone());
        thread
    }

    /// Builds a "wired" pseudo-thread representing an adopted host
    /// kernel thread: no stack of its own (it already has one --
    /// the real OS thread's), always resumed on `wired`.
    pub(crate) fn new_wired(name: impl Into<String>, wired: Arc<Dispatcher>) -> Arc<UserThread> {
        let thread = Arc::new(UserThread {
            id: ThreadId::next(),
            name: Mutex::new(name.into()),
            stack: None,
            context: UnsafeCell::new(Context::default()),
            entry: Mutex::new(None),
            started: AtomicBool::new(true),
            joinable: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            going_to_sleep: AtomicBool::new(false),
            in_join_list: AtomicBool::new(false),
            marked: AtomicU64::new(0),
            dispatcher: Mutex::new(Some(wired.clone())),
            wired_dispatcher: Some(wired),
            blocking: Mutex::new(None),
            exit_value: Mutex::new(None),
            joiner: Mutex::new(None),
            created_at: Instant::now(),
            run_ticks: AtomicU64::new(0),
        });
        REGISTRY.lock().unwrap().insert(thread.id, thread.clone());
        thread
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn set_joinable(&self) {
        self.joinable.store(true, Ordering::SeqCst);
    }

    pub fn is_joinable(&self) -> bool {
        self.joinable.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn stack_high_water_mark(&self) -> Option<usize> {
        self.stack.as_ref().map(Stack::high_water_mark)
    }

    pub fn run_ticks(&self) -> u64 {
        self.run_ticks.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    /// Takes the entry closure on its first resume only; `None` after
    /// that (the context already points mid-function from its last
    /// suspension).
    pub(crate) fn take_entry_if_first_run(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        if self.started.swap(true, Ordering::AcqRel) {
            None
        } else {
            self.entry.lock().unwrap().take()
        }
    }

    pub(crate) fn record_run_tick(&self) {
        self.run_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Joins this thread, blocking the caller cooperatively until it
    /// exits. Panics if this thread was never made joinable (SS7:
    /// invariant violation).
    pub fn join(self: &Arc<Self>) -> ExitValue {
        assert!(self.is_joinable(), "lwt: join of a non-joinable thread");

        GLOBAL_THREAD_LOCK.take();
        if self.exited.load(Ordering::SeqCst) {
            let value = self.exit_value.lock().unwrap().take();
            remove_from_join_list(self);
            GLOBAL_THREAD_LOCK.release();
            forget(self.id);
            return value.unwrap_or_else(|| Box::new(()));
        }

        let caller = Dispatcher::current_thread().expect("lwt: join called off a dispatcher");
        *self.joiner.lock().unwrap() = Some(caller.clone());
        // release_and_sleep: go to sleep holding GLOBAL_THREAD_LOCK; the
        // exiting thread's wakeup path is the only thing that re-queues
        // us, and it does so only after clearing this slot.
        Dispatcher::sleep_current(&GLOBAL_THREAD_LOCK);

        // Reacquire briefly: proves the exiting thread is fully off its
        // own stack before we read its exit value (SS4.2).
        GLOBAL_THREAD_LOCK.take();
        let value = self.exit_value.lock().unwrap().take();
        remove_from_join_list(self);
        GLOBAL_THREAD_LOCK.release();
        forget(self.id);
        value.unwrap_or_else(|| Box::new(()))
    }
}

/// Removes `thread` from the global join list if it lingered there
/// (the "joinable, no joiner yet" exit path), and clears its
/// `in_join_list` flag. Called by `join()` once the exit value has
/// been retrieved, the joinable counterpart to `forget()` below, which
/// drops the matching `REGISTRY` entry -- without both, a joined
/// thread and its stack are never freed.
fn remove_from_join_list(thread: &Arc<UserThread>) {
    if thread.in_join_list.swap(false, Ordering::SeqCst) {
        JOIN_LIST
            .lock()
            .unwrap()
            .retain(|t| !Arc::ptr_eq(t, thread));
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Called by [`crate::switch::trampoline_entry`] if a thread's body
/// returns without itself reaching `exit_current` (defensive fallback;
/// normal bodies always route through the `trampoline_body` closure
/// built in `spawn`, which already calls it).
pub(crate) fn trampoline_finished() -> ! {
    if let Some(thread) = Dispatcher::current_thread() {
        exit_current(&thread, None);
    }
    unreachable!("lwt: trampoline_finished invoked with no current thread");
}

/// Implements the three-way exit protocol from SS4.2.
fn exit_current(thread: &Arc<UserThread>, value: Option<ExitValue>) -> ! {
    thread.exited.store(true, Ordering::SeqCst);

    GLOBAL_THREAD_LOCK.take();
    let joiner = thread.joiner.lock().unwrap().take();
    *thread.exit_value.lock().unwrap() = value;

    if thread.is_joinable() {
        if let Some(joiner) = joiner {
            // A joiner is already waiting: queue it, then sleep forever
            // releasing the global lock. The joiner's own re-acquisition
            // of that lock is the proof we are off our stack.
            Dispatcher::queue_thread(joiner);
            Dispatcher::sleep_current(&GLOBAL_THREAD_LOCK);
        } else {
            // No joiner yet: linger on the join list until one arrives.
            thread.in_join_list.store(true, Ordering::SeqCst);
            JOIN_LIST.lock().unwrap().push(thread.clone());
            Dispatcher::sleep_current(&GLOBAL_THREAD_LOCK);
        }
    } else {
        // Not joinable: hand off to the dispatcher's helper thread,
        // which frees the stack from a different stack than our own,
        // then sleep forever releasing the global lock exactly like the
        // other two branches.
        Dispatcher::retire_non_joinable(thread.clone());
        Dispatcher::sleep_current(&GLOBAL_THREAD_LOCK);
    }

    unreachable!("lwt: exit_current's sleep_current never returns");
}

pub fn all_thread_ids() -> Vec<ThreadId> {
    REGISTRY.lock().unwrap().keys().copied().collect()
}

pub(crate) fn lookup(id: ThreadId) -> Option<Arc<UserThread>> {
    REGISTRY.lock().unwrap().get(&id).cloned()
}

pub(crate) fn forget(id: ThreadId) {
    REGISTRY.lock().unwrap().remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_high_water_mark_starts_at_zero() {
        let stack = Stack::new(4096);
        assert_eq!(stack.high_water_mark(), 0);
    }

    #[test]
    fn thread_ids_are_unique_and_monotonic() {
        let a = ThreadId::next();
        let b = ThreadId::next();
        assert!(b.raw() > a.raw());
    }
}
