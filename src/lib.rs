//! `lwt` -- a user-space M:N cooperative threading runtime.
//!
//! Many lightweight user threads are multiplexed over a small, fixed
//! pool of kernel threads ("dispatchers"). Blocking primitives --
//! mutexes, condition variables, read/write/upgrade locks, timers,
//! one-shot file-descriptor readiness events, pipes, and a thread pool
//! -- suspend only the calling user thread, never the dispatcher
//! underneath it. See `SPEC_FULL.md` for the full design; this module
//! only wires the pieces together and re-exports the public surface.
//!
//! Call [`setup`] once before spawning any [`Thread`], or call
//! [`adopt_host_thread`] from a kernel thread that wants to use
//! blocking primitives without going through a dispatcher's own run
//! queue (e.g. a `main` thread driving the rest of the program).
//!
//! ```no_run
//! lwt::setup(&lwt::RuntimeConfig::default());
//!
//! let t = lwt::Thread::spawn("worker", None, true, || {
//!     Box::new(42i32)
//! });
//! let value = t.join().downcast::<i32>().unwrap();
//! assert_eq!(*value, 42);
//! ```

pub mod condvar;
pub mod config;
pub mod deadlock;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod logging;
pub mod mutex;
pub mod pipe;
pub mod queue;
pub mod rwlock;
pub mod spinlock;
pub mod switch;
pub mod thread;
pub mod threadpool;
pub mod timer;

pub use config::RuntimeConfig;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result, Status};

pub use condvar::Condvar;
pub use event::{Direction, Event};
pub use mutex::{BaseLock, Mutex};
pub use pipe::Pipe;
pub use rwlock::RwLock;
pub use thread::{ExitValue, ThreadId, UserThread as Thread};
pub use threadpool::{ThreadPool, Worker};
pub use timer::Timer;

/// Brings up the dispatcher pool described by `config`: spawns its
/// kernel threads, installs the default logger if none is installed
/// yet, and starts the background deadlock monitor. Idempotent --
/// later calls after the first are no-ops (SS6 `setup`).
pub fn setup(config: &RuntimeConfig) {
    Dispatcher::setup(config);
    deadlock::start_monitor(config);
}

/// Makes the calling kernel thread LWT-capable without going through
/// the dispatcher pool's run queue: creates a special, non-round-robin
/// dispatcher wired to this thread, so any blocking primitive it calls
/// suspends and resumes right here. A no-op if the caller is already
/// LWT-capable, whether as a dispatcher-run user thread or a
/// previously adopted host thread (SS8 boundary behavior).
pub fn adopt_host_thread(name: impl Into<String>) -> std::sync::Arc<Thread> {
    Dispatcher::adopt_host_thread(name)
}

/// True if the calling kernel thread is currently running as a
/// dispatcher-scheduled user thread or an adopted host thread.
pub fn is_lwt() -> bool {
    Dispatcher::is_lwt()
}

/// Returns the [`ThreadId`] of the thread currently running on this
/// kernel thread, or `None` off any dispatcher.
pub fn current_thread() -> Option<std::sync::Arc<Thread>> {
    Dispatcher::current_thread()
}

/// Runs one deadlock sweep and returns whether a cycle was found (SS6
/// `check_for_deadlocks`), without waiting for the background monitor.
pub fn check_for_deadlocks() -> bool {
    !deadlock::check_for_deadlocks().is_empty()
}
