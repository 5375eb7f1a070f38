//! A fixed-capacity pool of reusable worker threads.
//!
//! Grounded on `ThreadPool`/`ThreadPool::Worker` in `threadpool.h`/`.cc`:
//! a worker cycles idle -> active -> join -> joined -> idle (or straight
//! back to idle if `idle_on_exit` was set), with a lock shared by the
//! pool and every worker it owns, and a distinct condvar for each of
//! the three waits (a caller waiting for an idle worker, a worker
//! waiting to be resumed, a caller waiting to join). The source's
//! `WorkerFactory::newWorker` virtual dispatch becomes a plain closure
//! here: `Worker::run` hands the worker a `FnOnce` to execute instead
//! of the caller subclassing `Worker` and overriding `tpStart`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use crate::condvar::Condvar;
use crate::mutex::{BaseLock, Mutex};
use crate::thread::{ExitValue, UserThread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    None,
    Idle,
    Active,
    Join,
    Joined,
}

type Task = Box<dyn FnOnce() -> ExitValue + Send + 'static>;

struct WorkerState {
    lifecycle: Lifecycle,
    wait_for_join: bool,
    resume_done: bool,
    finished_done: bool,
    task: Option<Task>,
    join_value: Option<ExitValue>,
}

/// A pooled worker thread, allocated via [`ThreadPool::get`] or
/// [`ThreadPool::try_get`].
pub struct Worker {
    pool: Arc<PoolShared>,
    state: StdMutex<WorkerState>,
    resume_cv: Condvar,
    join_one_ready_cv: Condvar,
    finished_cv: Condvar,
}

impl Worker {
    fn spawn(pool: Arc<PoolShared>) {
        let worker = Arc::new(Worker {
            resume_cv: Condvar::bound_to(pool.lock.clone()),
            join_one_ready_cv: Condvar::bound_to(pool.lock.clone()),
            finished_cv: Condvar::bound_to(pool.lock.clone()),
            pool,
            state: StdMutex::new(WorkerState {
                lifecycle: Lifecycle::None,
                wait_for_join: true,
                resume_done: false,
                finished_done: false,
                task: None,
                join_value: None,
            }),
        });
        let runner = worker.clone();
        UserThread::spawn("lwt-pool-worker", None, false, move || {
            worker_loop(runner);
            Box::new(())
        });
    }

    /// Hands the worker a task to run and wakes it (`tpResume` plus the
    /// source's implicit "caller sets up subclass fields first").
    pub fn run(self: &Arc<Self>, task: impl FnOnce() -> ExitValue + Send + 'static) {
        self.pool.lock.take();
        {
            let mut st = self.state.lock().unwrap();
            st.task = Some(Box::new(task));
            st.resume_done = true;
        }
        self.pool.lock.release();
        self.resume_cv.broadcast();
    }

    /// Skips the join/joined states: once the current task finishes,
    /// this worker goes straight back to idle (`tpIdleOnExit`).
    pub fn idle_on_exit(&self) {
        self.state.lock().unwrap().wait_for_join = false;
    }

    /// Blocks until this specific worker's task completes, returning
    /// its result. `None` if the pool was shut down first.
    pub fn join(self: &Arc<Self>) -> Option<ExitValue> {
        self.pool.lock.take();
        loop {
            if self.state.lock().unwrap().lifecycle == Lifecycle::Join {
                break;
            }
            if self.pool.queues.lock().unwrap().shutdown {
                self.pool.lock.release();
                return None;
            }
            self.join_one_ready_cv.wait();
        }
        self.pool
            .queues
            .lock()
            .unwrap()
            .join_queue
            .retain(|w| !Arc::ptr_eq(w, self));
        self.state.lock().unwrap().lifecycle = Lifecycle::Joined;
        self.pool.lock.release();
        self.state.lock().unwrap().join_value.take()
    }

    /// Releases the worker back to the pool after a join, letting it
    /// resume looking for new work (`tpFinished`).
    pub fn finished(&self) {
        self.pool.lock.take();
        self.state.lock().unwrap().finished_done = true;
        self.pool.lock.release();
        self.finished_cv.broadcast();
    }
}

struct PoolQueues {
    created: usize,
    idle: VecDeque<Arc<Worker>>,
    active: Vec<Arc<Worker>>,
    join_queue: VecDeque<Arc<Worker>>,
    shutdown: bool,
}

struct PoolShared {
    lock: Arc<Mutex>,
    idle_cv: Condvar,
    join_ready_cv: Condvar,
    queues: StdMutex<PoolQueues>,
    capacity: usize,
}

/// A pool of at most `capacity` worker threads, created lazily on
/// demand (SS4.7).
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let lock = Arc::new(Mutex::new());
        let shared = Arc::new(PoolShared {
            idle_cv: Condvar::bound_to(lock.clone()),
            join_ready_cv: Condvar::bound_to(lock.clone()),
            lock,
            queues: StdMutex::new(PoolQueues {
                created: 0,
                idle: VecDeque::new(),
                active: Vec::new(),
                join_queue: VecDeque::new(),
                shutdown: false,
            }),
            capacity,
        });
        Arc::new(Self { shared })
    }

    /// Returns an idle worker, spawning a fresh one if under capacity,
    /// blocking if at capacity with none idle. `None` only once the
    /// pool is shut down.
    pub fn get(&self) -> Option<Arc<Worker>> {
        self.shared.lock.take();
        let result = loop {
            let mut queues = self.shared.queues.lock().unwrap();
            if queues.shutdown {
                break None;
            }
            if let Some(w) = queues.idle.pop_front() {
                queues.active.push(w.clone());
                drop(queues);
                w.state.lock().unwrap().lifecycle = Lifecycle::Active;
                break Some(w);
            }
            if queues.created < self.shared.capacity {
                queues.created += 1;
                drop(queues);
                Worker::spawn(self.shared.clone());
                // The new worker is still initializing; wait for it to
                // reach idle before retrying (source: "we can't use
                // workerp immediately").
                if self.shared.queues.lock().unwrap().idle.is_empty() {
                    self.shared.idle_cv.wait();
                }
                continue;
            }
            drop(queues);
            self.shared.idle_cv.wait();
        };
        self.shared.lock.release();
        result
    }

    /// Non-blocking `get`: `None` immediately if every worker is busy,
    /// the pool is at capacity, or it has been shut down.
    pub fn try_get(&self) -> Option<Arc<Worker>> {
        self.shared.lock.take();
        let mut queues = self.shared.queues.lock().unwrap();
        let result = if queues.shutdown {
            None
        } else if let Some(w) = queues.idle.pop_front() {
            queues.active.push(w.clone());
            drop(queues);
            w.state.lock().unwrap().lifecycle = Lifecycle::Active;
            Some(w)
        } else {
            if queues.created < self.shared.capacity {
                queues.created += 1;
                drop(queues);
                Worker::spawn(self.shared.clone());
            }
            None
        };
        self.shared.lock.release();
        result
    }

    /// Blocks until any worker's task completes, returning that worker
    /// (still owed a [`Worker::finished`] call) and its result. `None`
    /// once the pool is shut down with nothing left to join.
    pub fn join_any(&self) -> Option<(Arc<Worker>, ExitValue)> {
        self.shared.lock.take();
        let result = loop {
            let mut queues = self.shared.queues.lock().unwrap();
            if let Some(w) = queues.join_queue.pop_front() {
                drop(queues);
                w.state.lock().unwrap().lifecycle = Lifecycle::Joined;
                let value = w
                    .state
                    .lock()
                    .unwrap()
                    .join_value
                    .take()
                    .unwrap_or_else(|| Box::new(()));
                break Some((w, value));
            }
            if queues.shutdown {
                break None;
            }
            drop(queues);
            self.shared.join_ready_cv.wait();
        };
        self.shared.lock.release();
        result
    }

    /// Non-blocking `join_any`: `None` immediately if nothing has
    /// finished yet.
    pub fn try_join_any(&self) -> Option<(Arc<Worker>, ExitValue)> {
        self.shared.lock.take();
        let mut queues = self.shared.queues.lock().unwrap();
        let popped = queues.join_queue.pop_front();
        drop(queues);
        let result = popped.map(|w| {
            w.state.lock().unwrap().lifecycle = Lifecycle::Joined;
            let value = w
                .state
                .lock()
                .unwrap()
                .join_value
                .take()
                .unwrap_or_else(|| Box::new(()));
            (w, value)
        });
        self.shared.lock.release();
        result
    }

    /// Marks the pool shut down and wakes every worker and caller
    /// parked on any of its condvars. Unlike the source (which only
    /// wakes active/joining workers, leaving any currently-idle worker
    /// asleep forever), this wakes idle workers too -- a deliberate
    /// fix, since a parked cooperative thread holds its stack until
    /// the process exits.
    pub fn shutdown(&self) {
        self.shared.lock.take();
        let mut queues = self.shared.queues.lock().unwrap();
        queues.shutdown = true;
        let idle: Vec<_> = queues.idle.iter().cloned().collect();
        let active = queues.active.clone();
        let joining: Vec<_> = queues.join_queue.iter().cloned().collect();
        drop(queues);
        self.shared.lock.release();

        self.shared.idle_cv.broadcast();
        self.shared.join_ready_cv.broadcast();
        for w in idle.iter().chain(active.iter()).chain(joining.iter()) {
            w.resume_cv.broadcast();
            w.join_one_ready_cv.broadcast();
            w.finished_cv.broadcast();
        }
    }
}

fn worker_loop(worker: Arc<Worker>) {
    worker.pool.lock.take();
    loop {
        let mut st = worker.state.lock().unwrap();
        if st.lifecycle == Lifecycle::None {
            st.lifecycle = Lifecycle::Idle;
            drop(st);
            worker.pool.queues.lock().unwrap().idle.push_back(worker.clone());
            worker.pool.idle_cv.broadcast();
        } else {
            drop(st);
        }

        {
            let mut st = worker.state.lock().unwrap();
            st.wait_for_join = true;
            st.resume_done = false;
            st.finished_done = false;
            st.join_value = None;
        }

        loop {
            if worker.state.lock().unwrap().resume_done {
                break;
            }
            worker.resume_cv.wait();
            if worker.pool.queues.lock().unwrap().shutdown {
                worker.pool.lock.release();
                return;
            }
        }

        let task = worker.state.lock().unwrap().task.take();
        worker.pool.lock.release();
        let result = match task {
            Some(f) => f(),
            None => Box::new(()),
        };
        worker.pool.lock.take();

        worker.state.lock().unwrap().join_value = Some(result);
        worker
            .pool
            .queues
            .lock()
            .unwrap()
            .active
            .retain(|w| !Arc::ptr_eq(w, &worker));

        let wait_for_join = worker.state.lock().unwrap().wait_for_join;
        if wait_for_join {
            worker.state.lock().unwrap().lifecycle = Lifecycle::Join;
            worker
                .pool
                .queues
                .lock()
                .unwrap()
                .join_queue
                .push_back(worker.clone());
            worker.pool.join_ready_cv.broadcast();
            worker.join_one_ready_cv.broadcast();

            loop {
                if worker.state.lock().unwrap().finished_done {
                    break;
                }
                worker.finished_cv.wait();
                if worker.pool.queues.lock().unwrap().shutdown {
                    worker.pool.lock.release();
                    return;
                }
            }
        }
        worker.state.lock().unwrap().lifecycle = Lifecycle::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::dispatcher::Dispatcher;

    fn ensure_setup() {
        Dispatcher::setup(&RuntimeConfig::default().with_dispatchers(2));
        Dispatcher::adopt_host_thread("threadpool-test");
    }

    #[test]
    fn run_and_join_returns_the_task_result() {
        ensure_setup();
        let pool = ThreadPool::new(2);
        let worker = pool.get().unwrap();
        worker.run(|| Box::new(41u32 + 1));
        let value = worker.join().unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 42);
        worker.finished();
    }

    #[test]
    fn worker_is_reused_after_finished() {
        ensure_setup();
        let pool = ThreadPool::new(1);
        let first = pool.get().unwrap();
        first.run(|| Box::new(()));
        first.join();
        first.finished();

        let second = pool.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn try_get_fails_once_capacity_is_exhausted_with_no_idle() {
        ensure_setup();
        let pool = ThreadPool::new(1);
        let worker = pool.get().unwrap();
        worker.run(|| {
            std::thread::sleep(std::time::Duration::from_millis(100));
            Box::new(())
        });
        // The only worker is active and none are idle yet.
        assert!(pool.try_get().is_none());
    }

    #[test]
    fn idle_on_exit_skips_the_join_queue() {
        ensure_setup();
        let pool = ThreadPool::new(1);
        let worker = pool.get().unwrap();
        worker.idle_on_exit();
        worker.run(|| Box::new(()));

        std::thread::sleep(std::time::Duration::from_millis(100));
        let reused = pool.get().unwrap();
        assert!(Arc::ptr_eq(&worker, &reused));
    }

    #[test]
    fn join_any_collects_whichever_worker_finishes() {
        ensure_setup();
        let pool = ThreadPool::new(4);
        let mut workers = Vec::new();
        for i in 0..4u32 {
            let w = pool.get().unwrap();
            w.run(move || Box::new(i));
            workers.push(w);
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let (w, value) = pool.join_any().unwrap();
            seen.push(*value.downcast::<u32>().unwrap());
            w.finished();
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn shutdown_unblocks_pending_get() {
        ensure_setup();
        let pool = ThreadPool::new(1);
        let worker = pool.get().unwrap();
        worker.run(|| {
            std::thread::sleep(std::time::Duration::from_millis(50));
            Box::new(())
        });

        let pool_for_getter = pool.clone();
        let getter = UserThread::spawn("blocked-getter", None, true, move || {
            let result = pool_for_getter.get();
            Box::new(result.is_none())
        });

        std::thread::sleep(std::time::Duration::from_millis(10));
        pool.shutdown();

        let result = getter.join();
        assert_eq!(*result.downcast::<bool>().unwrap(), true);
    }
}
