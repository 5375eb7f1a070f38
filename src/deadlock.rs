//! Pause-the-world deadlock detection.
//!
//! Grounded on `ThreadMutexDetect` in `threadmutex.h`/`.cc`
//! (`checkForDeadlocks`/`sweepFrom`/`displayTrace`/`mutexMonitorTop`):
//! a background monitor periodically pauses every dispatcher, walks the
//! wait-for graph `thread -> owner(blocking(thread))` from every thread
//! that is currently blocked, and reports any cycle it finds before
//! resuming the world. The graph edge is generic over [`BlockingNode`]
//! so the walk isn't tied to [`crate::mutex::Mutex`] specifically --
//! the rw-lock's write/upgrade side participates the same way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::thread::{all_thread_ids, lookup, ThreadId};

const MAX_TRACE_DEPTH: usize = 10_000;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Walks the wait-for graph starting at `start`, using `generation` as a
/// visited marker unique to this call. Returns the cycle, rooted at its
/// first repeated node, if one exists on this path.
fn sweep_from(start: ThreadId, generation: u64) -> Option<Vec<ThreadId>> {
    let mut path = Vec::new();
    let mut cur = start;

    loop {
        if path.len() >= MAX_TRACE_DEPTH {
            log::warn!("lwt: deadlock trace exceeded {MAX_TRACE_DEPTH} hops, abandoning sweep");
            return None;
        }

        let thread = lookup(cur)?;
        let prev = thread.marked.swap(generation, Ordering::SeqCst);
        if prev == generation {
            let idx = path.iter().position(|id| *id == cur).unwrap_or(0);
            return Some(path[idx..].to_vec());
        }
        path.push(cur);

        let next_owner = {
            let guard = thread.blocking.lock().unwrap();
            guard.as_ref().and_then(|node| node.owner())
        };
        match next_owner {
            Some(owner) if owner != cur => cur = owner,
            _ => return None,
        }
    }
}

fn canonical(cycle: &[ThreadId]) -> Vec<ThreadId> {
    let min_pos = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| id.raw())
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[min_pos..]
        .iter()
        .chain(cycle[..min_pos].iter())
        .copied()
        .collect()
}

/// Pauses every dispatcher, sweeps the wait-for graph from every thread
/// currently blocked on a lock, and resumes the world. Returns each
/// distinct cycle found (as a list of thread ids in wait-for order).
pub fn check_for_deadlocks() -> Vec<Vec<ThreadId>> {
    Dispatcher::pause_all();
    while !Dispatcher::paused_all() && !Dispatcher::all().is_empty() {
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut cycles: Vec<Vec<ThreadId>> = Vec::new();
    for id in all_thread_ids() {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        if let Some(cycle) = sweep_from(id, generation) {
            let canon = canonical(&cycle);
            if !cycles.iter().any(|c| *c == canon) {
                cycles.push(canon);
            }
        }
    }

    Dispatcher::resume_all();
    cycles
}

/// Renders a cycle as a human-readable trace line (`mutexMonitorTop`'s
/// log output in the source).
pub fn display_trace(cycle: &[ThreadId]) -> String {
    let mut line = String::from("lwt: deadlock cycle: ");
    for (i, id) in cycle.iter().enumerate() {
        if i > 0 {
            line.push_str(" -> ");
        }
        match lookup(*id) {
            Some(t) => line.push_str(&format!("{}({:?})", t.name(), id)),
            None => line.push_str(&format!("{id:?}")),
        }
    }
    line.push_str(" -> (cycle)");
    line
}

struct MonitorConfig {
    interval: Duration,
    abort_on_deadlock: bool,
}

static MONITOR: OnceLock<()> = OnceLock::new();

/// Starts the background monitor thread, idempotent. Polls at
/// `config.deadlock_check_interval`; if `config.abort_on_deadlock` is
/// set, a detected cycle aborts the process after logging every trace,
/// matching `mutexMonitorTop`'s fatal-by-default posture.
pub fn start_monitor(config: &crate::config::RuntimeConfig) {
    let cfg = MonitorConfig {
        interval: config.deadlock_check_interval,
        abort_on_deadlock: config.abort_on_deadlock,
    };
    MONITOR.get_or_init(|| {
        std::thread::Builder::new()
            .name("lwt-deadlock-monitor".into())
            .spawn(move || monitor_loop(cfg))
            .expect("lwt: failed to spawn deadlock monitor thread");
    });
}

fn monitor_loop(cfg: MonitorConfig) {
    loop {
        std::thread::sleep(cfg.interval);
        let cycles = check_for_deadlocks();
        if cycles.is_empty() {
            continue;
        }
        for cycle in &cycles {
            log::error!("{}", display_trace(cycle));
        }
        if cfg.abort_on_deadlock {
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::mutex::Mutex;
    use crate::thread::UserThread;
    use std::sync::Arc;

    fn ensure_setup() {
        Dispatcher::setup(&RuntimeConfig::default().with_dispatchers(4));
    }

    #[test]
    fn finds_no_cycle_when_nothing_is_blocked() {
        ensure_setup();
        let mutex = Arc::new(Mutex::new());
        let t = UserThread::spawn("solo", None, true, move || {
            mutex.take();
            mutex.release();
            Box::new(())
        });
        t.join();
        assert!(check_for_deadlocks().is_empty());
    }

    #[test]
    fn ab_ba_cross_lock_pattern_is_detected() {
        ensure_setup();
        let a = Arc::new(Mutex::new());
        let b = Arc::new(Mutex::new());
        let mut joins = Vec::new();

        for _ in 0..4 {
            let a = a.clone();
            let b = b.clone();
            joins.push(UserThread::spawn("ab", None, true, move || {
                a.take();
                std::thread::sleep(Duration::from_millis(20));
                b.take();
                b.release();
                a.release();
                Box::new(())
            }));
        }
        for _ in 0..4 {
            let a = a.clone();
            let b = b.clone();
            joins.push(UserThread::spawn("ba", None, true, move || {
                b.take();
                std::thread::sleep(Duration::from_millis(20));
                a.take();
                a.release();
                b.release();
                Box::new(())
            }));
        }

        std::thread::sleep(Duration::from_millis(60));
        let cycles = check_for_deadlocks();
        assert!(!cycles.is_empty());
        assert!(cycles.iter().any(|c| c.len() >= 2));

        // The deadlocked threads never finish; drop the join handles
        // rather than block the test suite on them forever.
        std::mem::forget(joins);
    }
}
