//! Runtime configuration.

/// Tunables for [`crate::setup`] and the components it creates.
///
/// All fields have defaults pinned from the design notes; construct with
/// [`RuntimeConfig::default`] and override individual fields, or use the
/// fluent `with_*` builders.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of dispatcher kernel threads. `None` means "CPU count - 1,
    /// clamped to at least 1".
    pub n_dispatchers: Option<usize>,

    /// Microseconds a dispatcher spins looking for work before parking on
    /// its sleep condvar.
    pub spin_micros: u64,

    /// Default user-thread stack size in bytes.
    pub default_stack_size: usize,

    /// Reader tolerance window for the rw-lock's fairness check (SS4.4,
    /// SS9 Open Questions: pinned to 32 for this implementation).
    pub rw_read_window: u32,

    /// Writer/upgrader tolerance window for the rw-lock's fairness check
    /// (pinned to 4).
    pub rw_write_window: u32,

    /// Interval between background deadlock sweeps.
    pub deadlock_check_interval: std::time::Duration,

    /// Whether a detected deadlock aborts the process (true) or merely
    /// logs and returns a boolean to the caller (false).
    pub abort_on_deadlock: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            n_dispatchers: None,
            spin_micros: 200,
            default_stack_size: 128 * 1024,
            rw_read_window: 32,
            rw_write_window: 4,
            deadlock_check_interval: std::time::Duration::from_secs(10),
            abort_on_deadlock: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_dispatchers(mut self, n: usize) -> Self {
        self.n_dispatchers = Some(n);
        self
    }

    pub fn with_spin_micros(mut self, micros: u64) -> Self {
        self.spin_micros = micros;
        self
    }

    pub fn with_default_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    pub fn with_abort_on_deadlock(mut self, abort: bool) -> Self {
        self.abort_on_deadlock = abort;
        self
    }

    /// Resolves `n_dispatchers` against the host's reported CPU count,
    /// capping to `cpu_count - 1` and flooring at 1 (SS8 boundary case).
    pub fn resolved_dispatcher_count(&self) -> usize {
        match self.n_dispatchers {
            Some(n) => n.max(1),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                cpus.saturating_sub(1).max(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dispatcher_count_is_at_least_one() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.resolved_dispatcher_count() >= 1);
    }

    #[test]
    fn explicit_dispatcher_count_is_honored() {
        let cfg = RuntimeConfig::default().with_dispatchers(3);
        assert_eq!(cfg.resolved_dispatcher_count(), 3);
    }
}
