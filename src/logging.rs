//! Minimal stderr logger for the runtime.
//!
//! Embedding applications are free to install their own `log::Log`
//! implementation before calling [`init`]; this one exists so the runtime
//! and its test suite have sane diagnostics out of the box, the same way
//! a small systems crate ships a no-dependency logger rather than pulling
//! in a formatting framework.

use log::{Level, LevelFilter, Metadata, Record};
use std::sync::atomic::{AtomicBool, Ordering};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the default stderr logger, idempotently.
///
/// Safe to call from multiple dispatchers during `setup()`; only the
/// first call takes effect. If the embedding application already
/// installed its own logger before calling `setup()`, this is a no-op.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    match log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug)) {
        Ok(()) => log::info!("lwt: default logger installed"),
        Err(_) => {
            // Another logger won the race to install -- fine, just proceed.
        }
    }
}
