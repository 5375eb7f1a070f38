//! A unidirectional, fixed-capacity byte pipe over the crate's own
//! mutex and condition variable.
//!
//! Grounded on `ThreadPipe` in `threadpipe.h`/`.cc`: a single ring
//! buffer, one lock, and one condvar shared by both the "buffer full"
//! and "buffer empty" waits, since the two conditions are never true at
//! the same time. SS1 calls this "trivial over the provided mutex/cv";
//! kept here as a small, fully cooperative primitive built the same way
//! the rest of the crate's synchronization types are.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::condvar::Condvar;
use crate::error::{Error, Result, Status};
use crate::mutex::{BaseLock, Mutex};

const CAPACITY: usize = 4096;

struct RingState {
    data: Box<[u8; CAPACITY]>,
    count: usize,
    pos: usize,
}

/// A fixed 4096-byte ring-buffer pipe (SS4.5).
pub struct Pipe {
    lock: Arc<Mutex>,
    cv: Condvar,
    state: StdMutex<RingState>,
    eof: AtomicBool,
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe {
    pub fn new() -> Self {
        let lock = Arc::new(Mutex::new());
        let cv = Condvar::bound_to(lock.clone());
        Self {
            lock,
            cv,
            state: StdMutex::new(RingState {
                data: Box::new([0u8; CAPACITY]),
                count: 0,
                pos: 0,
            }),
            eof: AtomicBool::new(false),
        }
    }

    /// Writes all of `buf` into the pipe, blocking while it is full.
    /// Returns [`Status::Closed`] if the pipe reached EOF with bytes
    /// still unwritten.
    pub fn write(&self, mut buf: &[u8]) -> Result<usize> {
        let mut copied = 0;
        self.lock.take();
        while !buf.is_empty() {
            let mut state = self.state.lock().unwrap();
            if self.eof.load(Ordering::SeqCst) {
                drop(state);
                self.lock.release();
                return Err(Error::with_context(Status::Closed, "write after eof"));
            }

            let end_pos = (state.pos + state.count) % CAPACITY;
            let mut this_time = buf.len().min(CAPACITY - state.count);
            this_time = this_time.min(CAPACITY - end_pos);

            if this_time == 0 {
                drop(state);
                self.cv.wait();
                continue;
            }

            state.data[end_pos..end_pos + this_time].copy_from_slice(&buf[..this_time]);
            state.count += this_time;
            drop(state);
            self.cv.broadcast();

            buf = &buf[this_time..];
            copied += this_time;
        }
        self.lock.release();
        Ok(copied)
    }

    /// Reads up to `buf.len()` bytes, blocking while the pipe is empty
    /// and not yet at EOF. Returns `0` only once EOF is reached and the
    /// buffer has drained.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        self.lock.take();
        loop {
            let mut state = self.state.lock().unwrap();
            if state.count == 0 || filled == buf.len() {
                if self.eof.load(Ordering::SeqCst) || filled == buf.len() {
                    break;
                }
                drop(state);
                self.cv.wait();
                continue;
            }

            let mut this_time = (buf.len() - filled).min(state.count);
            this_time = this_time.min(CAPACITY - state.pos);

            let pos = state.pos;
            buf[filled..filled + this_time].copy_from_slice(&state.data[pos..pos + this_time]);
            state.pos = (state.pos + this_time) % CAPACITY;
            state.count -= this_time;
            filled += this_time;
            drop(state);
            self.cv.broadcast();
        }
        self.lock.release();
        filled
    }

    /// Marks the pipe closed for writing. Readers drain whatever is
    /// already buffered, then see `read` return `0`.
    pub fn eof(&self) {
        self.lock.take();
        self.eof.store(true, Ordering::SeqCst);
        self.lock.release();
        self.cv.broadcast();
    }

    pub fn at_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    /// Discards any buffered data until EOF is observed.
    pub fn wait_for_eof(&self) {
        self.lock.take();
        loop {
            if self.eof.load(Ordering::SeqCst) {
                break;
            }
            let mut state = self.state.lock().unwrap();
            if state.count > 0 {
                state.pos = (state.pos + state.count) % CAPACITY;
                state.count = 0;
                drop(state);
                self.cv.broadcast();
            } else {
                drop(state);
            }
            self.cv.wait();
        }
        self.lock.release();
    }

    pub fn count(&self) -> usize {
        self.lock.take();
        let c = self.state.lock().unwrap().count;
        self.lock.release();
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::dispatcher::Dispatcher;
    use crate::thread::UserThread;

    fn ensure_setup() {
        Dispatcher::setup(&RuntimeConfig::default().with_dispatchers(2));
    }

    #[test]
    fn write_then_read_round_trips_small_payload() {
        ensure_setup();
        Dispatcher::adopt_host_thread("pipe-round-trip-test");
        let pipe = Arc::new(Pipe::new());
        let writer_pipe = pipe.clone();
        let writer = UserThread::spawn("writer", None, true, move || {
            let n = writer_pipe.write(b"hello world").unwrap();
            Box::new(n)
        });
        writer.join();

        let mut buf = [0u8; 32];
        let n = pipe.read(&mut buf);
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn write_blocks_until_reader_drains_full_buffer() {
        ensure_setup();
        let pipe = Arc::new(Pipe::new());
        let payload = vec![7u8; CAPACITY + 500];

        let writer_pipe = pipe.clone();
        let payload_for_writer = payload.clone();
        let writer = UserThread::spawn("writer", None, true, move || {
            let n = writer_pipe.write(&payload_for_writer).unwrap();
            Box::new(n)
        });

        let reader_pipe = pipe.clone();
        let reader = UserThread::spawn("reader", None, true, move || {
            let mut total = Vec::new();
            let mut buf = [0u8; 256];
            while total.len() < CAPACITY + 500 {
                let n = reader_pipe.read(&mut buf);
                if n == 0 {
                    break;
                }
                total.extend_from_slice(&buf[..n]);
            }
            Box::new(total)
        });

        writer.join();
        let total = reader.join();
        let total = *total.downcast::<Vec<u8>>().unwrap();
        assert_eq!(total, payload);
    }

    #[test]
    fn eof_lets_reader_drain_then_see_closed() {
        ensure_setup();
        Dispatcher::adopt_host_thread("pipe-eof-drain-test");
        let pipe = Arc::new(Pipe::new());
        pipe.write(b"tail data").unwrap();
        pipe.eof();

        let mut buf = [0u8; 32];
        let n = pipe.read(&mut buf);
        assert_eq!(&buf[..n], b"tail data");
        assert_eq!(pipe.read(&mut buf), 0);
        assert!(pipe.at_eof());
    }

    #[test]
    fn write_after_eof_is_rejected() {
        ensure_setup();
        Dispatcher::adopt_host_thread("pipe-eof-test");
        let pipe = Pipe::new();
        pipe.eof();
        let err = pipe.write(b"too late").unwrap_err();
        assert_eq!(err.status(), Status::Closed);
    }
}
