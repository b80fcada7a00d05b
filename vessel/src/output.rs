//! Suspendable log output.
//!
//! The init suspends its stderr while the initial process runs so that
//! late setup diagnostics are never interleaved with child output.
//! [`Suspendable`] proxies writes to a downstream writer, withholding
//! them in a bounded buffer between [`Suspendable::suspend`] and
//! [`Suspendable::resume`].
//!
//! The process-global instance wraps stderr and backs the tracing
//! subscriber installed by [`init_logging`], so every log line obeys
//! suspend/resume ordering.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Hard cap on bytes withheld while suspended.
pub const SUSPEND_BUF_MAX: usize = 1 << 24;

/// Buffered state of a [`Suspendable`].
#[derive(Debug, Default)]
struct SuspendBuf {
    /// Withheld bytes, oldest first.
    buf: Vec<u8>,
    /// Total length of writes rejected since the last resume.
    dropped: usize,
}

/// Outcome of a [`Suspendable::resume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumed {
    /// Whether the writer was suspended before the call.
    pub resumed: bool,
    /// Bytes rejected while suspended.
    pub dropped: usize,
}

/// Proxies writes to `W`, optionally withholding them between calls to
/// suspend and resume.
#[derive(Debug, Default)]
pub struct Suspendable<W> {
    /// Downstream writer; locked separately so pass-through writes do
    /// not contend with buffer accounting.
    downstream: Mutex<W>,
    suspended: AtomicBool,
    state: Mutex<SuspendBuf>,
}

impl<W: Write> Suspendable<W> {
    /// Wraps `downstream`.
    pub fn new(downstream: W) -> Self {
        Self {
            downstream: Mutex::new(downstream),
            suspended: AtomicBool::new(false),
            state: Mutex::new(SuspendBuf::default()),
        }
    }

    /// Whether the writer is currently withholding output.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Starts withholding output. Returns false if already suspended.
    pub fn suspend(&self) -> bool {
        self.suspended
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stops withholding output and dumps the buffer downstream.
    pub fn resume(&self) -> io::Result<Resumed> {
        if self
            .suspended
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Resumed { resumed: false, dropped: 0 });
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = state.dropped;
        state.dropped = 0;
        let mut downstream = self.downstream.lock().unwrap_or_else(PoisonError::into_inner);
        let res = downstream.write_all(&state.buf);
        state.buf.clear();
        res.map(|()| Resumed { resumed: true, dropped })
    }

    /// Writes `p` downstream, or into the bounded buffer while
    /// suspended. An overflowing write retains the prefix that fits,
    /// counts the rest as dropped and fails with `ENOMEM`.
    pub fn write_bytes(&self, p: &[u8]) -> io::Result<usize> {
        if !self.is_suspended() {
            let mut downstream = self.downstream.lock().unwrap_or_else(PoisonError::into_inner);
            return downstream.write(p);
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let free = SUSPEND_BUF_MAX - state.buf.len();
        if free < p.len() {
            if free > 0 {
                state.buf.extend_from_slice(&p[..free]);
            }
            state.dropped += p.len() - free;
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        state.buf.extend_from_slice(p);
        Ok(p.len())
    }
}

impl<W: Write> Write for &Suspendable<W> {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        self.write_bytes(p)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.is_suspended() {
            return Ok(());
        }
        let mut downstream = self.downstream.lock().unwrap_or_else(PoisonError::into_inner);
        downstream.flush()
    }
}

/// The process-global suspendable stderr.
static OUTPUT: OnceLock<Suspendable<io::Stderr>> = OnceLock::new();

/// Returns the process-global suspendable stderr.
pub fn output() -> &'static Suspendable<io::Stderr> {
    OUTPUT.get_or_init(|| Suspendable::new(io::stderr()))
}

/// Suspends the global output.
pub fn suspend() -> bool {
    output().suspend()
}

/// Resumes the global output, emitting a trailer when buffered bytes
/// were lost or could not be dumped.
pub fn resume() -> bool {
    match output().resume() {
        Ok(Resumed { resumed, dropped }) => {
            if dropped > 0 {
                tracing::error!("dropped {dropped} bytes while output is suspended");
            }
            resumed
        }
        Err(err) => {
            tracing::error!("cannot dump buffer on resume: {err}");
            true
        }
    }
}

/// Final flush hook; called once on every exit path.
pub fn before_exit() {
    if output().is_suspended() {
        resume();
        tracing::warn!("exiting with output still suspended");
    }
}

/// Produces writers over the global suspendable stderr for the tracing
/// subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeSuspendable;

impl<'a> MakeWriter<'a> for MakeSuspendable {
    type Writer = &'static Suspendable<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        output()
    }
}

/// Installs the tracing subscriber over the global suspendable stderr.
///
/// `RUST_LOG` overrides the default level; `verbose` selects debug over
/// warn. Safe to call more than once; later calls keep the first
/// subscriber.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MakeSuspendable)
        .with_target(false)
        .with_ansi(false)
        .try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn passes_through_when_not_suspended() {
        let s = Suspendable::new(Vec::new());
        assert_eq!(s.write_bytes(b"hello").unwrap(), 5);
        assert!(!s.is_suspended());
        let downstream = s.downstream.into_inner().unwrap();
        assert_eq!(downstream, b"hello");
    }

    #[test]
    fn withholds_and_flushes_in_order() {
        let s = Suspendable::new(Vec::new());
        s.write_bytes(b"before ").unwrap();
        assert!(s.suspend());
        assert!(!s.suspend());
        s.write_bytes(b"during ").unwrap();
        {
            let downstream = s.downstream.lock().unwrap();
            assert_eq!(&*downstream, b"before ");
        }
        let r = s.resume().unwrap();
        assert_eq!(r, Resumed { resumed: true, dropped: 0 });
        s.write_bytes(b"after").unwrap();
        let downstream = s.downstream.into_inner().unwrap();
        assert_eq!(downstream, b"before during after");
    }

    #[test]
    fn resume_when_not_suspended_is_noop() {
        let s = Suspendable::new(Vec::new());
        let r = s.resume().unwrap();
        assert!(!r.resumed);
    }

    #[test]
    fn overflow_counts_dropped_bytes() {
        let s = Suspendable::new(Vec::new());
        s.suspend();

        let chunk = vec![0u8; SUSPEND_BUF_MAX - 3];
        assert_eq!(s.write_bytes(&chunk).unwrap(), chunk.len());

        // 3 bytes fit, 4 are rejected
        let err = s.write_bytes(b"0123456").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));

        // nothing fits any more
        let err = s.write_bytes(b"xy").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));

        let r = s.resume().unwrap();
        assert_eq!(r.dropped, 4 + 2);
        let downstream = s.downstream.into_inner().unwrap();
        assert_eq!(downstream.len(), SUSPEND_BUF_MAX);
        assert_eq!(&downstream[SUSPEND_BUF_MAX - 3..], b"012");
    }

    #[test]
    fn shared_across_threads() {
        let s = Arc::new(Suspendable::new(Vec::new()));
        s.suspend();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s2 = Arc::clone(&s);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    s2.write_bytes(b"x").unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let r = s.resume().unwrap();
        assert!(r.resumed);
        assert_eq!(s.downstream.lock().unwrap().len(), 400);
    }
}
