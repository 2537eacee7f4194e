// SPDX-License-Identifier: Apache-2.0

//! Notifier: event channel signals in, local wake-ups out.

use crate::hypervisor::{EventChannels, Port};

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libc::timespec;
use log::warn;
use tracing::{instrument, trace};

/// Counting wait-source.
///
/// [`raise`](Self::raise) never blocks, so it is safe to call from a signal
/// handler. Raises that happen before the next [`wait`](Self::wait) collapse
/// into one wake-up.
#[derive(Debug, Default)]
pub struct Signal {
    raised: AtomicU32,
    seen: AtomicU32,
}

// Notes about memory ordering:
//
// The only guarantee a wake-up provides is that whatever happened before
// raise() is visible to the thread returning from wait(). That is a
// release-acquire pair on `raised`: Ordering::Release when bumping it in
// raise(), Ordering::Acquire when observing the new value in wait().
//
// `seen` is only ever touched by the waiting side.
impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(level = "trace", skip(self))]
    pub fn raise(&self) {
        self.raised.fetch_add(1, Ordering::Release);

        let futex_ptr = &self.raised as *const AtomicU32;
        let op = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG;
        trace!("futex: {futex_ptr:p} FUTEX_WAKE");
        unsafe {
            libc::syscall(libc::SYS_futex, futex_ptr, op, i32::MAX);
        }
    }

    /// Blocks until raised since the last wait, or until `timeout` passes.
    ///
    /// Returns whether the signal was raised.
    #[instrument(level = "trace", skip(self))]
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let seen = self.seen.load(Ordering::Relaxed);
        // Absolute, so that spurious wake-ups do not restart the clock.
        let deadline = timeout.map(deadline).transpose()?;
        let timespec_ptr = deadline
            .as_ref()
            .map_or(ptr::null(), |t| t as *const timespec);
        let futex_ptr = &self.raised as *const AtomicU32;

        loop {
            // No need to wait if it was raised already.
            let raised = self.raised.load(Ordering::Acquire);
            if raised != seen {
                self.seen.store(raised, Ordering::Relaxed);
                return Ok(true);
            }

            trace!("futex: FUTEX_WAIT_BITSET {futex_ptr:p} {seen} {timeout:?}");
            let r = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    futex_ptr,
                    libc::FUTEX_WAIT_BITSET | libc::FUTEX_PRIVATE_FLAG,
                    seen,
                    timespec_ptr,
                    ptr::null::<u32>(), // Unused for FUTEX_WAIT_BITSET.
                    !0u32,              // Wait on all bits.
                )
            };

            if r == 0 {
                continue;
            }

            let err = io::Error::last_os_error();
            trace!("futex: FUTEX_WAIT_BITSET {futex_ptr:p} {seen} {timeout:?} = {err}");

            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                Some(libc::ETIMEDOUT) => {
                    let raised = self.raised.load(Ordering::Acquire);
                    self.seen.store(raised, Ordering::Relaxed);
                    return Ok(raised != seen);
                }
                _ => return Err(err),
            }
        }
    }
}

/// `CLOCK_MONOTONIC` time `timeout` from now, as FUTEX_WAIT_BITSET expects it.
fn deadline(timeout: Duration) -> io::Result<timespec> {
    let mut now = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = timeout.as_secs().saturating_add(nanos / 1_000_000_000);
    Ok(timespec {
        tv_sec: now
            .tv_sec
            .saturating_add(libc::time_t::try_from(secs).unwrap_or(libc::time_t::MAX)),
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

/// One bound event channel port.
///
/// Signals from the peer raise [`Signal`]; nothing else runs in the
/// delivery context.
pub struct Notifier {
    channels: Arc<dyn EventChannels>,
    port: Port,
    signal: Arc<Signal>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("port", &self.port)
            .field("signal", &self.signal)
            .finish()
    }
}

impl Notifier {
    /// Installs the handler on `port`.
    pub fn bind(channels: Arc<dyn EventChannels>, port: Port) -> Result<Self> {
        let signal = Arc::new(Signal::new());

        let raise = signal.clone();
        channels
            .bind_handler(port, Box::new(move || raise.raise()))
            .with_context(|| format!("failed to bind a handler to port {port}"))?;

        Ok(Self {
            channels,
            port,
            signal,
        })
    }

    #[inline]
    pub fn port(&self) -> Port {
        self.port
    }

    /// Best effort: tells the peer the ring changed.
    pub fn signal_peer(&self) -> Result<()> {
        self.channels
            .notify(self.port)
            .with_context(|| format!("failed to signal port {}", self.port))
    }

    /// Blocks until the peer signalled since the last wait.
    ///
    /// A wake-up is only a hint; the caller still has to look at the ring.
    pub fn wait_for_signal(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.signal.wait(timeout)
    }

    /// Wakes the local waiter without involving the peer.
    pub fn wake_local(&self) {
        self.signal.raise()
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Err(e) = self.channels.close(self.port) {
            warn!("failed to close port {}: {e:#}", self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::sim::Hypervisor;

    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn pending_raise_returns_immediately() {
        let signal = Signal::new();
        signal.raise();
        signal.raise();
        assert!(signal.wait(Some(Duration::from_secs(5))).unwrap());

        // Both raises collapsed into the previous wake-up.
        assert!(!signal.wait(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn wait_times_out() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.wait(Some(Duration::from_millis(30))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn spurious_wakeups_keep_the_deadline() {
        let signal = Signal::new();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            thread::Builder::new()
                .name("waker".into())
                .spawn_scoped(s, || {
                    // Wakes the futex without raising the signal.
                    let futex_ptr = &signal.raised as *const AtomicU32;
                    let op = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG;
                    while !done.load(Ordering::Relaxed) {
                        unsafe { libc::syscall(libc::SYS_futex, futex_ptr, op, i32::MAX) };
                        thread::sleep(Duration::from_millis(5));
                    }
                })
                .unwrap();

            let start = Instant::now();
            assert!(!signal.wait(Some(Duration::from_millis(100))).unwrap());
            let elapsed = start.elapsed();
            done.store(true, Ordering::Relaxed);

            assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
            assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        });
    }

    #[test]
    fn huge_timeout_saturates() {
        let signal = Signal::new();
        signal.raise();
        assert!(signal.wait(Some(Duration::MAX)).unwrap());
    }

    #[test]
    fn raise_wakes_waiter() {
        let signal = Arc::new(Signal::new());

        let s = signal.clone();
        let t = thread::Builder::new()
            .name("raiser".into())
            .spawn(move || {
                thread::sleep(Duration::from_millis(20));
                s.raise();
            })
            .unwrap();

        assert!(signal.wait(None).unwrap());
        t.join().unwrap();
    }

    #[test]
    fn notifier_pair() {
        let hv = Hypervisor::new();
        let (a, b) = (hv.capabilities(1), hv.capabilities(2));

        let unbound = a.channels.alloc_unbound(2).unwrap();
        let bound = b.channels.bind_interdomain(1, unbound).unwrap();

        let server = Notifier::bind(a.channels, unbound).unwrap();
        let client = Notifier::bind(b.channels, bound).unwrap();

        client.signal_peer().unwrap();
        assert!(server.wait_for_signal(Some(Duration::from_secs(5))).unwrap());
        assert!(!client.wait_for_signal(Some(Duration::from_millis(10))).unwrap());

        server.signal_peer().unwrap();
        assert!(client.wait_for_signal(Some(Duration::from_secs(5))).unwrap());

        client.wake_local();
        assert!(client.wait_for_signal(None).unwrap());

        drop(server);
        assert!(client.signal_peer().is_err());
    }
}
