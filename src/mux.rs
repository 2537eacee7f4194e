// SPDX-License-Identifier: Apache-2.0

//! Request multiplexer
//!
//! Any number of callers share the front of one ring. Each caller has at
//! most one request in flight. A single worker thread drains the responses
//! and hands each one to the caller whose correlation id it carries.
//!
//! Lock order: producer, then a caller's entry, then the registry. The worker
//! never holds the registry while it takes an entry.

use crate::notify::Notifier;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, error, info, warn};
use postern::errno::{EAGAIN, EBUSY, EINTR, EINVAL, EMSGSIZE, ESTALE, ETIME};
use postern::message::{Flags, Message, Status, MAX_PAYLOAD_SIZE, UNSET_ID};
use postern::ring::{Consumer, FrontRing, Producer};

/// Default bound on how long the worker sleeps without a signal.
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);

/// Identifies one caller: a thread of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Caller {
    pub process: u32,
    pub thread: u32,
}

impl Caller {
    /// The calling thread.
    pub fn current() -> Self {
        // SAFETY: gettid has no preconditions and cannot fail.
        let thread = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        Self {
            process: std::process::id(),
            thread,
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process, self.thread)
    }
}

/// Outcome of a call that did not produce a regular response.
#[derive(Debug)]
pub enum Error {
    /// No free slot; back off and resubmit
    RingFull,
    /// The caller already has a request in flight
    Busy,
    /// Not a well-formed request
    Invalid,
    /// The wait was aborted before a response arrived
    Aborted,
    /// No response within the configured timeout
    TimedOut,
    /// The channel is unusable
    ChannelDead(Status),
    /// The response did not fit; carries the part that did
    Truncated(Message),
}

impl Error {
    /// Portable errno for this error.
    pub fn errno(&self) -> postern::Error {
        match self {
            Self::RingFull => EAGAIN,
            Self::Busy => EBUSY,
            Self::Invalid => EINVAL,
            Self::Aborted => EINTR,
            Self::TimedOut => ETIME,
            Self::ChannelDead(_) => ESTALE,
            Self::Truncated(_) => EMSGSIZE,
        }
    }

    /// Worth resubmitting unchanged?
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RingFull)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingFull => write!(f, "ring is full"),
            Self::Busy => write!(f, "caller already has a request in flight"),
            Self::Invalid => write!(f, "not a valid request"),
            Self::Aborted => write!(f, "wait for the response was aborted"),
            Self::TimedOut => write!(f, "timed out waiting for the response"),
            Self::ChannelDead(status) => write!(f, "channel is dead: {status}"),
            Self::Truncated(msg) => write!(
                f,
                "response of {} bytes truncated to {}",
                msg.header.payload_len(),
                msg.payload.len()
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Tunables.
#[derive(Clone, Debug)]
pub struct Options {
    /// Largest response payload handed to a caller
    pub capacity: usize,
    /// Bound on a caller's wait, `None` waits forever
    pub timeout: Option<Duration>,
    /// Bound on how long the worker sleeps without a signal
    pub poll: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity: MAX_PAYLOAD_SIZE,
            timeout: None,
            poll: DEFAULT_POLL,
        }
    }
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub submitted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub truncated: u64,
    pub full: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    truncated: AtomicU64,
    full: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            full: self.full.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Idle,
    Awaiting { id: u64, capacity: usize },
    Delivered(Message),
    Truncated(Message),
    Aborted,
    Errored(Status),
    Destroyed,
}

/// Correlation entry of one caller.
#[derive(Debug)]
struct Entry {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Entry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Idle),
            ready: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ends the wait in progress with `outcome`.
    fn release(&self, outcome: Slot) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Awaiting { .. }) {
            return false;
        }
        *slot = outcome;
        self.ready.notify_all();
        true
    }

    fn destroy(&self) {
        *self.lock() = Slot::Destroyed;
        self.ready.notify_all();
    }
}

enum Pending {
    Waiter(Arc<Entry>),
    Discard,
}

#[derive(Default)]
struct Registry {
    callers: HashMap<Caller, Arc<Entry>>,
    ids: HashMap<u64, Pending>,
}

struct Shared {
    registry: RwLock<Registry>,
    producer: Mutex<Producer>,
    notifier: Notifier,
    options: Options,
    next_id: AtomicU64,
    // Status the channel died with, 0 while alive.
    dead: AtomicU32,
    stop: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn producer(&self) -> MutexGuard<'_, Producer> {
        self.producer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dead(&self) -> Option<Status> {
        match self.dead.load(Ordering::Acquire) {
            0 => None,
            status => Some(Status(status)),
        }
    }

    fn entry(&self, caller: Caller) -> Arc<Entry> {
        if let Some(entry) = self.registry().callers.get(&caller) {
            return entry.clone();
        }
        self.registry_mut()
            .callers
            .entry(caller)
            .or_insert_with(Entry::new)
            .clone()
    }

    /// Writes `request` into the ring under the producer lock.
    ///
    /// With a `waiter`, its entry moves to awaiting; without one the
    /// response is consumed silently.
    fn enqueue(&self, mut request: Message, waiter: Option<&Arc<Entry>>) -> Result<u64, Error> {
        if !request.header.is_request() {
            return Err(Error::Invalid);
        }

        let mut producer = self.producer();
        if let Some(status) = self.dead() {
            return Err(Error::ChannelDead(status));
        }

        let mut guard = waiter.map(|entry| entry.lock());
        match guard.as_deref() {
            None | Some(Slot::Idle) => {}
            Some(Slot::Destroyed) => return Err(Error::Aborted),
            Some(_) => return Err(Error::Busy),
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.header.id = id;
        let pending = match waiter {
            Some(entry) => {
                request.header.flags |= Flags::CALLER_AWAITS_RESPONSE;
                Pending::Waiter(entry.clone())
            }
            None => {
                request.header.flags -= Flags::CALLER_AWAITS_RESPONSE;
                Pending::Discard
            }
        };
        self.registry_mut().ids.insert(id, pending);

        match producer.try_produce(&request) {
            Ok(true) => {}
            Ok(false) => {
                self.registry_mut().ids.remove(&id);
                Counters::bump(&self.counters.full);
                return Err(Error::RingFull);
            }
            Err(_) => {
                self.registry_mut().ids.remove(&id);
                return Err(Error::Invalid);
            }
        }

        if let Some(slot) = guard.as_mut() {
            **slot = Slot::Awaiting {
                id,
                capacity: self.options.capacity,
            };
        }
        Counters::bump(&self.counters.submitted);

        drop(guard);
        drop(producer);

        if let Err(e) = self.notifier.signal_peer() {
            warn!("mux: {e:#}");
        }
        Ok(id)
    }

    /// Blocks until the worker or an abort ends the wait for `id`.
    fn wait(&self, entry: &Entry, id: u64) -> Result<Message, Error> {
        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let mut slot = entry.lock();

        loop {
            match *slot {
                Slot::Awaiting { .. } => {}
                Slot::Destroyed => return Err(Error::Aborted),
                _ => break,
            }

            slot = match deadline {
                None => entry
                    .ready
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        // A late response now takes the unknown id path.
                        *slot = Slot::Idle;
                        self.registry_mut().ids.remove(&id);
                        return Err(Error::TimedOut);
                    }
                    entry
                        .ready
                        .wait_timeout(slot, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Delivered(msg) => Ok(msg),
            Slot::Truncated(msg) => Err(Error::Truncated(msg)),
            Slot::Errored(status) => Err(Error::ChannelDead(status)),
            _ => Err(Error::Aborted),
        }
    }

    /// Hands a response to its caller.
    ///
    /// Returns the status if the peer declared the channel dead.
    fn deliver(&self, mut msg: Message) -> Option<Status> {
        let id = msg.header.id;
        let status = msg.header.status;
        let critical = status.is_critical().then_some(status);

        let pending = self.registry_mut().ids.remove(&id);
        let entry = match pending {
            Some(Pending::Waiter(entry)) => entry,
            Some(Pending::Discard) => {
                debug!("mux: discarding response {id}");
                Counters::bump(&self.counters.dropped);
                return critical;
            }
            None => {
                warn!("mux: dropping response {id} nobody waits for");
                Counters::bump(&self.counters.dropped);
                return critical;
            }
        };

        let mut slot = entry.lock();
        let capacity = match *slot {
            Slot::Awaiting { id: want, capacity } if want == id => capacity,
            _ => {
                debug!("mux: caller gave up on response {id}");
                Counters::bump(&self.counters.dropped);
                return critical;
            }
        };

        *slot = if let Some(status) = critical {
            Slot::Errored(status)
        } else if msg.payload.len() > capacity {
            // The header keeps the size the peer sent.
            msg.payload.truncate(capacity);
            msg.header.flags |= Flags::TRUNCATED;
            Counters::bump(&self.counters.truncated);
            Slot::Truncated(msg)
        } else {
            Counters::bump(&self.counters.delivered);
            Slot::Delivered(msg)
        };
        entry.ready.notify_all();

        critical
    }

    /// Declares the channel dead and fails every outstanding wait.
    fn fail_all(&self, status: Status) {
        {
            // No submission may slip in between.
            let _producer = self.producer();
            let _ = self
                .dead
                .compare_exchange(0, status.0, Ordering::AcqRel, Ordering::Acquire);
        }

        let status = self.dead().unwrap_or(status);
        let pending: Vec<_> = self.registry_mut().ids.drain().collect();

        let mut released = 0;
        for (_, pending) in pending {
            if let Pending::Waiter(entry) = pending {
                if entry.release(Slot::Errored(status)) {
                    released += 1;
                }
            }
        }

        if released > 0 {
            warn!("mux: released {released} waiters with {status}");
        }
    }

    /// Consumes everything the peer published so far.
    fn drain(&self, consumer: &mut Consumer) -> Result<(), Status> {
        while consumer.has_unconsumed() {
            let msg = match consumer.consume_next() {
                Ok(msg) if msg.header.is_response() && msg.header.id != UNSET_ID => msg,
                Ok(msg) => {
                    error!("mux: {:?} is not a response", msg.header);
                    return Err(Status::INTERNAL_ERROR);
                }
                Err(e) => {
                    error!(
                        "mux: unreadable response: {}",
                        postern::errno::name(e).unwrap_or("unknown error")
                    );
                    return Err(Status::INTERNAL_ERROR);
                }
            };

            let critical = self.deliver(msg);
            consumer.advance_consumer();

            if let Some(status) = critical {
                error!("mux: peer reported {status}");
                return Err(status);
            }
        }
        Ok(())
    }

    fn run(&self, mut consumer: Consumer) {
        loop {
            let stopping = self.stop.load(Ordering::Acquire);

            if let Err(status) = self.drain(&mut consumer) {
                self.fail_all(status);
                break;
            }

            if stopping {
                self.fail_all(Status::CHANNEL_DEAD);
                break;
            }

            if let Err(e) = self.notifier.wait_for_signal(Some(self.options.poll)) {
                error!("mux: waiting for the peer failed: {e}");
                self.fail_all(Status::INTERNAL_ERROR);
                break;
            }
        }
    }
}

/// The caller-facing end of a connection.
pub struct Mux {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("dead", &self.shared.dead())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Mux {
    /// Takes over the front of the ring and starts the worker.
    pub fn start(front: FrontRing, notifier: Notifier, options: Options) -> anyhow::Result<Self> {
        let (producer, consumer) = front.split();

        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::default()),
            producer: Mutex::new(producer),
            notifier,
            options,
            next_id: AtomicU64::new(UNSET_ID + 1),
            dead: AtomicU32::new(0),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("mux".into())
                .spawn(move || {
                    info!("mux: worker started");
                    shared.run(consumer);
                    info!("mux: worker stopped");
                })
                .context("failed to spawn the mux worker")?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Submits `request` for the calling thread and blocks for the response.
    pub fn call(&self, request: Message) -> Result<Message, Error> {
        self.call_as(Caller::current(), request)
    }

    /// Submits `request` for `caller` and blocks for the response.
    ///
    /// Fails with [`Error::Busy`] without touching the ring if `caller`
    /// already waits for a response.
    pub fn call_as(&self, caller: Caller, request: Message) -> Result<Message, Error> {
        let entry = self.shared.entry(caller);
        let id = self.shared.enqueue(request, Some(&entry))?;
        self.shared.wait(&entry, id)
    }

    /// Submits `request` without waiting; its response is dropped.
    pub fn submit(&self, request: Message) -> Result<u64, Error> {
        self.shared.enqueue(request, None)
    }

    /// Releases the wait of `caller` with [`Error::Aborted`].
    pub fn abort(&self, caller: Caller) -> bool {
        let entry = self.shared.registry().callers.get(&caller).cloned();
        entry.map_or(false, |entry| entry.release(Slot::Aborted))
    }

    /// Aborts the wait of `caller` and forgets it.
    pub fn release_caller(&self, caller: Caller) {
        let entry = self.shared.registry_mut().callers.remove(&caller);
        if let Some(entry) = entry {
            entry.destroy();
        }
    }

    /// Aborts and forgets every caller of `process`. Returns how many.
    pub fn release_process(&self, process: u32) -> usize {
        let mut gone = Vec::new();
        self.shared.registry_mut().callers.retain(|caller, entry| {
            if caller.process == process {
                gone.push(entry.clone());
                false
            } else {
                true
            }
        });

        for entry in &gone {
            entry.destroy();
        }
        gone.len()
    }

    /// The status the channel died with, if it did.
    pub fn dead(&self) -> Option<Status> {
        self.shared.dead()
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }

    /// Stops the worker after a final drain and fails the remaining waits.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.shared.stop.store(true, Ordering::Release);
        self.shared.notifier.wake_local();
        if worker.join().is_err() {
            error!("mux: worker panicked");
            self.shared.fail_all(Status::INTERNAL_ERROR);
        }
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.stop();
    }
}
