// SPDX-License-Identifier: Apache-2.0

//! Rendezvous store
//!
//! A small hierarchical key/value store both domains can read, write and
//! watch before any memory is shared. Values are ASCII decimal text and
//! [`RESET`] marks a key that holds no value yet.

use crate::hypervisor::DomainId;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::{debug, trace};

/// Default root of the rendezvous keys.
pub const DEFAULT_ROOT: &str = "/unikernel/random";

/// The "no value yet" sentinel.
pub const RESET: &str = "0";

/// Separates grant references in [`key::GRANT_REFS`].
pub const GRANT_REF_DELIMITER: &str = " ";

/// Key names below the root.
pub mod key {
    /// Domain id of the offering side
    pub const SERVER_ID: &str = "server_id";
    /// Domain id of the accepting side; a one-shot mailbox
    pub const CLIENT_ID: &str = "client_id";
    /// Ordered, space-delimited grant references of the region
    pub const GRANT_REFS: &str = "grant_refs";
    /// Unbound event channel port of the offering side
    pub const EVENT_CHANNEL_PORT: &str = "event_channel_port";
    /// Set once the accepting side bound its end of the channel
    pub const RING_READY: &str = "ring_ready";
    /// Largest message the offering side lays the ring out for
    pub const MSG_LEN: &str = "msg_len";
    /// Private per-domain leaf holding the domain's own id
    pub const DOMAIN_ID: &str = "domain_id";

    /// Shared keys, reset on setup and teardown.
    pub const SHARED: [&str; 6] = [
        SERVER_ID,
        CLIENT_ID,
        GRANT_REFS,
        EVENT_CHANNEL_PORT,
        RING_READY,
        MSG_LEN,
    ];
}

// Granularity at which blocked watches notice cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Aborts watches from another thread.
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub trait Store: Send + Sync {
    /// Reads `path`, `None` if it was never written
    fn read(&self, path: &str) -> Result<Option<String>>;

    /// Writes `value` to `path`
    fn write(&self, path: &str, value: &str) -> Result<()>;

    /// Blocks until `path` holds something other than `seen`, or `timeout` passes
    ///
    /// Returns the current value either way.
    fn wait_change(
        &self,
        path: &str,
        seen: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<String>>;
}

#[derive(Default)]
struct Tree {
    values: BTreeMap<String, String>,
    generation: u64,
}

/// In-memory store shared by every domain in the process.
#[derive(Default)]
pub struct MemStore {
    tree: Mutex<Tree>,
    changed: Condvar,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the private home of domain `id` and returns its path.
    pub fn add_domain(&self, id: DomainId) -> Result<String> {
        let home = format!("/local/domain/{id}");
        self.write(&format!("{home}/{}", key::DOMAIN_ID), &id.to_string())?;
        Ok(home)
    }
}

impl Store for MemStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.tree().values.get(path).cloned())
    }

    fn write(&self, path: &str, value: &str) -> Result<()> {
        ensure!(path.starts_with('/'), "store path {path:?} is not absolute");

        let mut tree = self.tree();
        tree.values.insert(path.to_owned(), value.to_owned());
        tree.generation += 1;
        drop(tree);

        trace!("store: {path} = {value:?}");
        self.changed.notify_all();
        Ok(())
    }

    fn wait_change(
        &self,
        path: &str,
        seen: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut tree = self.tree();

        loop {
            let current = tree.values.get(path);
            if current.map(String::as_str) != seen {
                return Ok(current.cloned());
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(current.cloned());
            }

            let generation = tree.generation;
            let (guard, _) = self
                .changed
                .wait_timeout_while(tree, deadline - now, |t| t.generation == generation)
                .unwrap_or_else(PoisonError::into_inner);
            tree = guard;
        }
    }
}

/// The rendezvous keys as seen by one domain.
#[derive(Clone)]
pub struct Namespace {
    store: Arc<dyn Store>,
    root: String,
    home: String,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("root", &self.root)
            .field("home", &self.home)
            .finish()
    }
}

impl Namespace {
    pub fn new(store: Arc<dyn Store>, root: impl Into<String>, home: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into().trim_end_matches('/').to_owned(),
            home: home.into().trim_end_matches('/').to_owned(),
        }
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{key}", self.root)
    }

    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        self.store
            .read(&path)
            .with_context(|| format!("failed to read {path}"))
    }

    pub fn write(&self, key: &str, value: impl Display) -> Result<()> {
        let path = self.path(key);
        self.store
            .write(&path, &value.to_string())
            .with_context(|| format!("failed to write {path}"))
    }

    /// Puts the sentinel back.
    pub fn reset(&self, key: &str) -> Result<()> {
        self.write(key, RESET)
    }

    /// Resets every shared key.
    pub fn reset_all(&self) -> Result<()> {
        key::SHARED.iter().try_for_each(|k| self.reset(k))
    }

    /// Blocks until `key` holds a value other than the sentinel.
    pub fn watch(&self, key: &str, cancel: &Cancel, timeout: Option<Duration>) -> Result<String> {
        let path = self.path(key);
        let deadline = timeout.map(|t| Instant::now() + t);
        debug!("watching {path}");

        let mut current = self.read(key)?;
        loop {
            if let Some(value) = current.as_deref().filter(|v| *v != RESET) {
                debug!("{path} = {value:?}");
                return Ok(value.to_owned());
            }

            if cancel.is_cancelled() {
                bail!("watch on {path} was cancelled");
            }

            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        bail!("timed out waiting for {path}");
                    }
                    left.min(CANCEL_POLL)
                }
                None => CANCEL_POLL,
            };

            current = self
                .store
                .wait_change(&path, current.as_deref(), slice)
                .with_context(|| format!("failed to watch {path}"))?;
        }
    }

    /// Watches `key` and parses it as a decimal number.
    pub fn watch_number<T>(&self, key: &str, cancel: &Cancel, timeout: Option<Duration>) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let value = self.watch(key, cancel, timeout)?;
        value
            .trim()
            .parse()
            .with_context(|| format!("{} holds {value:?}, not a number", self.path(key)))
    }

    /// This domain's own id, from its private leaf.
    pub fn domain_id(&self) -> Result<DomainId> {
        let path = format!("{}/{}", self.home, key::DOMAIN_ID);
        let value = self
            .store
            .read(&path)
            .with_context(|| format!("failed to read {path}"))?
            .ok_or_else(|| anyhow!("{path} is not set"))?;

        let id: DomainId = value
            .trim()
            .parse()
            .with_context(|| format!("{path} holds {value:?}, not a domain id"))?;
        ensure!(id != 0, "{path} holds the reset value");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn namespace() -> (Arc<MemStore>, Namespace) {
        let store = MemStore::new();
        let home = store.add_domain(7).unwrap();
        let ns = Namespace::new(store.clone(), DEFAULT_ROOT, home);
        (store, ns)
    }

    #[test]
    fn read_write_reset() {
        let (store, ns) = namespace();
        assert_eq!(ns.read(key::SERVER_ID).unwrap(), None);

        ns.write(key::SERVER_ID, 7).unwrap();
        assert_eq!(
            store.read("/unikernel/random/server_id").unwrap().as_deref(),
            Some("7")
        );

        ns.reset_all().unwrap();
        for k in key::SHARED {
            assert_eq!(ns.read(k).unwrap().as_deref(), Some(RESET), "{k}");
        }
        assert!(store.write("relative", "1").is_err());
    }

    #[test]
    fn domain_id() {
        let (store, ns) = namespace();
        assert_eq!(ns.domain_id().unwrap(), 7);

        store.write("/local/domain/7/domain_id", "0").unwrap();
        assert!(ns.domain_id().is_err());

        let stranger = Namespace::new(store, DEFAULT_ROOT, "/local/domain/9");
        assert!(stranger.domain_id().is_err());
    }

    #[test]
    fn watch_skips_sentinel() {
        let (_, ns) = namespace();
        ns.reset(key::CLIENT_ID).unwrap();

        let writer = ns.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.write(key::CLIENT_ID, 12).unwrap();
        });

        let id: u16 = ns.watch_number(key::CLIENT_ID, &Cancel::new(), None).unwrap();
        assert_eq!(id, 12);
        t.join().unwrap();
    }

    #[test]
    fn watch_times_out() {
        let (_, ns) = namespace();
        ns.reset(key::RING_READY).unwrap();

        let err = ns
            .watch(key::RING_READY, &Cancel::new(), Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err:#}");
    }

    #[test]
    fn watch_is_cancellable() {
        let (_, ns) = namespace();
        let cancel = Cancel::new();

        let c = cancel.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            c.cancel();
        });

        let err = ns.watch(key::GRANT_REFS, &cancel, None).unwrap_err();
        assert!(err.to_string().contains("cancelled"), "{err:#}");
        t.join().unwrap();
    }

    #[test]
    fn watch_rejects_garbage() {
        let (_, ns) = namespace();
        ns.write(key::EVENT_CHANNEL_PORT, "port nine").unwrap();
        assert!(ns
            .watch_number::<u32>(key::EVENT_CHANNEL_PORT, &Cancel::new(), None)
            .is_err());
    }
}
