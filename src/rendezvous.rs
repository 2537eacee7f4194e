// SPDX-License-Identifier: Apache-2.0

//! Rendezvous: bootstraps the shared region and event channel through the store.
//!
//! The offering side:
//!
//! 1. resets the shared keys and publishes its id in `server_id`
//! 2. waits for the peer's id in `client_id`, then resets that mailbox
//! 3. grants the region and publishes `msg_len` and `grant_refs`
//! 4. allocates an unbound port and publishes `event_channel_port`
//! 5. waits for `ring_ready`, binds its handler, lays out the ring and signals
//!
//! The accepting side mirrors it: it waits for `server_id`, publishes
//! `client_id`, maps the grants, binds to the port, asserts `ring_ready` and
//! waits until the ring header shows up in the region.

use crate::hypervisor::{Capabilities, DomainId, GrantRef, Port};
use crate::notify::Notifier;
use crate::region::SharedRegion;
use crate::store::{key, Cancel, Namespace, GRANT_REF_DELIMITER};
use crate::Errno;

use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};
use postern::errno::EAGAIN;
use postern::message::{HEADER_SIZE, MAX_MESSAGE_SIZE};
use postern::ring::Sring;
use serde::{Deserialize, Serialize};

/// Default number of pages in the shared region.
pub const DEFAULT_PAGES: usize = 1 << 2;

// Upper bound on a single wait for the ring header.
const RING_POLL: Duration = Duration::from_millis(50);

/// Which half of the handshake a domain runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Grants the region and allocates the unbound port
    Offer,
    /// Maps the region and binds to the port
    #[default]
    Accept,
}

/// The two domains of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub local: DomainId,
    pub peer: DomainId,
}

/// Handshake parameters.
#[derive(Clone, Debug)]
pub struct Params {
    /// Pages in the shared region, offering side only
    pub pages: usize,
    /// Ring slot size, offering side only
    pub message_size: usize,
    /// Bound on every single wait, `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            pages: DEFAULT_PAGES,
            message_size: MAX_MESSAGE_SIZE,
            timeout: None,
        }
    }
}

/// Everything a completed handshake produced.
#[derive(Debug)]
pub struct Established {
    pub endpoint: Endpoint,
    pub role: Role,
    pub region: SharedRegion,
    pub notifier: Notifier,
    pub ring: Sring,
    pub namespace: Namespace,
}

/// Runs the handshake for `role`.
pub fn establish(
    role: Role,
    caps: &Capabilities,
    ns: &Namespace,
    params: &Params,
    cancel: &Cancel,
) -> Result<Established> {
    match role {
        Role::Offer => offer(caps, ns, params, cancel),
        Role::Accept => accept(caps, ns, params, cancel),
    }
}

/// Runs the offering side of the handshake.
pub fn offer(
    caps: &Capabilities,
    ns: &Namespace,
    params: &Params,
    cancel: &Cancel,
) -> Result<Established> {
    ensure!(
        (HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&params.message_size),
        "message size {} is outside of {HEADER_SIZE}..={MAX_MESSAGE_SIZE}",
        params.message_size
    );

    ns.reset_all()
        .context("failed to initialize the rendezvous keys")?;

    let local = ns.domain_id()?;
    ns.write(key::SERVER_ID, local)?;
    info!("domain {local}: offering a {}-page region", params.pages);

    let peer: DomainId = ns.watch_number(key::CLIENT_ID, cancel, params.timeout)?;
    ensure!(peer != local, "peer claims our own domain id {local}");
    ns.reset(key::CLIENT_ID)?;
    info!("domain {local}: peer is domain {peer}");

    let region = SharedRegion::offer(caps.grants.clone(), peer, params.pages)?;
    let refs = region
        .refs()
        .iter()
        .map(GrantRef::to_string)
        .collect::<Vec<_>>()
        .join(GRANT_REF_DELIMITER);
    ns.write(key::MSG_LEN, params.message_size)?;
    ns.write(key::GRANT_REFS, refs)?;

    let port = caps
        .channels
        .alloc_unbound(peer)
        .with_context(|| format!("failed to allocate a port for domain {peer}"))?;

    let finish = || -> Result<(Notifier, Sring)> {
        ns.write(key::EVENT_CHANNEL_PORT, port)?;
        ns.watch(key::RING_READY, cancel, params.timeout)?;

        let notifier = Notifier::bind(caps.channels.clone(), port)?;

        // Grants are live on both sides now.
        let ring = Sring::init(region.memory(), params.message_size)
            .map_err(Errno)
            .context("failed to lay out the ring")?;
        notifier.signal_peer()?;
        Ok((notifier, ring))
    };

    let (notifier, ring) = match finish() {
        Ok(done) => done,
        Err(e) => {
            let _ = caps.channels.close(port);
            return Err(e);
        }
    };

    info!(
        "domain {local}: ring ready with {} slots of {} bytes",
        ring.slot_count(),
        ring.slot_size()
    );

    Ok(Established {
        endpoint: Endpoint { local, peer },
        role: Role::Offer,
        region,
        notifier,
        ring,
        namespace: ns.clone(),
    })
}

/// Runs the accepting side of the handshake.
pub fn accept(
    caps: &Capabilities,
    ns: &Namespace,
    params: &Params,
    cancel: &Cancel,
) -> Result<Established> {
    let local = ns.domain_id()?;
    info!("domain {local}: waiting for an offer");

    let peer: DomainId = ns.watch_number(key::SERVER_ID, cancel, params.timeout)?;
    ensure!(peer != local, "offer comes from our own domain id {local}");
    ns.write(key::CLIENT_ID, local)?;
    info!("domain {local}: peer is domain {peer}");

    let refs = ns.watch(key::GRANT_REFS, cancel, params.timeout)?;
    let refs = refs
        .split(GRANT_REF_DELIMITER)
        .filter(|r| !r.is_empty())
        .map(|r| r.parse::<GrantRef>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("malformed grant references {refs:?}"))?;
    ensure!(!refs.is_empty(), "no grant references published");

    let msg_len: usize = ns.watch_number(key::MSG_LEN, cancel, params.timeout)?;
    ensure!(
        (HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&msg_len),
        "peer's message size {msg_len} is outside of {HEADER_SIZE}..={MAX_MESSAGE_SIZE}"
    );

    let region = SharedRegion::accept(&*caps.grants, peer, &refs)?;

    let remote: Port = ns.watch_number(key::EVENT_CHANNEL_PORT, cancel, params.timeout)?;
    let port = caps
        .channels
        .bind_interdomain(peer, remote)
        .with_context(|| format!("failed to bind to port {remote} of domain {peer}"))?;
    let notifier = Notifier::bind(caps.channels.clone(), port)?;

    ns.write(key::RING_READY, 1)?;
    debug!("domain {local}: bound port {port} to {peer}:{remote}");

    let ring = wait_for_ring(&region, &notifier, cancel, params.timeout)?;
    info!(
        "domain {local}: attached to a ring with {} slots of {} bytes",
        ring.slot_count(),
        ring.slot_size()
    );

    Ok(Established {
        endpoint: Endpoint { local, peer },
        role: Role::Accept,
        region,
        notifier,
        ring,
        namespace: ns.clone(),
    })
}

fn wait_for_ring(
    region: &SharedRegion,
    notifier: &Notifier,
    cancel: &Cancel,
    timeout: Option<Duration>,
) -> Result<Sring> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        match Sring::attach(region.memory()) {
            Ok(ring) => return Ok(ring),
            Err(EAGAIN) => {}
            Err(e) => return Err(Errno(e)).context("peer laid out an unusable ring"),
        }

        if cancel.is_cancelled() {
            bail!("wait for the ring was cancelled");
        }

        let slice = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    bail!("timed out waiting for the peer to lay out the ring");
                }
                left.min(RING_POLL)
            }
            None => RING_POLL,
        };

        notifier.wait_for_signal(Some(slice))?;
    }
}

/// Undoes what the handshake set up on this side.
///
/// The offering side retires the ring, ends its grants and resets the keys.
pub fn teardown(role: Role, ns: &Namespace, region: &mut SharedRegion) -> Result<()> {
    if role == Role::Offer {
        if let Ok(ring) = Sring::attach(region.memory()) {
            ring.retire();
        }
        region.revoke()?;
        ns.reset_all()?;
    }
    Ok(())
}
