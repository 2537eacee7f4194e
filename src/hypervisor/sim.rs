// SPDX-License-Identifier: Apache-2.0

//! In-process hypervisor
//!
//! Hosts any number of domains in one address space. Grants hand out
//! references to anonymous page mappings and event channels are bound port
//! pairs whose delivery runs the handler of the receiving end.

use super::{Capabilities, DomainId, EventChannels, GrantRef, Grants, Handler, Port};
use crate::region::{Mapping, Pages};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, ensure, Result};
use log::{debug, trace};
use postern::ring::SharedMemory;

// References below this are reserved, as on Xen.
const FIRST_GRANT_REF: GrantRef = 8;

struct Grant {
    owner: DomainId,
    grantee: DomainId,
    pages: Arc<Pages>,
    index: usize,
}

struct Channel {
    peer: DomainId,
    remote: Option<(DomainId, Port)>,
    handler: Option<Arc<dyn Fn() + Send + Sync>>,
    pending: bool,
}

#[derive(Default)]
struct State {
    next_ref: GrantRef,
    grants: HashMap<GrantRef, Grant>,
    next_port: HashMap<DomainId, Port>,
    channels: HashMap<(DomainId, Port), Channel>,
}

impl State {
    fn channel(&mut self, domain: DomainId, port: Port) -> Result<&mut Channel> {
        self.channels
            .get_mut(&(domain, port))
            .ok_or_else(|| anyhow!("domain {domain} has no event channel port {port}"))
    }

    fn new_port(&mut self, domain: DomainId, peer: DomainId, remote: Option<(DomainId, Port)>) -> Port {
        let next = self.next_port.entry(domain).or_insert(1);
        let port = *next;
        *next += 1;

        self.channels.insert(
            (domain, port),
            Channel {
                peer,
                remote,
                handler: None,
                pending: false,
            },
        );
        port
    }
}

/// The shared hypervisor state.
#[derive(Clone, Default)]
pub struct Hypervisor(Arc<Mutex<State>>);

impl Hypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The view of domain `id`.
    pub fn domain(&self, id: DomainId) -> Domain {
        Domain {
            id,
            state: self.0.clone(),
        }
    }

    /// Both capabilities of domain `id`.
    pub fn capabilities(&self, id: DomainId) -> Capabilities {
        let domain = Arc::new(self.domain(id));
        Capabilities {
            grants: domain.clone(),
            channels: domain,
        }
    }

    /// Number of grants still active.
    pub fn active_grants(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).grants.len()
    }
}

/// One domain's view of the [`Hypervisor`].
pub struct Domain {
    id: DomainId,
    state: Arc<Mutex<State>>,
}

impl Domain {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }
}

impl Grants for Domain {
    fn grant(&self, peer: DomainId, pages: &Arc<Pages>, index: usize) -> Result<GrantRef> {
        ensure!(
            index < pages.count(),
            "page {index} is outside of a {}-page region",
            pages.count()
        );

        let mut state = self.state();
        let gref = state.next_ref.max(FIRST_GRANT_REF);
        state.next_ref = gref + 1;
        state.grants.insert(
            gref,
            Grant {
                owner: self.id,
                grantee: peer,
                pages: pages.clone(),
                index,
            },
        );

        trace!("domain {}: granted page {index} to {peer} as {gref}", self.id);
        Ok(gref)
    }

    fn end_access(&self, gref: GrantRef) -> Result<()> {
        let mut state = self.state();
        match state.grants.get(&gref) {
            Some(grant) if grant.owner == self.id => {
                state.grants.remove(&gref);
                Ok(())
            }
            Some(_) => bail!("domain {} does not own grant {gref}", self.id),
            None => bail!("unknown grant {gref}"),
        }
    }

    fn map(&self, peer: DomainId, refs: &[GrantRef]) -> Result<Arc<dyn SharedMemory>> {
        let state = self.state();

        let mut first: Option<(&Arc<Pages>, usize)> = None;
        for (i, gref) in refs.iter().enumerate() {
            let grant = state
                .grants
                .get(gref)
                .ok_or_else(|| anyhow!("unknown grant {gref}"))?;
            ensure!(
                grant.owner == peer && grant.grantee == self.id,
                "grant {gref} is not from domain {peer} to domain {}",
                self.id
            );

            match first {
                None => first = Some((&grant.pages, grant.index)),
                Some((pages, index)) => ensure!(
                    Arc::ptr_eq(pages, &grant.pages) && grant.index == index + i,
                    "grant {gref} is not contiguous with the previous ones"
                ),
            }
        }

        let (pages, index) = first.ok_or_else(|| anyhow!("no grant references to map"))?;
        debug!(
            "domain {}: mapped {} pages from {peer} at page {index}",
            self.id,
            refs.len()
        );
        Ok(Arc::new(Mapping::new(pages.clone(), index, refs.len())?))
    }
}

impl EventChannels for Domain {
    fn alloc_unbound(&self, peer: DomainId) -> Result<Port> {
        let port = self.state().new_port(self.id, peer, None);
        debug!("domain {}: unbound port {port} for {peer}", self.id);
        Ok(port)
    }

    fn bind_interdomain(&self, peer: DomainId, remote: Port) -> Result<Port> {
        let mut state = self.state();

        let theirs = state.channel(peer, remote)?;
        ensure!(
            theirs.peer == self.id,
            "port {remote} of domain {peer} is not meant for domain {}",
            self.id
        );
        ensure!(theirs.remote.is_none(), "port {remote} of domain {peer} is already bound");

        let local = state.new_port(self.id, peer, Some((peer, remote)));
        state.channel(peer, remote)?.remote = Some((self.id, local));

        debug!("domain {}: port {local} bound to {peer}:{remote}", self.id);
        Ok(local)
    }

    fn bind_handler(&self, port: Port, handler: Handler) -> Result<()> {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::from(handler);

        let fire = {
            let mut state = self.state();
            let channel = state.channel(self.id, port)?;
            channel.handler = Some(handler.clone());
            std::mem::take(&mut channel.pending)
        };

        if fire {
            handler();
        }
        Ok(())
    }

    fn notify(&self, port: Port) -> Result<()> {
        let handler = {
            let mut state = self.state();
            let (domain, remote) = state
                .channel(self.id, port)?
                .remote
                .ok_or_else(|| anyhow!("port {port} of domain {} is not connected", self.id))?;

            let theirs = state.channel(domain, remote)?;
            match theirs.handler.clone() {
                Some(handler) => Some(handler),
                None => {
                    theirs.pending = true;
                    None
                }
            }
        };

        if let Some(handler) = handler {
            handler();
        }
        Ok(())
    }

    fn close(&self, port: Port) -> Result<()> {
        let mut state = self.state();
        let channel = state
            .channels
            .remove(&(self.id, port))
            .ok_or_else(|| anyhow!("domain {} has no event channel port {port}", self.id))?;

        if let Some((domain, remote)) = channel.remote {
            if let Some(theirs) = state.channels.get_mut(&(domain, remote)) {
                theirs.remote = None;
            }
        }
        Ok(())
    }
}
