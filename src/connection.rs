// SPDX-License-Identifier: Apache-2.0

//! Connection context
//!
//! A [`Connection`] is the calling end of one channel: it owns the region,
//! the front of the ring, the notifier and the multiplexer. [`Serving`] is
//! the answering end. Nothing here is global; any number of connections can
//! live in one process.

use crate::config::Config;
use crate::device::Handles;
use crate::hypervisor::sim::Hypervisor;
use crate::hypervisor::Capabilities;
use crate::mux::{self, Caller, Mux, Stats};
use crate::peer::{Handler, Server};
use crate::region::SharedRegion;
use crate::rendezvous::{self, Endpoint, Established, Params, Role};
use crate::store::{Cancel, MemStore, Namespace};

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::info;
use postern::message::{Message, Status};
use postern::ring::{BackRing, FrontRing};

/// What one side has to undo on shutdown.
#[derive(Debug)]
struct Side {
    endpoint: Endpoint,
    role: Role,
    region: SharedRegion,
    namespace: Namespace,
}

impl Side {
    fn teardown(mut self) -> Result<()> {
        info!(
            "domain {}: closing the channel to {}",
            self.endpoint.local, self.endpoint.peer
        );
        rendezvous::teardown(self.role, &self.namespace, &mut self.region)
    }
}

/// The answering end of a channel.
#[derive(Debug)]
pub struct Serving {
    server: Server,
    side: Side,
}

impl Serving {
    /// Runs the handshake as `role` and serves the back of the ring.
    pub fn establish(
        role: Role,
        caps: &Capabilities,
        ns: &Namespace,
        params: &Params,
        cancel: &Cancel,
        handler: impl Handler + 'static,
        poll: Duration,
    ) -> Result<Self> {
        let established = rendezvous::establish(role, caps, ns, params, cancel)?;
        Self::new(established, handler, poll)
    }

    pub fn new(established: Established, handler: impl Handler + 'static, poll: Duration) -> Result<Self> {
        let Established {
            endpoint,
            role,
            region,
            notifier,
            ring,
            namespace,
        } = established;

        let server = Server::start(BackRing::new(ring), notifier, handler, poll)?;
        Ok(Self {
            server,
            side: Side {
                endpoint,
                role,
                region,
                namespace,
            },
        })
    }

    /// Requests answered so far.
    pub fn served(&self) -> u64 {
        self.server.served()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.side.endpoint
    }

    /// Answers what is queued, stops and tears down this side.
    pub fn shutdown(self) -> Result<()> {
        let served = self.server.shutdown();
        self.side.teardown().and(served)
    }
}

/// The calling end of a channel.
#[derive(Debug)]
pub struct Connection {
    mux: Mux,
    handles: Handles,
    side: Side,
    // Answering end of a loopback connection.
    peer: Option<Serving>,
}

impl Connection {
    /// Runs the handshake as `role` and starts the multiplexer on the front of the ring.
    pub fn establish(
        role: Role,
        caps: &Capabilities,
        ns: &Namespace,
        params: &Params,
        cancel: &Cancel,
        options: mux::Options,
    ) -> Result<Self> {
        let established = rendezvous::establish(role, caps, ns, params, cancel)?;
        Self::new(established, options)
    }

    /// Offers the region and runs the ring front on the offering side.
    pub fn offer(
        caps: &Capabilities,
        ns: &Namespace,
        params: &Params,
        cancel: &Cancel,
        options: mux::Options,
    ) -> Result<Self> {
        Self::establish(Role::Offer, caps, ns, params, cancel, options)
    }

    /// Maps the peer's region and runs the ring front on the accepting side.
    pub fn accept(
        caps: &Capabilities,
        ns: &Namespace,
        params: &Params,
        cancel: &Cancel,
        options: mux::Options,
    ) -> Result<Self> {
        Self::establish(Role::Accept, caps, ns, params, cancel, options)
    }

    pub fn new(established: Established, options: mux::Options) -> Result<Self> {
        let Established {
            endpoint,
            role,
            region,
            notifier,
            ring,
            namespace,
        } = established;

        let mux = Mux::start(FrontRing::new(ring), notifier, options)?;
        Ok(Self {
            mux,
            handles: Handles::default(),
            side: Side {
                endpoint,
                role,
                region,
                namespace,
            },
            peer: None,
        })
    }

    /// Connects two simulated domains in this process.
    ///
    /// This end runs the handshake as `config.role`; the other end runs the
    /// opposite role and answers requests with `handler`.
    pub fn loopback(config: &Config, handler: impl Handler + 'static) -> Result<Self> {
        config.validate()?;

        let (front, back, back_role) = match config.role {
            Role::Offer => (config.offer_domain, config.accept_domain, Role::Accept),
            Role::Accept => (config.accept_domain, config.offer_domain, Role::Offer),
        };

        let hv = Hypervisor::new();
        let store = MemStore::new();
        let front_ns = Namespace::new(store.clone(), &config.store_root, store.add_domain(front)?);
        let back_ns = Namespace::new(store.clone(), &config.store_root, store.add_domain(back)?);

        let params = config.params();
        let cancel = Cancel::new();

        let handshake = {
            let caps = hv.capabilities(back);
            let params = params.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("handshake".into())
                .spawn(move || rendezvous::establish(back_role, &caps, &back_ns, &params, &cancel))?
        };

        let established = rendezvous::establish(
            config.role,
            &hv.capabilities(front),
            &front_ns,
            &params,
            &cancel,
        );
        if established.is_err() {
            cancel.cancel();
        }

        let theirs = handshake
            .join()
            .map_err(|_| anyhow!("handshake thread panicked"))?;
        let ours = established?;
        let peer = Serving::new(theirs?, handler, config.poll())?;

        let mut conn = Self::new(ours, config.mux_options())?;
        conn.peer = Some(peer);
        Ok(conn)
    }

    /// Calls for the current thread. See [`Mux::call`].
    pub fn call(&self, request: Message) -> Result<Message, mux::Error> {
        self.call_as(Caller::current(), request)
    }

    /// See [`Mux::call_as`].
    pub fn call_as(&self, caller: Caller, request: Message) -> Result<Message, mux::Error> {
        self.handles.track_request(&request);
        let response = self.mux.call_as(caller, request)?;
        self.handles.track_response(&response);
        Ok(response)
    }

    /// See [`Mux::submit`].
    pub fn submit(&self, request: Message) -> Result<u64, mux::Error> {
        self.handles.track_request(&request);
        self.mux.submit(request)
    }

    pub fn abort(&self, caller: Caller) -> bool {
        self.mux.abort(caller)
    }

    pub fn release_caller(&self, caller: Caller) {
        self.mux.release_caller(caller)
    }

    pub fn release_process(&self, process: u32) -> usize {
        self.mux.release_process(process)
    }

    /// Was `handle` created through this connection and not closed since?
    pub fn is_ours(&self, handle: i32) -> bool {
        self.handles.contains(handle)
    }

    pub fn stats(&self) -> Stats {
        self.mux.stats()
    }

    pub fn dead(&self) -> Option<Status> {
        self.mux.dead()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.side.endpoint
    }

    pub fn role(&self) -> Role {
        self.side.role
    }

    /// Requests the in-process peer answered, for loopback connections.
    pub fn served(&self) -> Option<u64> {
        self.peer.as_ref().map(Serving::served)
    }

    /// Stops the worker after a final drain, fails the remaining waits and
    /// tears down the channel.
    pub fn shutdown(self) -> Result<()> {
        let Self {
            mux, side, peer, ..
        } = self;

        mux.shutdown();
        let peer = peer.map_or(Ok(()), Serving::shutdown);
        side.teardown().and(peer)
    }
}
