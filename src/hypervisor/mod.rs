// SPDX-License-Identifier: Apache-2.0

//! Capability boundary to the hypervisor's grant table and event channels.

pub mod sim;

use std::sync::Arc;

use anyhow::Result;
use postern::ring::SharedMemory;

use crate::region::Pages;

/// Identifier of a virtual machine.
pub type DomainId = u16;

/// Reference to one granted page.
pub type GrantRef = u32;

/// Event channel port, local to the domain that holds it.
pub type Port = u32;

/// Callback run when a signal arrives on a bound port.
///
/// Runs in the delivery context and must only wake someone up.
pub type Handler = Box<dyn Fn() + Send + Sync>;

pub trait Grants: Send + Sync {
    /// Grants `peer` read-write access to page `index` of `pages`
    fn grant(&self, peer: DomainId, pages: &Arc<Pages>, index: usize) -> Result<GrantRef>;

    /// Revokes a grant made by this domain
    fn end_access(&self, gref: GrantRef) -> Result<()>;

    /// Maps pages granted to us by `peer`, in order, as one contiguous region
    fn map(&self, peer: DomainId, refs: &[GrantRef]) -> Result<Arc<dyn SharedMemory>>;
}

pub trait EventChannels: Send + Sync {
    /// Allocates a port the peer can bind to
    fn alloc_unbound(&self, peer: DomainId) -> Result<Port>;

    /// Binds a local port to the peer's unbound `remote` port
    fn bind_interdomain(&self, peer: DomainId, remote: Port) -> Result<Port>;

    /// Installs the callback for signals arriving on `port`
    fn bind_handler(&self, port: Port, handler: Handler) -> Result<()>;

    /// Signals the other end of `port`
    fn notify(&self, port: Port) -> Result<()>;

    /// Closes `port`; later signals to it are lost
    fn close(&self, port: Port) -> Result<()>;
}

/// Both capabilities of one domain.
#[derive(Clone)]
pub struct Capabilities {
    pub grants: Arc<dyn Grants>,
    pub channels: Arc<dyn EventChannels>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
