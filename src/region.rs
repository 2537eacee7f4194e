// SPDX-License-Identifier: Apache-2.0

//! Shared region: the granted pages that carry the ring.

use crate::hypervisor::{DomainId, GrantRef, Grants};

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use log::{debug, warn};
use mmarinus::{perms, Kind, Map};
use postern::ring::SharedMemory;
use primordial::Page;

/// Anonymous page-aligned memory, zeroed on allocation.
pub struct Pages {
    map: Map<perms::ReadWrite>,
    count: usize,
}

impl Pages {
    pub fn new(count: usize) -> Result<Self> {
        ensure!(count > 0, "cannot allocate an empty region");

        let map = Map::map(count * Page::SIZE)
            .anywhere()
            .anonymously()
            .known::<perms::ReadWrite>(Kind::Private)
            .with_context(|| format!("failed to allocate {count} pages"))?;

        Ok(Self { map, count })
    }

    /// Number of pages.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }
}

impl fmt::Debug for Pages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pages")
            .field("addr", &format_args!("{:#x}", self.map.addr()))
            .field("count", &self.count)
            .finish()
    }
}

// SAFETY: the mapping lives as long as self, is page aligned and is only
// touched through the ring's raw copies and atomics.
unsafe impl SharedMemory for Pages {
    fn as_ptr(&self) -> NonNull<u8> {
        // SAFETY: a successful mmap never returns address zero.
        unsafe { NonNull::new_unchecked(self.map.addr() as *mut u8) }
    }

    fn len(&self) -> usize {
        self.map.size()
    }
}

/// A run of pages granted by a peer, mapped into our address space.
#[derive(Debug)]
pub struct Mapping {
    pages: Arc<Pages>,
    first: usize,
    count: usize,
}

impl Mapping {
    pub fn new(pages: Arc<Pages>, first: usize, count: usize) -> Result<Self> {
        ensure!(
            count > 0 && first + count <= pages.count(),
            "pages {first}..{} are outside of a {}-page region",
            first + count,
            pages.count()
        );

        Ok(Self {
            pages,
            first,
            count,
        })
    }
}

// SAFETY: the range is checked against the backing pages, which are kept alive.
unsafe impl SharedMemory for Mapping {
    fn as_ptr(&self) -> NonNull<u8> {
        // SAFETY: in bounds of the backing pages.
        unsafe { NonNull::new_unchecked(self.pages.as_ptr().as_ptr().add(self.first * Page::SIZE)) }
    }

    fn len(&self) -> usize {
        self.count * Page::SIZE
    }
}

/// The region both domains see, and the grants that make it shared.
///
/// The offering side owns the grants and revokes them all at once; the
/// accepting side only holds a mapping.
pub struct SharedRegion {
    memory: Arc<dyn SharedMemory>,
    grants: Option<(Arc<dyn Grants>, Vec<GrantRef>)>,
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.memory.as_ptr())
            .field("len", &self.memory.len())
            .field("refs", &self.refs())
            .finish()
    }
}

impl SharedRegion {
    /// Allocates `count` pages and grants each one to `peer`.
    pub fn offer(grants: Arc<dyn Grants>, peer: DomainId, count: usize) -> Result<Self> {
        let pages = Arc::new(Pages::new(count)?);

        let mut refs = Vec::with_capacity(count);
        for index in 0..count {
            match grants.grant(peer, &pages, index) {
                Ok(gref) => refs.push(gref),
                Err(e) => {
                    for gref in refs {
                        let _ = grants.end_access(gref);
                    }
                    return Err(e.context(format!("failed to grant page {index} to domain {peer}")));
                }
            }
        }

        debug!("granted {count} pages to domain {peer}: {refs:?}");
        Ok(Self {
            memory: pages,
            grants: Some((grants, refs)),
        })
    }

    /// Maps the pages `peer` granted us.
    pub fn accept(grants: &dyn Grants, peer: DomainId, refs: &[GrantRef]) -> Result<Self> {
        let memory = grants
            .map(peer, refs)
            .with_context(|| format!("failed to map grants {refs:?} of domain {peer}"))?;

        Ok(Self {
            memory,
            grants: None,
        })
    }

    /// The memory the ring is laid out in.
    #[inline]
    pub fn memory(&self) -> Arc<dyn SharedMemory> {
        self.memory.clone()
    }

    /// Grant references, offering side only.
    pub fn refs(&self) -> &[GrantRef] {
        self.grants.as_ref().map_or(&[], |(_, refs)| refs)
    }

    /// Ends every grant. The pages are released once the last mapping goes.
    pub fn revoke(&mut self) -> Result<()> {
        let Some((grants, refs)) = self.grants.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        for gref in refs {
            if let Err(e) = grants.end_access(gref) {
                warn!("failed to end access to grant {gref}: {e:#}");
                result = Err(e);
            }
        }
        result
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let _ = self.revoke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::sim::Hypervisor;

    #[test]
    fn pages_are_zeroed_and_aligned() {
        let pages = Pages::new(2).unwrap();
        assert_eq!(pages.len(), 2 * Page::SIZE);
        assert_eq!(pages.as_ptr().as_ptr() as usize % Page::SIZE, 0);
        assert!(Pages::new(0).is_err());
    }

    #[test]
    fn offer_accept_revoke() {
        let hv = Hypervisor::new();
        let server = Arc::new(hv.domain(1));
        let client = hv.domain(2);

        let mut offered = SharedRegion::offer(server, 2, 4).unwrap();
        assert_eq!(offered.refs().len(), 4);
        assert_eq!(hv.active_grants(), 4);

        let accepted = SharedRegion::accept(&client, 1, offered.refs()).unwrap();
        assert_eq!(accepted.memory().as_ptr(), offered.memory().as_ptr());
        assert_eq!(accepted.memory().len(), 4 * Page::SIZE);
        assert!(accepted.refs().is_empty());

        offered.revoke().unwrap();
        assert_eq!(hv.active_grants(), 0);
        assert!(offered.refs().is_empty());
        // Revoking twice is a no-op.
        offered.revoke().unwrap();
    }

    #[test]
    fn mapping_bounds() {
        let pages = Arc::new(Pages::new(2).unwrap());
        assert!(Mapping::new(pages.clone(), 1, 1).is_ok());
        assert!(Mapping::new(pages.clone(), 1, 2).is_err());
        assert!(Mapping::new(pages, 0, 0).is_err());
    }
}
