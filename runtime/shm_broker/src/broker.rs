//! Region Broker - owns shared pages and maps them into client domains
//!
//! # Architecture
//! The broker keeps two coordinate systems in one lock-guarded state object:
//! - the global region table: handle -> physical page (owned here)
//! - the [`DomainRegistry`]: per domain, handle -> local virtual address
//!
//! `allocate` and `attach` read-modify-write both, so they run under a single
//! scoped lock. The guard drops on every return path. All checks and the
//! platform mapping happen before anything is recorded; a failed call leaves
//! no handle consumed, no frontier moved and no `local_map` entry written.

use crate::registry::DomainRegistry;
use crate::{
    BrokerConfig, CapRef, DomainId, Handle, MapFlags, MemoryPlatform, Result, ShmError, VirtAddr,
};
use alloc::vec::Vec;
use spin::Mutex;

/// One shared physical page
struct GlobalRegion<Page> {
    handle: Handle,
    page: Page,
}

struct BrokerState<Page> {
    /// Indexed by handle; handles are dense and never reused
    regions: Vec<GlobalRegion<Page>>,
    registry: DomainRegistry,
}

/// The shared-page broker
///
/// Share it between request handlers with an `Arc`; every method takes `&self`.
pub struct RegionBroker<P: MemoryPlatform> {
    platform: P,
    config: BrokerConfig,
    state: Mutex<BrokerState<P::Page>>,
}

impl<P: MemoryPlatform> RegionBroker<P> {
    /// Create a broker on top of `platform`
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `config` does not validate
    pub fn new(platform: P, config: BrokerConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            platform,
            state: Mutex::new(BrokerState {
                regions: Vec::new(),
                registry: DomainRegistry::new(config.clone()),
            }),
            config,
        })
    }

    /// Broker configuration, as validated by [`RegionBroker::new`]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Underlying platform
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Identifier of the broker's own domain
    pub fn domain(&self) -> DomainId {
        DomainId(self.config.broker_domain)
    }

    /// Register a client domain (boot time only)
    ///
    /// See [`DomainRegistry::register_domain`] for the failure cases.
    pub fn register_domain(&self, domain: DomainId, pagetable_cap: CapRef) -> Result<()> {
        self.state.lock().registry.register_domain(domain, pagetable_cap)
    }

    /// Allocate a fresh shared page and map it into `domain`
    ///
    /// # Arguments
    /// * `domain` - Calling domain
    /// * `pages` - Number of pages; only single-page regions exist
    ///
    /// # Returns
    /// The new region's handle; the page sits at the domain's old frontier
    ///
    /// # Errors
    /// - `Unsupported` unless `pages == 1`
    /// - `InvalidDomain` if `domain` was never registered
    /// - `RegionTableFull` / `DomainWindowFull` on capacity exhaustion
    /// - `OutOfPages` / `Platform` when the lower layer fails
    pub fn allocate(&self, domain: DomainId, pages: usize) -> Result<Handle> {
        if pages != 1 {
            log::warn!("{} asked for {} pages: multi-page regions unsupported", domain, pages);
            return Err(ShmError::Unsupported { pages });
        }

        let broker_pagetable = self.platform.broker_pagetable();
        let mut guard = self.state.lock();
        let BrokerState { regions, registry } = &mut *guard;

        let window_end = registry.window_end();
        let entry = registry.ensure_initialized(domain, &self.platform)?;

        if regions.len() >= self.config.max_regions {
            return Err(ShmError::RegionTableFull {
                capacity: self.config.max_regions,
            });
        }
        let handle = Handle::from_index(regions.len()).ok_or(ShmError::Overflow { what: "handle" })?;
        let slot = entry.next_slot(domain, self.config.page_size, window_end)?;

        let page = self.platform.acquire_page()?;
        self.platform.map_page(
            entry.pagetable_cap(),
            slot.vaddr,
            broker_pagetable,
            &page,
            MapFlags::SHARED,
        )?;

        regions.push(GlobalRegion { handle, page });
        entry.commit(handle, slot);

        log::debug!("allocated region {} for {} at {}", handle, domain, slot.vaddr);
        Ok(handle)
    }

    /// Map an existing region into `domain`
    ///
    /// Attaching a handle the domain already has mapped succeeds without a
    /// second mapping; the frontier does not move.
    ///
    /// # Errors
    /// - `InvalidDomain` if `domain` was never registered
    /// - `UnknownHandle` if no region has this handle
    /// - `DomainWindowFull` / `Platform` as for [`RegionBroker::allocate`]
    pub fn attach(&self, domain: DomainId, handle: Handle) -> Result<()> {
        let broker_pagetable = self.platform.broker_pagetable();
        let mut guard = self.state.lock();
        let BrokerState { regions, registry } = &mut *guard;

        let window_end = registry.window_end();
        let entry = registry.ensure_initialized(domain, &self.platform)?;

        let region = regions
            .get(handle.index())
            .ok_or(ShmError::UnknownHandle { handle })?;
        debug_assert_eq!(region.handle, handle);

        if let Some(vaddr) = entry.local(handle) {
            log::debug!("{} already has region {} at {}", domain, handle, vaddr);
            return Ok(());
        }

        let slot = entry.next_slot(domain, self.config.page_size, window_end)?;
        self.platform.map_page(
            entry.pagetable_cap(),
            slot.vaddr,
            broker_pagetable,
            &region.page,
            MapFlags::SHARED,
        )?;
        entry.commit(handle, slot);

        log::debug!("attached region {} to {} at {}", handle, domain, slot.vaddr);
        Ok(())
    }

    /// Address `handle` is mapped at in `domain`
    ///
    /// # Errors
    /// `InvalidDomain` if the domain was never registered, `UnknownHandle` if
    /// the domain never allocated or attached the handle
    pub fn resolve(&self, domain: DomainId, handle: Handle) -> Result<VirtAddr> {
        self.state.lock().registry.lookup(domain, handle)
    }

    /// Give a region back
    ///
    /// Reclaiming a page needs per-handle reference counts across every
    /// domain that attached it; until those exist this always fails.
    pub fn release(&self, handle: Handle) -> Result<()> {
        log::warn!("release of region {} refused: not implemented", handle);
        Err(ShmError::NotImplemented { operation: "release" })
    }

    /// Number of regions allocated so far
    pub fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Current frontier of `domain`'s shared window
    pub fn frontier(&self, domain: DomainId) -> Result<VirtAddr> {
        self.state.lock().registry.frontier(domain)
    }

    /// (handle, address) pairs mapped into `domain`
    pub fn mappings(&self, domain: DomainId) -> Result<Vec<(Handle, VirtAddr)>> {
        self.state.lock().registry.mappings(domain)
    }

    /// Dump `domain`'s regions to the debug log
    pub fn log_regions(&self, domain: DomainId) {
        self.state.lock().registry.log_regions(domain);
    }

    /// Number of registered client domains
    pub fn domain_count(&self) -> usize {
        self.state.lock().registry.domain_count()
    }

    /// Run `f` on the physical page behind `handle`
    pub fn with_page<R>(&self, handle: Handle, f: impl FnOnce(&P::Page) -> R) -> Result<R> {
        let state = self.state.lock();
        let region = state
            .regions
            .get(handle.index())
            .ok_or(ShmError::UnknownHandle { handle })?;
        Ok(f(&region.page))
    }
}
