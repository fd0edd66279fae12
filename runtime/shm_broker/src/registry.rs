//! Domain Registry - per-domain shared window bookkeeping
//!
//! Every client domain gets a fixed window of virtual addresses starting at
//! the configured base. The registry tracks, per domain:
//! - the page-table capability the broker maps through
//! - the frontier (next unused address in the window)
//! - which handles are mapped where
//!
//! Entries are created when the boot layer registers a domain and their
//! window is set up lazily, on the first allocate/attach from that domain.
//! The frontier is a bump pointer: addresses are never handed out twice.

use crate::{
    BrokerConfig, CapRef, DomainId, Handle, MemoryPlatform, Result, ShmError, VirtAddr,
};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Next free page in a domain window, not yet committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub vaddr: VirtAddr,
    next_frontier: VirtAddr,
}

/// Shared-memory state of one client domain
#[derive(Debug)]
pub struct DomainEntry {
    pagetable_cap: CapRef,
    frontier: VirtAddr,
    local_map: BTreeMap<Handle, VirtAddr>,
    initialized: bool,
}

impl DomainEntry {
    fn new(pagetable_cap: CapRef, base: VirtAddr) -> Self {
        Self {
            pagetable_cap,
            frontier: base,
            local_map: BTreeMap::new(),
            initialized: false,
        }
    }

    /// Capability to this domain's page-table root
    pub fn pagetable_cap(&self) -> CapRef {
        self.pagetable_cap
    }

    /// Next unused address in the shared window
    pub fn frontier(&self) -> VirtAddr {
        self.frontier
    }

    /// Has the shared window been set up?
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Address `handle` is mapped at in this domain
    pub fn local(&self, handle: Handle) -> Option<VirtAddr> {
        self.local_map.get(&handle).copied()
    }

    /// Number of handles mapped into this domain
    pub fn mapped_count(&self) -> usize {
        self.local_map.len()
    }

    /// Work out where the next page would go without touching any state
    pub(crate) fn next_slot(&self, domain: DomainId, page_size: usize, window_end: VirtAddr) -> Result<Slot> {
        let next_frontier = self
            .frontier
            .checked_add(page_size)
            .ok_or(ShmError::Overflow { what: "frontier" })?;

        if next_frontier > window_end {
            return Err(ShmError::DomainWindowFull { domain });
        }

        Ok(Slot {
            vaddr: self.frontier,
            next_frontier,
        })
    }

    /// Record a mapping made at `slot` and move the frontier past it
    pub(crate) fn commit(&mut self, handle: Handle, slot: Slot) {
        debug_assert_eq!(slot.vaddr, self.frontier);
        self.local_map.insert(handle, slot.vaddr);
        self.frontier = slot.next_frontier;
    }
}

/// Registry of all client domains
#[derive(Debug)]
pub struct DomainRegistry {
    domains: BTreeMap<DomainId, DomainEntry>,
    config: BrokerConfig,
}

impl DomainRegistry {
    /// Create an empty registry for windows laid out per `config`
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            domains: BTreeMap::new(),
            config,
        }
    }

    /// Register a client domain and the capability to its page-table root
    ///
    /// # Errors
    /// - `InvalidDomain` if the id is 0, the broker's own, or out of range
    /// - `InvalidCapability` if `pagetable_cap` is null
    /// - `DuplicateDomain` if the domain is already registered
    pub fn register_domain(&mut self, domain: DomainId, pagetable_cap: CapRef) -> Result<()> {
        if domain.raw() == 0
            || domain.raw() >= self.config.max_domains
            || domain.raw() == self.config.broker_domain
        {
            return Err(ShmError::InvalidDomain { domain });
        }
        if pagetable_cap.is_null() {
            return Err(ShmError::InvalidCapability { domain });
        }
        if self.domains.contains_key(&domain) {
            return Err(ShmError::DuplicateDomain { domain });
        }

        self.domains.insert(
            domain,
            DomainEntry::new(pagetable_cap, self.config.window_start()),
        );
        log::debug!("registered {} with page table {}", domain, pagetable_cap);
        Ok(())
    }

    /// Set up `domain`'s shared window if this is its first request
    ///
    /// Idempotent: after the first successful call this only looks the entry up.
    ///
    /// # Errors
    /// `InvalidDomain` if the domain was never registered; platform errors
    /// from reserving the window (the entry stays uninitialized then)
    pub fn ensure_initialized<P: MemoryPlatform>(
        &mut self,
        domain: DomainId,
        platform: &P,
    ) -> Result<&mut DomainEntry> {
        let window_start = self.config.window_start();
        let window_len = self.config.window_len();

        let entry = self
            .domains
            .get_mut(&domain)
            .ok_or(ShmError::InvalidDomain { domain })?;

        if !entry.initialized {
            platform.reserve_window(entry.pagetable_cap, window_start, window_len)?;
            entry.local_map.clear();
            entry.frontier = window_start;
            entry.initialized = true;
            log::info!(
                "initialized shared window for {} at {} ({} bytes)",
                domain,
                window_start,
                window_len
            );
        }

        Ok(entry)
    }

    /// Address `handle` was mapped at in `domain`
    ///
    /// # Errors
    /// `InvalidDomain` if the domain was never registered, `UnknownHandle` if
    /// the handle was never allocated or attached by that domain
    pub fn lookup(&self, domain: DomainId, handle: Handle) -> Result<VirtAddr> {
        self.entry(domain)?
            .local(handle)
            .ok_or(ShmError::UnknownHandle { handle })
    }

    /// Registry entry of `domain`
    pub fn entry(&self, domain: DomainId) -> Result<&DomainEntry> {
        self.domains
            .get(&domain)
            .ok_or(ShmError::InvalidDomain { domain })
    }

    /// Current frontier of `domain`
    pub fn frontier(&self, domain: DomainId) -> Result<VirtAddr> {
        self.entry(domain).map(DomainEntry::frontier)
    }

    /// All (handle, address) pairs mapped into `domain`, ordered by handle
    pub fn mappings(&self, domain: DomainId) -> Result<Vec<(Handle, VirtAddr)>> {
        Ok(self
            .entry(domain)?
            .local_map
            .iter()
            .map(|(&handle, &vaddr)| (handle, vaddr))
            .collect())
    }

    /// Dump `domain`'s region table to the debug log
    pub fn log_regions(&self, domain: DomainId) {
        match self.entry(domain) {
            Ok(entry) => {
                log::debug!("regions for {} (frontier {}):", domain, entry.frontier);
                for (handle, vaddr) in &entry.local_map {
                    log::debug!("  handle {} -> {}", handle, vaddr);
                }
            }
            Err(_) => log::debug!("no regions: {} is not registered", domain),
        }
    }

    /// Number of registered domains
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// Is `domain` registered?
    pub fn contains(&self, domain: DomainId) -> bool {
        self.domains.contains_key(&domain)
    }

    /// End of every domain's shared window
    pub(crate) fn window_end(&self) -> VirtAddr {
        // validate() guarantees the window fits the address space
        self.config
            .window_end()
            .unwrap_or(VirtAddr(usize::MAX))
    }
}
