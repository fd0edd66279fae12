//! Lower-layer interfaces the broker is built on
//!
//! The broker never touches page tables itself. Everything that needs kernel
//! privilege goes through these two traits:
//!
//! - [`MemoryPlatform`]: page allocation and page aliasing, backed by the
//!   broker's own memory capabilities
//! - [`DomainEnumerator`]: the boot layer's view of which domains exist and
//!   how to obtain a capability to each one's page-table root
//!
//! Both are trusted. A hosted implementation of each lives in [`crate::mock`].

use crate::{CapRef, DomainId, MapFlags, Result, VirtAddr};

/// Page allocation and page-table primitives
///
/// Methods take `&self`: implementations provide their own synchronization,
/// the broker only serializes its own bookkeeping.
pub trait MemoryPlatform {
    /// Reference to one physical page owned by the broker
    type Page;

    /// Page-table capability of the broker's own domain
    fn broker_pagetable(&self) -> CapRef;

    /// Acquire one fresh physical page, mapped in the broker's domain
    ///
    /// # Errors
    /// Returns `OutOfPages` when physical memory is exhausted
    fn acquire_page(&self) -> Result<Self::Page>;

    /// Prepare the translation structures covering `[base, base + len)` in
    /// the page table behind `pagetable`
    ///
    /// Called once per domain before the first page is mapped into its
    /// shared window.
    fn reserve_window(&self, pagetable: CapRef, base: VirtAddr, len: usize) -> Result<()>;

    /// Alias `page` (mapped in `source`) at `vaddr` in the `target` page table
    ///
    /// # Errors
    /// Returns `Platform` with the lower layer's status code on failure; the
    /// target page table is left unchanged in that case.
    fn map_page(
        &self,
        target: CapRef,
        vaddr: VirtAddr,
        source: CapRef,
        page: &Self::Page,
        flags: MapFlags,
    ) -> Result<()>;
}

/// Boot-time domain discovery
pub trait DomainEnumerator {
    /// Number of domains in the system, the broker's own included
    ///
    /// Domains are numbered `1..=domain_count()`.
    fn domain_count(&self) -> Result<u32>;

    /// Obtain a page-table capability for `domain`, delegated to `broker`
    fn pagetable_cap(&self, broker: DomainId, domain: DomainId) -> Result<CapRef>;

    /// Tell the boot layer the broker finished initialization
    fn init_done(&self) {}
}
