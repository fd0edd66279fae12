//! Hosted backend for the lower-layer interfaces
//!
//! Simulates physical frames and per-domain page tables in ordinary memory so
//! the broker can be exercised without a kernel. Frames hold real bytes:
//! data written through one page table is visible through every other page
//! table aliasing the same frame.
//!
//! Status codes follow the seL4 error numbering used by the mock syscall
//! layer.

use crate::{
    CapRef, DomainEnumerator, DomainId, MapFlags, MemoryPlatform, Result, ShmError, VirtAddr,
    PAGE_SIZE,
};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

pub const INVALID_ARGUMENT: i32 = 1;
pub const INVALID_CAPABILITY: i32 = 2;
pub const RANGE_ERROR: i32 = 4;
pub const ALIGNMENT_ERROR: i32 = 5;
pub const FAILED_LOOKUP: i32 = 6;
pub const DELETE_FIRST: i32 = 8;
pub const NOT_ENOUGH_MEMORY: i32 = 10;

/// Physical page handed out by [`MockPlatform::acquire_page`]
#[derive(Debug)]
pub struct MockPage {
    frame: usize,
    vaddr: VirtAddr,
}

impl MockPage {
    /// Index of the backing frame
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Where the page lives in the broker's own address space
    pub fn broker_vaddr(&self) -> VirtAddr {
        self.vaddr
    }
}

#[derive(Debug, Clone, Copy)]
struct Pte {
    frame: usize,
    flags: MapFlags,
}

#[derive(Debug, Default)]
struct PageTable {
    /// Ranges with second-level structures in place, `[start, end)`
    windows: Vec<(usize, usize)>,
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    fn covers(&self, vaddr: usize) -> bool {
        self.windows
            .iter()
            .any(|&(start, end)| vaddr >= start && vaddr < end)
    }
}

struct MockState {
    frames: Vec<Box<[u8]>>,
    tables: BTreeMap<CapRef, PageTable>,
    heap_next: usize,
    frame_limit: Option<usize>,
    pending_map_failures: usize,
}

/// Simulated page allocator and page-table layer
pub struct MockPlatform {
    page_size: usize,
    state: Mutex<MockState>,
}

impl MockPlatform {
    /// Page-table capability of the broker's domain
    pub const BROKER_PAGETABLE: CapRef = CapRef(1);

    /// Where acquired pages appear in the broker's own address space
    pub const BROKER_HEAP_BASE: usize = 0x4000_0000;

    const BROKER_HEAP_SIZE: usize = 0x1000_0000;

    /// Create a platform with 4KB pages
    pub fn new() -> Self {
        Self::with_page_size(PAGE_SIZE)
    }

    /// Create a platform with a custom page size (power of two)
    pub fn with_page_size(page_size: usize) -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(
            Self::BROKER_PAGETABLE,
            PageTable {
                windows: vec![(
                    Self::BROKER_HEAP_BASE,
                    Self::BROKER_HEAP_BASE + Self::BROKER_HEAP_SIZE,
                )],
                entries: BTreeMap::new(),
            },
        );

        Self {
            page_size,
            state: Mutex::new(MockState {
                frames: Vec::new(),
                tables,
                heap_next: Self::BROKER_HEAP_BASE,
                frame_limit: None,
                pending_map_failures: 0,
            }),
        }
    }

    /// Cap the number of frames the platform will hand out
    pub fn with_frame_limit(self, limit: usize) -> Self {
        self.state.lock().frame_limit = Some(limit);
        self
    }

    /// Create an empty page table reachable through `cap`
    pub fn create_pagetable(&self, cap: CapRef) {
        self.state.lock().tables.entry(cap).or_default();
    }

    /// Make the next `count` calls to `map_page` fail
    pub fn fail_next_maps(&self, count: usize) {
        self.state.lock().pending_map_failures = count;
    }

    /// Number of frames handed out so far
    pub fn frames_allocated(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Number of pages mapped in the page table behind `pagetable`
    pub fn mapping_count(&self, pagetable: CapRef) -> usize {
        self.state
            .lock()
            .tables
            .get(&pagetable)
            .map_or(0, |table| table.entries.len())
    }

    /// Frame backing `vaddr` in `pagetable`, if mapped
    pub fn translate(&self, pagetable: CapRef, vaddr: VirtAddr) -> Option<usize> {
        let page = vaddr.as_usize() & !(self.page_size - 1);
        self.state
            .lock()
            .tables
            .get(&pagetable)?
            .entries
            .get(&page)
            .map(|pte| pte.frame)
    }

    /// Store one byte through the mapping at `vaddr`
    ///
    /// # Errors
    /// Fails with `FAILED_LOOKUP` when nothing is mapped there and
    /// `INVALID_ARGUMENT` when the mapping is read-only
    pub fn write_byte(&self, pagetable: CapRef, vaddr: VirtAddr, value: u8) -> Result<()> {
        let (page, offset) = self.split(vaddr);
        let mut state = self.state.lock();
        let pte = Self::lookup(&state, pagetable, page, "write_byte")?;
        if !pte.flags.contains(MapFlags::WRITE) {
            return Err(ShmError::Platform {
                op: "write_byte",
                code: INVALID_ARGUMENT,
            });
        }
        state.frames[pte.frame][offset] = value;
        Ok(())
    }

    /// Load one byte through the mapping at `vaddr`
    pub fn read_byte(&self, pagetable: CapRef, vaddr: VirtAddr) -> Result<u8> {
        let (page, offset) = self.split(vaddr);
        let state = self.state.lock();
        let pte = Self::lookup(&state, pagetable, page, "read_byte")?;
        Ok(state.frames[pte.frame][offset])
    }

    fn split(&self, vaddr: VirtAddr) -> (usize, usize) {
        let mask = self.page_size - 1;
        (vaddr.as_usize() & !mask, vaddr.as_usize() & mask)
    }

    fn lookup(state: &MockState, pagetable: CapRef, page: usize, op: &'static str) -> Result<Pte> {
        state
            .tables
            .get(&pagetable)
            .and_then(|table| table.entries.get(&page))
            .copied()
            .ok_or(ShmError::Platform {
                op,
                code: FAILED_LOOKUP,
            })
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform for MockPlatform {
    type Page = MockPage;

    fn broker_pagetable(&self) -> CapRef {
        Self::BROKER_PAGETABLE
    }

    fn acquire_page(&self) -> Result<MockPage> {
        let mut state = self.state.lock();

        if let Some(limit) = state.frame_limit {
            if state.frames.len() >= limit {
                return Err(ShmError::OutOfPages);
            }
        }

        let vaddr = state.heap_next;
        if vaddr + self.page_size > Self::BROKER_HEAP_BASE + Self::BROKER_HEAP_SIZE {
            return Err(ShmError::OutOfPages);
        }

        let frame = state.frames.len();
        state.frames.push(vec![0u8; self.page_size].into_boxed_slice());
        state.heap_next += self.page_size;

        let broker_table = state
            .tables
            .get_mut(&Self::BROKER_PAGETABLE)
            .ok_or(ShmError::Platform {
                op: "acquire_page",
                code: INVALID_CAPABILITY,
            })?;
        broker_table.entries.insert(
            vaddr,
            Pte {
                frame,
                flags: MapFlags::SHARED,
            },
        );

        Ok(MockPage {
            frame,
            vaddr: VirtAddr(vaddr),
        })
    }

    fn reserve_window(&self, pagetable: CapRef, base: VirtAddr, len: usize) -> Result<()> {
        if !base.is_aligned(self.page_size) {
            return Err(ShmError::Platform {
                op: "reserve_window",
                code: ALIGNMENT_ERROR,
            });
        }
        let end = base.checked_add(len).ok_or(ShmError::Platform {
            op: "reserve_window",
            code: RANGE_ERROR,
        })?;

        let mut state = self.state.lock();
        let table = state.tables.get_mut(&pagetable).ok_or(ShmError::Platform {
            op: "reserve_window",
            code: INVALID_CAPABILITY,
        })?;
        table.windows.push((base.as_usize(), end.as_usize()));
        Ok(())
    }

    fn map_page(
        &self,
        target: CapRef,
        vaddr: VirtAddr,
        source: CapRef,
        page: &MockPage,
        flags: MapFlags,
    ) -> Result<()> {
        let fail = |code| ShmError::Platform {
            op: "map_page",
            code,
        };

        let mut state = self.state.lock();

        if state.pending_map_failures > 0 {
            state.pending_map_failures -= 1;
            return Err(fail(NOT_ENOUGH_MEMORY));
        }

        // The source table must actually hold the page being aliased
        let source_frame = state
            .tables
            .get(&source)
            .ok_or(fail(INVALID_CAPABILITY))?
            .entries
            .get(&page.vaddr.as_usize())
            .map(|pte| pte.frame);
        if source_frame != Some(page.frame) {
            return Err(fail(FAILED_LOOKUP));
        }

        if !vaddr.is_aligned(self.page_size) {
            return Err(fail(ALIGNMENT_ERROR));
        }

        let table = state
            .tables
            .get_mut(&target)
            .ok_or(fail(INVALID_CAPABILITY))?;
        if !table.covers(vaddr.as_usize()) {
            return Err(fail(RANGE_ERROR));
        }
        if table.entries.contains_key(&vaddr.as_usize()) {
            return Err(fail(DELETE_FIRST));
        }

        table.entries.insert(
            vaddr.as_usize(),
            Pte {
                frame: page.frame,
                flags,
            },
        );
        Ok(())
    }
}

/// Boot layer stand-in: a fixed set of domains, each with its own page table
pub struct MockBoot {
    caps: Vec<CapRef>,
    init_done: AtomicBool,
}

impl MockBoot {
    /// First capability slot handed out for domain page tables
    pub const PAGETABLE_SLOT_BASE: usize = 0x100;

    /// Create `domain_count` domains (ids `1..=domain_count`) and their page
    /// tables inside `platform`
    pub fn new(platform: &MockPlatform, domain_count: u32) -> Self {
        let caps = (1..=domain_count)
            .map(|id| {
                let cap = CapRef(Self::PAGETABLE_SLOT_BASE + id as usize);
                platform.create_pagetable(cap);
                cap
            })
            .collect();

        Self {
            caps,
            init_done: AtomicBool::new(false),
        }
    }

    /// Page-table capability of `domain`, as the boot layer knows it
    pub fn pagetable_of(&self, domain: DomainId) -> Option<CapRef> {
        let index = (domain.raw() as usize).checked_sub(1)?;
        self.caps.get(index).copied()
    }

    /// Has the broker reported init done?
    pub fn is_init_done(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }
}

impl DomainEnumerator for MockBoot {
    fn domain_count(&self) -> Result<u32> {
        Ok(self.caps.len() as u32)
    }

    fn pagetable_cap(&self, _broker: DomainId, domain: DomainId) -> Result<CapRef> {
        self.pagetable_of(domain)
            .ok_or(ShmError::InvalidDomain { domain })
    }

    fn init_done(&self) {
        self.init_done.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_maps_into_broker() {
        let platform = MockPlatform::new();
        let page = platform.acquire_page().unwrap();

        assert_eq!(page.frame(), 0);
        assert_eq!(page.broker_vaddr(), VirtAddr(MockPlatform::BROKER_HEAP_BASE));
        assert_eq!(
            platform.translate(MockPlatform::BROKER_PAGETABLE, page.broker_vaddr()),
            Some(0)
        );
        assert_eq!(platform.frames_allocated(), 1);
    }

    #[test]
    fn test_frame_limit() {
        let platform = MockPlatform::new().with_frame_limit(1);
        platform.acquire_page().unwrap();
        assert!(matches!(platform.acquire_page(), Err(ShmError::OutOfPages)));
    }

    #[test]
    fn test_map_requires_reserved_window() {
        let platform = MockPlatform::new();
        platform.create_pagetable(CapRef(0x200));
        let page = platform.acquire_page().unwrap();

        let result = platform.map_page(
            CapRef(0x200),
            VirtAddr(0x8000_0000),
            MockPlatform::BROKER_PAGETABLE,
            &page,
            MapFlags::SHARED,
        );
        assert!(matches!(
            result,
            Err(ShmError::Platform { code: RANGE_ERROR, .. })
        ));

        platform
            .reserve_window(CapRef(0x200), VirtAddr(0x8000_0000), 4 * PAGE_SIZE)
            .unwrap();
        platform
            .map_page(
                CapRef(0x200),
                VirtAddr(0x8000_0000),
                MockPlatform::BROKER_PAGETABLE,
                &page,
                MapFlags::SHARED,
            )
            .unwrap();
        assert_eq!(platform.mapping_count(CapRef(0x200)), 1);
    }

    #[test]
    fn test_map_rejects_double_mapping_and_misalignment() {
        let platform = MockPlatform::new();
        platform.create_pagetable(CapRef(0x200));
        platform
            .reserve_window(CapRef(0x200), VirtAddr(0x8000_0000), 4 * PAGE_SIZE)
            .unwrap();
        let page = platform.acquire_page().unwrap();
        let broker = MockPlatform::BROKER_PAGETABLE;

        let result = platform.map_page(CapRef(0x200), VirtAddr(0x8000_0010), broker, &page, MapFlags::SHARED);
        assert!(matches!(
            result,
            Err(ShmError::Platform { code: ALIGNMENT_ERROR, .. })
        ));

        platform
            .map_page(CapRef(0x200), VirtAddr(0x8000_0000), broker, &page, MapFlags::SHARED)
            .unwrap();
        let result = platform.map_page(CapRef(0x200), VirtAddr(0x8000_0000), broker, &page, MapFlags::SHARED);
        assert!(matches!(
            result,
            Err(ShmError::Platform { code: DELETE_FIRST, .. })
        ));
    }

    #[test]
    fn test_aliased_frames_share_bytes() {
        let platform = MockPlatform::new();
        let (a, b) = (CapRef(0x201), CapRef(0x202));
        for cap in [a, b] {
            platform.create_pagetable(cap);
            platform
                .reserve_window(cap, VirtAddr(0x8000_0000), 4 * PAGE_SIZE)
                .unwrap();
        }
        let page = platform.acquire_page().unwrap();
        let broker = MockPlatform::BROKER_PAGETABLE;
        platform
            .map_page(a, VirtAddr(0x8000_0000), broker, &page, MapFlags::SHARED)
            .unwrap();
        platform
            .map_page(b, VirtAddr(0x8000_2000), broker, &page, MapFlags::SHARED)
            .unwrap();

        platform.write_byte(a, VirtAddr(0x8000_0042), 0x5A).unwrap();
        assert_eq!(platform.read_byte(b, VirtAddr(0x8000_2042)).unwrap(), 0x5A);
    }

    #[test]
    fn test_read_only_mapping_rejects_writes() {
        let platform = MockPlatform::new();
        platform.create_pagetable(CapRef(0x200));
        platform
            .reserve_window(CapRef(0x200), VirtAddr(0x8000_0000), PAGE_SIZE)
            .unwrap();
        let page = platform.acquire_page().unwrap();
        platform
            .map_page(
                CapRef(0x200),
                VirtAddr(0x8000_0000),
                MockPlatform::BROKER_PAGETABLE,
                &page,
                MapFlags::READ,
            )
            .unwrap();

        let result = platform.write_byte(CapRef(0x200), VirtAddr(0x8000_0000), 1);
        assert!(matches!(
            result,
            Err(ShmError::Platform { code: INVALID_ARGUMENT, .. })
        ));
        assert_eq!(platform.read_byte(CapRef(0x200), VirtAddr(0x8000_0000)).unwrap(), 0);
    }

    #[test]
    fn test_injected_map_failure() {
        let platform = MockPlatform::new();
        platform.create_pagetable(CapRef(0x200));
        platform
            .reserve_window(CapRef(0x200), VirtAddr(0x8000_0000), PAGE_SIZE)
            .unwrap();
        let page = platform.acquire_page().unwrap();
        platform.fail_next_maps(1);

        let broker = MockPlatform::BROKER_PAGETABLE;
        assert!(platform
            .map_page(CapRef(0x200), VirtAddr(0x8000_0000), broker, &page, MapFlags::SHARED)
            .is_err());
        assert!(platform
            .map_page(CapRef(0x200), VirtAddr(0x8000_0000), broker, &page, MapFlags::SHARED)
            .is_ok());
    }

    #[test]
    fn test_mock_boot_domains() {
        let platform = MockPlatform::new();
        let boot = MockBoot::new(&platform, 3);

        assert_eq!(boot.domain_count().unwrap(), 3);
        assert_eq!(boot.pagetable_of(DomainId(2)), Some(CapRef(0x102)));
        assert_eq!(boot.pagetable_of(DomainId(0)), None);
        assert!(boot.pagetable_cap(DomainId(1), DomainId(4)).is_err());

        assert!(!boot.is_init_done());
        boot.init_done();
        assert!(boot.is_init_done());
    }
}
