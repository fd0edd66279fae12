//! Identifier and address types shared by the registry, the broker and the
//! call service.

use bitflags::bitflags;
use core::fmt;

/// Protection domain (component) identifier
///
/// Domain 0 is never a valid client; the boot layer numbers components from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

impl DomainId {
    /// Raw identifier value
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

/// Global region handle
///
/// Handles are dense: the n-th successful allocation gets handle n, and the
/// handle doubles as the index into the broker's region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

impl Handle {
    /// Index of this handle in the region table
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Handle for a region table index, if it fits the handle space
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok().map(Handle)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual address inside some domain's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Raw address value
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Address `bytes` further on, or `None` on overflow
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(VirtAddr)
    }

    /// Is the address a multiple of `align` (a power of two)?
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Capability slot referring to a page-table root
///
/// Slot 0 is the null capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapRef(pub usize);

impl CapRef {
    /// The null capability
    pub const NULL: CapRef = CapRef(0);

    /// Is this the null capability?
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

bitflags! {
    /// Access rights for a page aliased into a domain
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHEABLE = 1 << 2;
    }
}

impl MapFlags {
    /// Rights granted on every shared page: read/write, write-back cached
    pub const SHARED: MapFlags = MapFlags::READ
        .union(MapFlags::WRITE)
        .union(MapFlags::CACHEABLE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_index_round_trip() {
        let handle = Handle::from_index(7).unwrap();
        assert_eq!(handle, Handle(7));
        assert_eq!(handle.index(), 7);
    }

    #[test]
    fn test_vaddr_arithmetic() {
        let base = VirtAddr(0x8000_0000);
        assert_eq!(base.checked_add(4096), Some(VirtAddr(0x8000_1000)));
        assert_eq!(VirtAddr(usize::MAX).checked_add(1), None);
        assert!(base.is_aligned(4096));
        assert!(!VirtAddr(0x8000_0001).is_aligned(4096));
    }

    #[test]
    fn test_null_capability() {
        assert!(CapRef::NULL.is_null());
        assert!(!CapRef(12).is_null());
    }

    #[test]
    fn test_shared_flags() {
        assert!(MapFlags::SHARED.contains(MapFlags::READ | MapFlags::WRITE));
        assert!(MapFlags::SHARED.contains(MapFlags::CACHEABLE));
    }
}
