//! Shared-page Broker - cross-domain shared memory for KaaL components
//!
//! # Purpose
//! Lets mutually isolated components share physical pages without either one
//! seeing the other's page tables. The broker owns the pages and holds a
//! page-table capability for every client domain; clients only ever see
//! region handles and addresses in their own shared window.
//!
//! # Integration Points
//! - Depends on: page allocator and page-table aliasing primitives
//!   ([`MemoryPlatform`]), boot-time domain enumeration ([`DomainEnumerator`])
//! - Provides to: every component that wants shared memory
//! - IPC endpoints: synchronous request/response ([`service`], `std` only)
//! - Capabilities required: page-table capability of each client domain
//!
//! # Architecture
//! ```text
//!  domain A            domain B
//!  BrokerClient        BrokerClient
//!       │ allocate()        │ attach(h)
//!       ▼                   ▼
//!  ┌──────────────────────────────────┐
//!  │ BrokerServer (dispatch)          │
//!  │ RegionBroker                     │
//!  │  ├─ region table  h -> page      │
//!  │  └─ DomainRegistry               │
//!  │       domain -> frontier,        │
//!  │                 h -> vaddr       │
//!  └───────────────┬──────────────────┘
//!                  │ map_page(target pt, vaddr, page)
//!                  ▼
//!            MemoryPlatform
//! ```
//!
//! A region is one page. Domain A allocates it and gets handle `h`; domain B
//! learns `h` out of band and attaches it; both now alias the same frame at
//! addresses in their own windows.
//!
//! # Testing Strategy
//! - Unit tests: registry bookkeeping, broker operations, call service
//! - Integration tests: end-to-end scenarios on the hosted [`mock`] platform
//! - Hardware sim tests: N/A (kernel integration)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(all(feature = "std", not(test)))]
extern crate std;

extern crate alloc;

mod bootstrap;
mod broker;
mod config;
mod platform;
mod registry;
mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "std")]
pub mod service;

pub use bootstrap::BootstrapRegistrar;
pub use broker::RegionBroker;
pub use config::{BrokerConfig, BROKER_DOMAIN, MAX_DOMAINS, PAGE_SIZE, SHM_BASE_ADDR, SHM_MAX_REGIONS};
pub use platform::{DomainEnumerator, MemoryPlatform};
pub use registry::{DomainEntry, DomainRegistry};
pub use types::{CapRef, DomainId, Handle, MapFlags, VirtAddr};

use thiserror::Error;

/// Error types for shared memory operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShmError {
    #[error("Invalid domain {domain}")]
    InvalidDomain { domain: DomainId },

    #[error("Domain {domain} already registered")]
    DuplicateDomain { domain: DomainId },

    #[error("Null page-table capability for {domain}")]
    InvalidCapability { domain: DomainId },

    #[error("Unknown region handle {handle}")]
    UnknownHandle { handle: Handle },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Region table full ({capacity} regions)")]
    RegionTableFull { capacity: usize },

    #[error("Shared window of {domain} is full")]
    DomainWindowFull { domain: DomainId },

    #[error("Out of physical pages")]
    OutOfPages,

    #[error("Regions of {pages} pages are not supported")]
    Unsupported { pages: usize },

    #[error("{operation} is not implemented")]
    NotImplemented { operation: &'static str },

    #[error("{what} overflow")]
    Overflow { what: &'static str },

    #[error("Platform error in {op}: {code}")]
    Platform { op: &'static str, code: i32 },

    #[error("Broker unavailable")]
    BrokerUnavailable,

    #[error("Reply does not match request")]
    UnexpectedReply,
}

/// Broad classes of [`ShmError`], for callers that branch on recoverability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input from the caller; retrying the same call cannot succeed
    Precondition,
    /// A table or window ran out of room
    Capacity,
    /// The operation exists in the interface but not in the broker
    Unimplemented,
    /// Lower layer failure or broken internal invariant
    Internal,
}

impl ShmError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShmError::InvalidDomain { .. }
            | ShmError::DuplicateDomain { .. }
            | ShmError::InvalidCapability { .. }
            | ShmError::UnknownHandle { .. }
            | ShmError::InvalidConfig(_) => ErrorKind::Precondition,
            ShmError::RegionTableFull { .. }
            | ShmError::DomainWindowFull { .. }
            | ShmError::OutOfPages => ErrorKind::Capacity,
            ShmError::Unsupported { .. } | ShmError::NotImplemented { .. } => {
                ErrorKind::Unimplemented
            }
            ShmError::Overflow { .. }
            | ShmError::Platform { .. }
            | ShmError::BrokerUnavailable
            | ShmError::UnexpectedReply => ErrorKind::Internal,
        }
    }

    /// Negative status word reported to callers of the call ABI
    pub fn code(&self) -> isize {
        match self {
            ShmError::InvalidDomain { .. } => -1,
            ShmError::DuplicateDomain { .. } => -2,
            ShmError::InvalidCapability { .. } => -3,
            ShmError::UnknownHandle { .. } => -4,
            ShmError::InvalidConfig(_) => -5,
            ShmError::RegionTableFull { .. } => -6,
            ShmError::DomainWindowFull { .. } => -7,
            ShmError::OutOfPages => -8,
            ShmError::Unsupported { .. } => -9,
            ShmError::NotImplemented { .. } => -10,
            ShmError::Overflow { .. } => -11,
            ShmError::Platform { .. } => -12,
            ShmError::BrokerUnavailable => -13,
            ShmError::UnexpectedReply => -14,
        }
    }
}

pub type Result<T> = core::result::Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ShmError::UnknownHandle { handle: Handle(3) }.kind(),
            ErrorKind::Precondition
        );
        assert_eq!(ShmError::RegionTableFull { capacity: 8 }.kind(), ErrorKind::Capacity);
        assert_eq!(
            ShmError::DomainWindowFull { domain: DomainId(2) }.kind(),
            ErrorKind::Capacity
        );
        assert_eq!(ShmError::Unsupported { pages: 2 }.kind(), ErrorKind::Unimplemented);
        assert_eq!(
            ShmError::NotImplemented { operation: "release" }.kind(),
            ErrorKind::Unimplemented
        );
        assert_eq!(ShmError::Overflow { what: "handle" }.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_codes_are_negative_and_distinct() {
        let errors = [
            ShmError::InvalidDomain { domain: DomainId(1) },
            ShmError::DuplicateDomain { domain: DomainId(1) },
            ShmError::InvalidCapability { domain: DomainId(1) },
            ShmError::UnknownHandle { handle: Handle(0) },
            ShmError::InvalidConfig("x"),
            ShmError::RegionTableFull { capacity: 1 },
            ShmError::DomainWindowFull { domain: DomainId(1) },
            ShmError::OutOfPages,
            ShmError::Unsupported { pages: 2 },
            ShmError::NotImplemented { operation: "release" },
            ShmError::Overflow { what: "frontier" },
            ShmError::Platform { op: "map_page", code: 2 },
            ShmError::BrokerUnavailable,
            ShmError::UnexpectedReply,
        ];

        let mut codes: std::vec::Vec<isize> = errors.iter().map(ShmError::code).collect();
        assert!(codes.iter().all(|&code| code < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_error_display() {
        let err = ShmError::UnknownHandle { handle: Handle(7) };
        assert_eq!(format!("{}", err), "Unknown region handle 7");

        let err = ShmError::InvalidDomain { domain: DomainId(9) };
        assert_eq!(format!("{}", err), "Invalid domain domain#9");
    }
}
