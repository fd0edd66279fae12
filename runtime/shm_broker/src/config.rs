//! Broker configuration
//!
//! Fixed parameters of the shared-memory window every client domain gets,
//! and the capacity of the broker's region table.

use crate::{Result, ShmError, VirtAddr};
use static_assertions::const_assert;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Base of the shared-memory window in every client domain
pub const SHM_BASE_ADDR: usize = 0x8000_0000;

/// Capacity of the global region table
pub const SHM_MAX_REGIONS: usize = 1024;

/// Upper bound on domain identifiers (exclusive)
pub const MAX_DOMAINS: u32 = 64;

/// Domain identifier the boot layer assigns to the broker itself
pub const BROKER_DOMAIN: u32 = 1;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(SHM_BASE_ADDR % PAGE_SIZE == 0);
const_assert!(SHM_MAX_REGIONS <= u32::MAX as usize);

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct BrokerConfig {
    /// Mapping granularity in bytes (power of two)
    pub page_size: usize,

    /// First address of each domain's shared window
    pub window_base: usize,

    /// Number of pages in each domain's shared window
    pub window_pages: usize,

    /// Maximum number of regions the broker hands out
    pub max_regions: usize,

    /// Domain identifiers must be below this bound
    pub max_domains: u32,

    /// Identifier of the broker's own domain (never registered as a client)
    pub broker_domain: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            window_base: SHM_BASE_ADDR,
            window_pages: SHM_MAX_REGIONS,
            max_regions: SHM_MAX_REGIONS,
            max_domains: MAX_DOMAINS,
            broker_domain: BROKER_DOMAIN,
        }
    }
}

impl BrokerConfig {
    /// Check the configuration for values the broker cannot work with
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first offending field
    pub fn validate(&self) -> Result<()> {
        // Resolved addresses travel as page numbers; a page of at least two
        // bytes keeps every page number within isize
        if self.page_size < 2 || !self.page_size.is_power_of_two() {
            return Err(ShmError::InvalidConfig(
                "page_size must be a power of two of at least 2",
            ));
        }
        if self.window_base == 0 || self.window_base % self.page_size != 0 {
            return Err(ShmError::InvalidConfig(
                "window_base must be non-zero and page aligned",
            ));
        }
        if self.window_pages == 0 {
            return Err(ShmError::InvalidConfig("window_pages must be non-zero"));
        }
        if self.max_regions == 0
            || self.max_regions > u32::MAX as usize
            || self.max_regions > isize::MAX as usize
        {
            return Err(ShmError::InvalidConfig("max_regions out of range"));
        }
        if self.broker_domain == 0 || self.broker_domain >= self.max_domains {
            return Err(ShmError::InvalidConfig(
                "broker_domain must be in 1..max_domains",
            ));
        }
        if self.window_end().is_none() {
            return Err(ShmError::InvalidConfig(
                "shared window overflows the address space",
            ));
        }
        Ok(())
    }

    /// Size of the shared window in bytes
    pub fn window_len(&self) -> usize {
        self.window_pages.saturating_mul(self.page_size)
    }

    /// First address of the shared window
    pub fn window_start(&self) -> VirtAddr {
        VirtAddr(self.window_base)
    }

    /// One past the last address of the shared window
    pub fn window_end(&self) -> Option<VirtAddr> {
        self.window_pages
            .checked_mul(self.page_size)
            .and_then(|len| self.window_base.checked_add(len))
            .map(VirtAddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_len(), SHM_MAX_REGIONS * PAGE_SIZE);
        assert_eq!(config.window_start(), VirtAddr(0x8000_0000));
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let config = BrokerConfig {
            page_size: 3000,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ShmError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_single_byte_pages() {
        let config = BrokerConfig {
            page_size: 1,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ShmError::InvalidConfig(_))));
    }

    #[test]
    fn test_accepts_upper_half_window() {
        let config = BrokerConfig {
            window_base: isize::MAX as usize + 1,
            window_pages: 4,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unaligned_base() {
        let config = BrokerConfig {
            window_base: 0x8000_0010,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ShmError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_window_overflow() {
        let config = BrokerConfig {
            window_base: usize::MAX & !(PAGE_SIZE - 1),
            window_pages: 2,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ShmError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_broker_domain_out_of_range() {
        let config = BrokerConfig {
            broker_domain: MAX_DOMAINS,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ShmError::InvalidConfig(_))));
    }
}
