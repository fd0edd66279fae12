//! Bootstrap Registrar - populate the domain registry at system start
//!
//! Runs once in the broker's domain, before any client traffic:
//! 1. Ask the boot layer how many domains exist
//! 2. Obtain a page-table capability for every domain except our own
//! 3. Register each one with the broker
//! 4. Report init done to the boot layer

use crate::{DomainEnumerator, DomainId, MemoryPlatform, RegionBroker, Result, ShmError};

/// Registers every domain the boot layer knows about with a broker
pub struct BootstrapRegistrar<'a, E: DomainEnumerator> {
    enumerator: &'a E,
}

impl<'a, E: DomainEnumerator> BootstrapRegistrar<'a, E> {
    /// Create a registrar backed by `enumerator`
    pub fn new(enumerator: &'a E) -> Self {
        Self { enumerator }
    }

    /// Transfer all page-table capabilities to `broker`
    ///
    /// # Returns
    /// Number of client domains registered
    ///
    /// # Errors
    /// Fails on the first domain that cannot be registered; domains handled
    /// before it stay registered. `init_done` is only signalled on success.
    pub fn register_all<P: MemoryPlatform>(&self, broker: &RegionBroker<P>) -> Result<usize> {
        let me = broker.domain();
        let count = self.enumerator.domain_count()?;
        if count == 0 {
            return Err(ShmError::InvalidConfig("boot layer reports no domains"));
        }

        log::info!("transferring {} page tables to {}", count.saturating_sub(1), me);

        let mut registered = 0;
        for id in 1..=count {
            let domain = DomainId(id);
            // Already have our own page table
            if domain == me {
                continue;
            }

            let cap = self.enumerator.pagetable_cap(me, domain)?;
            broker.register_domain(domain, cap)?;
            registered += 1;
        }

        log::info!("done transferring page tables ({} domains)", registered);
        self.enumerator.init_done();
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBoot, MockPlatform};
    use crate::{BrokerConfig, CapRef};

    struct NullCaps;

    impl DomainEnumerator for NullCaps {
        fn domain_count(&self) -> Result<u32> {
            Ok(3)
        }

        fn pagetable_cap(&self, _broker: DomainId, _domain: DomainId) -> Result<CapRef> {
            Ok(CapRef::NULL)
        }
    }

    #[test]
    fn test_registers_all_but_broker() {
        let platform = MockPlatform::new();
        let boot = MockBoot::new(&platform, 4);
        let broker = RegionBroker::new(platform, BrokerConfig::default()).unwrap();

        let registered = BootstrapRegistrar::new(&boot).register_all(&broker).unwrap();
        assert_eq!(registered, 3);
        assert_eq!(broker.domain_count(), 3);
        assert!(boot.is_init_done());

        // Broker's own domain is not a client
        assert!(broker.allocate(DomainId(1), 1).is_err());
        assert!(broker.allocate(DomainId(4), 1).is_ok());
    }

    #[test]
    fn test_second_run_reports_duplicates() {
        let platform = MockPlatform::new();
        let boot = MockBoot::new(&platform, 2);
        let broker = RegionBroker::new(platform, BrokerConfig::default()).unwrap();
        let registrar = BootstrapRegistrar::new(&boot);

        registrar.register_all(&broker).unwrap();
        assert!(matches!(
            registrar.register_all(&broker),
            Err(ShmError::DuplicateDomain { .. })
        ));
    }

    #[test]
    fn test_null_capability_aborts_bootstrap() {
        let broker = RegionBroker::new(MockPlatform::new(), BrokerConfig::default()).unwrap();

        let result = BootstrapRegistrar::new(&NullCaps).register_all(&broker);
        assert!(matches!(result, Err(ShmError::InvalidCapability { .. })));
        assert_eq!(broker.domain_count(), 0);
    }

    #[test]
    fn test_broker_only_system() {
        let platform = MockPlatform::new();
        let boot = MockBoot::new(&platform, 1);
        let broker = RegionBroker::new(platform, BrokerConfig::default()).unwrap();

        assert_eq!(BootstrapRegistrar::new(&boot).register_all(&broker).unwrap(), 0);
        assert!(boot.is_init_done());
    }
}
