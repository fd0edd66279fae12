//! Execute a system description on the hosted platform
//!
//! Boots the broker the same way the real system does (bootstrap registration,
//! then a call server), then replays the `[[step]]` list through per-domain
//! clients and checks every expectation.

use crate::system::{Step, SystemSpec};
use anyhow::{anyhow, Context};
use shm_broker::mock::{MockBoot, MockPlatform};
use shm_broker::service::{self, BrokerClient, Endpoint};
use shm_broker::{BootstrapRegistrar, DomainId, Handle, RegionBroker, ShmError, VirtAddr};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub step: String,
    pub passed: bool,
    pub detail: String,
}

/// Everything a run produced
#[derive(Debug)]
pub struct Report {
    pub outcomes: Vec<Outcome>,
    pub registered: usize,
    pub calls_served: usize,
    pub regions: usize,
}

impl Report {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed).count()
    }

    pub fn succeeded(&self) -> bool {
        self.failures() == 0
    }
}

/// Name of the error variant, as written in `expect = "..."`
pub fn error_name(err: &ShmError) -> &'static str {
    match err {
        ShmError::InvalidDomain { .. } => "InvalidDomain",
        ShmError::DuplicateDomain { .. } => "DuplicateDomain",
        ShmError::InvalidCapability { .. } => "InvalidCapability",
        ShmError::UnknownHandle { .. } => "UnknownHandle",
        ShmError::InvalidConfig(_) => "InvalidConfig",
        ShmError::RegionTableFull { .. } => "RegionTableFull",
        ShmError::DomainWindowFull { .. } => "DomainWindowFull",
        ShmError::OutOfPages => "OutOfPages",
        ShmError::Unsupported { .. } => "Unsupported",
        ShmError::NotImplemented { .. } => "NotImplemented",
        ShmError::Overflow { .. } => "Overflow",
        ShmError::Platform { .. } => "Platform",
        ShmError::BrokerUnavailable => "BrokerUnavailable",
        ShmError::UnexpectedReply => "UnexpectedReply",
    }
}

/// Compare a call result against the expected outcome name
fn expectation<T>(expect: &str, result: &Result<T, ShmError>) -> Result<(), String> {
    match result {
        Ok(_) if expect.eq_ignore_ascii_case("ok") => Ok(()),
        Ok(_) => Err(format!("expected {}, call succeeded", expect)),
        Err(err) if error_name(err) == expect => Ok(()),
        Err(err) => Err(format!("expected {}, got {} ({})", expect, error_name(err), err)),
    }
}

struct Runner {
    broker: Arc<RegionBroker<MockPlatform>>,
    boot: MockBoot,
    endpoint: Endpoint,
    clients: BTreeMap<u32, BrokerClient>,
}

impl Runner {
    fn client(&mut self, domain: u32) -> &BrokerClient {
        let endpoint = &self.endpoint;
        self.clients
            .entry(domain)
            .or_insert_with(|| endpoint.client(DomainId(domain)))
    }

    /// Address of byte `offset` of `handle` as `domain` sees it
    fn locate(&mut self, domain: u32, handle: u32, offset: usize) -> Result<VirtAddr, String> {
        let base = self
            .client(domain)
            .resolve(Handle(handle))
            .map_err(|err| format!("resolve failed: {}", err))?;
        base.checked_add(offset)
            .ok_or_else(|| format!("offset {:#x} overflows", offset))
    }

    fn pagetable(&self, domain: u32) -> Result<shm_broker::CapRef, String> {
        self.boot
            .pagetable_of(DomainId(domain))
            .ok_or_else(|| format!("domain {} does not exist", domain))
    }

    fn execute(&mut self, step: &Step) -> Result<String, String> {
        match step {
            Step::Allocate {
                domain,
                pages,
                expect_handle,
                expect,
            } => {
                let result = self.client(*domain).allocate(*pages);
                expectation(expect, &result)?;
                match (result, expect_handle) {
                    (Ok(handle), Some(want)) if handle.0 != *want => {
                        Err(format!("expected handle {}, got {}", want, handle))
                    }
                    (Ok(handle), _) => Ok(format!("handle {}", handle)),
                    (Err(err), _) => Ok(err.to_string()),
                }
            }
            Step::Attach {
                domain,
                handle,
                expect,
            } => {
                let result = self.client(*domain).attach(Handle(*handle));
                expectation(expect, &result)?;
                Ok(result.map_or_else(|err| err.to_string(), |()| "attached".to_string()))
            }
            Step::Resolve {
                domain,
                handle,
                expect_vaddr,
                expect,
            } => {
                let result = self.client(*domain).resolve(Handle(*handle));
                expectation(expect, &result)?;
                match (result, expect_vaddr) {
                    (Ok(vaddr), Some(want)) if vaddr.as_usize() != *want => {
                        Err(format!("expected {:#x}, got {}", want, vaddr))
                    }
                    (Ok(vaddr), _) => Ok(format!("at {}", vaddr)),
                    (Err(err), _) => Ok(err.to_string()),
                }
            }
            Step::Release {
                domain,
                handle,
                expect,
            } => {
                let result = self.client(*domain).release(Handle(*handle));
                expectation(expect, &result)?;
                Ok(result.map_or_else(|err| err.to_string(), |()| "released".to_string()))
            }
            Step::Write {
                domain,
                handle,
                offset,
                value,
            } => {
                let vaddr = self.locate(*domain, *handle, *offset)?;
                let pagetable = self.pagetable(*domain)?;
                self.broker
                    .platform()
                    .write_byte(pagetable, vaddr, *value)
                    .map_err(|err| err.to_string())?;
                Ok(format!("wrote {:#04x} at {}", value, vaddr))
            }
            Step::Read {
                domain,
                handle,
                offset,
                expect_value,
            } => {
                let vaddr = self.locate(*domain, *handle, *offset)?;
                let pagetable = self.pagetable(*domain)?;
                let value = self
                    .broker
                    .platform()
                    .read_byte(pagetable, vaddr)
                    .map_err(|err| err.to_string())?;
                match expect_value {
                    Some(want) if *want != value => {
                        Err(format!("expected {:#04x}, read {:#04x}", want, value))
                    }
                    _ => Ok(format!("read {:#04x} at {}", value, vaddr)),
                }
            }
        }
    }
}

/// Boot the described system and replay its steps
///
/// # Errors
/// Fails if the system cannot boot; step failures are reported in the
/// returned [`Report`] instead.
pub fn run(spec: &SystemSpec) -> anyhow::Result<Report> {
    let platform = MockPlatform::with_page_size(spec.broker.page_size);
    let boot = MockBoot::new(&platform, spec.boot.domains);
    let broker = RegionBroker::new(platform, spec.broker.clone())
        .context("broker rejected configuration")?;

    for (key, value) in &spec.boot.args {
        log::info!("boot arg {} = {}", key, value);
    }

    let registered = BootstrapRegistrar::new(&boot)
        .register_all(&broker)
        .context("bootstrap registration failed")?;

    let broker = Arc::new(broker);
    let (server, endpoint) = service::endpoint(broker.clone());
    let server = server.spawn();

    let mut runner = Runner {
        broker: broker.clone(),
        boot,
        endpoint,
        clients: BTreeMap::new(),
    };

    let mut outcomes = Vec::with_capacity(spec.steps.len());
    for step in &spec.steps {
        let result = runner.execute(step);
        if let Err(reason) = &result {
            log::warn!("{}: {}", step.describe(), reason);
        }
        outcomes.push(match result {
            Ok(detail) => Outcome {
                step: step.describe(),
                passed: true,
                detail,
            },
            Err(detail) => Outcome {
                step: step.describe(),
                passed: false,
                detail,
            },
        });
    }

    for client in spec.client_domains() {
        broker.log_regions(DomainId(client));
    }

    // Last sender gone: the server drains and stops
    drop(runner);
    let calls_served = server
        .join()
        .map_err(|_| anyhow!("broker server thread panicked"))?;

    Ok(Report {
        outcomes,
        registered,
        calls_served,
        regions: broker.region_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::TEMPLATE;

    #[test]
    fn test_template_runs_clean() {
        let spec = SystemSpec::parse(TEMPLATE).unwrap();
        let report = run(&spec).unwrap();

        for outcome in &report.outcomes {
            assert!(outcome.passed, "{}: {}", outcome.step, outcome.detail);
        }
        assert!(report.succeeded());
        assert_eq!(report.registered, 2);
        // Every step is one call; write and read each resolve once
        assert_eq!(report.calls_served, 8);
        assert_eq!(report.regions, 2);
    }

    #[test]
    fn test_wrong_expectation_is_reported() {
        let text = r#"
[boot]
domains = 3

[[step]]
op = "allocate"
domain = 2

[[step]]
op = "resolve"
domain = 3
handle = 0

[[step]]
op = "attach"
domain = 3
handle = 0

[[step]]
op = "read"
domain = 3
handle = 0
expect_value = 1
"#;
        let spec = SystemSpec::parse(text).unwrap();
        let report = run(&spec).unwrap();

        let passed: Vec<bool> = report.outcomes.iter().map(|o| o.passed).collect();
        assert_eq!(passed, vec![true, false, true, false]);
        assert_eq!(report.failures(), 2);
        assert!(report.outcomes[1].detail.contains("UnknownHandle"));
    }

    #[test]
    fn test_expected_handle_and_address() {
        let text = r#"
[broker]
window_base = 0x10000000

[boot]
domains = 2

[[step]]
op = "allocate"
domain = 2
expect_handle = 0

[[step]]
op = "resolve"
domain = 2
handle = 0
expect_vaddr = 0x10000000

[[step]]
op = "allocate"
domain = 2
expect_handle = 0
"#;
        let spec = SystemSpec::parse(text).unwrap();
        let report = run(&spec).unwrap();

        assert!(report.outcomes[0].passed);
        assert!(report.outcomes[1].passed);
        assert!(!report.outcomes[2].passed);
        assert_eq!(report.outcomes[2].detail, "expected handle 0, got 1");
    }

    #[test]
    fn test_broker_domain_as_client() {
        let text = r#"
[boot]
domains = 2

[[step]]
op = "allocate"
domain = 1
expect = "InvalidDomain"
"#;
        let report = run(&SystemSpec::parse(text).unwrap()).unwrap();
        assert!(report.succeeded());
        assert_eq!(report.regions, 0);
    }

    #[test]
    fn test_error_names() {
        assert_eq!(error_name(&ShmError::OutOfPages), "OutOfPages");
        assert_eq!(
            error_name(&ShmError::NotImplemented { operation: "release" }),
            "NotImplemented"
        );
    }
}
