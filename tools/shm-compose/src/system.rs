//! System description files
//!
//! A system description is a TOML document with three parts:
//! - `[broker]`: broker parameters (any field may be omitted)
//! - `[boot]`: how many domains exist, plus free-form boot arguments
//! - `[[step]]`: scripted client calls, executed in order

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shm_broker::BrokerConfig;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Template written by `shm-compose new`
pub const TEMPLATE: &str = include_str!("../templates/system.toml");

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SystemSpec {
    #[serde(default)]
    pub broker: BrokerConfig,

    pub boot: BootSpec,

    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BootSpec {
    /// Number of domains, the broker's own included
    pub domains: u32,

    /// Key/value pairs handed to the broker at boot
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// One scripted call
///
/// `expect` names the outcome: `"ok"` (the default) or an error variant
/// such as `"UnknownHandle"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "lowercase", deny_unknown_fields)]
pub enum Step {
    Allocate {
        domain: u32,
        #[serde(default = "one_page")]
        pages: usize,
        expect_handle: Option<u32>,
        #[serde(default = "ok")]
        expect: String,
    },
    Attach {
        domain: u32,
        handle: u32,
        #[serde(default = "ok")]
        expect: String,
    },
    Resolve {
        domain: u32,
        handle: u32,
        expect_vaddr: Option<usize>,
        #[serde(default = "ok")]
        expect: String,
    },
    Release {
        domain: u32,
        handle: u32,
        #[serde(default = "ok")]
        expect: String,
    },
    /// Store a byte through the domain's mapping of `handle`
    Write {
        domain: u32,
        handle: u32,
        #[serde(default)]
        offset: usize,
        value: u8,
    },
    /// Load a byte through the domain's mapping of `handle`
    Read {
        domain: u32,
        handle: u32,
        #[serde(default)]
        offset: usize,
        expect_value: Option<u8>,
    },
}

fn one_page() -> usize {
    1
}

fn ok() -> String {
    "ok".to_string()
}

impl Step {
    /// Domain issuing the call
    pub fn domain(&self) -> u32 {
        match self {
            Step::Allocate { domain, .. }
            | Step::Attach { domain, .. }
            | Step::Resolve { domain, .. }
            | Step::Release { domain, .. }
            | Step::Write { domain, .. }
            | Step::Read { domain, .. } => *domain,
        }
    }

    /// One-line description for reports
    pub fn describe(&self) -> String {
        match self {
            Step::Allocate { domain, pages, .. } => format!("domain {} allocate({})", domain, pages),
            Step::Attach { domain, handle, .. } => format!("domain {} attach({})", domain, handle),
            Step::Resolve { domain, handle, .. } => format!("domain {} resolve({})", domain, handle),
            Step::Release { domain, handle, .. } => format!("domain {} release({})", domain, handle),
            Step::Write {
                domain,
                handle,
                offset,
                value,
            } => format!("domain {} write region {}+{:#x} = {:#04x}", domain, handle, offset, value),
            Step::Read {
                domain,
                handle,
                offset,
                ..
            } => format!("domain {} read region {}+{:#x}", domain, handle, offset),
        }
    }
}

impl SystemSpec {
    /// Parse a system description from TOML text
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let spec: SystemSpec = toml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read and parse a system description file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid system description {}", path.display()))
    }

    /// Check the description is internally consistent
    pub fn validate(&self) -> anyhow::Result<()> {
        self.broker.validate()?;

        if self.boot.domains == 0 || self.boot.domains >= self.broker.max_domains {
            anyhow::bail!(
                "boot.domains must be in 1..{} (got {})",
                self.broker.max_domains,
                self.boot.domains
            );
        }
        if self.broker.broker_domain > self.boot.domains {
            anyhow::bail!(
                "broker_domain {} does not exist with {} domains",
                self.broker.broker_domain,
                self.boot.domains
            );
        }

        for (index, step) in self.steps.iter().enumerate() {
            if let Step::Write { offset, .. } | Step::Read { offset, .. } = step {
                if *offset >= self.broker.page_size {
                    anyhow::bail!("step {}: offset {:#x} is outside the page", index + 1, offset);
                }
            }
        }
        Ok(())
    }

    /// Client domains, in registration order
    pub fn client_domains(&self) -> impl Iterator<Item = u32> + '_ {
        (1..=self.boot.domains).filter(move |&id| id != self.broker.broker_domain)
    }
}
