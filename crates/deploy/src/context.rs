//! Explicit per-run context passed into every engine operation.

use std::collections::BTreeMap;

use alloy_core::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// Whether a run starts from an empty registry or resumes an existing one.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunMode {
    /// Clear the registry and create every component.
    #[default]
    Fresh,
    /// Reuse recorded components and only create what is missing.
    Incremental,
}

/// Policy switches for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Always strip the deployer's capabilities at the end of the run.
    pub secure: bool,
    /// Treat audit findings as a failed run.
    pub strict: bool,
    /// Allow replacing stale records and adopting external components.
    pub reuse: bool,
    /// Emit a verification manifest on success.
    pub verify: bool,
}

/// The network name doubles as a file name, so it is restricted to a safe alphabet.
pub fn validate_network(network: &str) -> Result<()> {
    if network.is_empty() {
        return Err(DeployError::InvalidContext("network name is empty".into()));
    }
    if !network
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DeployError::InvalidContext(format!(
            "network name `{network}` may only contain letters, digits, `-` and `_`"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub network: String,
    pub mode: RunMode,
    pub policy: Policy,
    /// Credential that sends every transaction of the run.
    pub deployer: Address,
    /// Long-term administrative holder of the protocol roles.
    pub admin: Address,
    /// Components that already exist on the network, adoptable under `reuse`.
    pub external: BTreeMap<String, Address>,
    pub config_hash: Option<String>,
    /// Deployer balance when the run started, filled in by the orchestrator.
    pub start_balance: U256,
}

impl RunContext {
    pub fn new(network: impl Into<String>, deployer: Address, admin: Address) -> Self {
        Self {
            network: network.into(),
            mode: RunMode::default(),
            policy: Policy::default(),
            deployer,
            admin,
            external: BTreeMap::new(),
            config_hash: None,
            start_balance: U256::ZERO,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_external(mut self, name: impl Into<String>, address: Address) -> Self {
        self.external.insert(name.into(), address);
        self
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.mode == RunMode::Incremental
    }

    pub fn validate(&self) -> Result<()> {
        validate_network(&self.network)?;
        if self.deployer.is_zero() {
            return Err(DeployError::InvalidContext("deployer address is zero".into()));
        }
        if self.admin.is_zero() {
            return Err(DeployError::InvalidContext("admin address is zero".into()));
        }
        if self.admin == self.deployer {
            return Err(DeployError::InvalidContext(
                "admin must differ from the deployer, or renouncing would lock the protocol"
                    .into(),
            ));
        }
        for (name, address) in &self.external {
            if address.is_zero() {
                return Err(DeployError::InvalidContext(format!(
                    "external component `{name}` has a zero address"
                )));
            }
        }
        Ok(())
    }
}
