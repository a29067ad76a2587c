//! Deployment configuration (`Lockstep.toml`) and its deployment hash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_core::primitives::{Address, address};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::{Policy, RunContext, RunMode};
use crate::steps::standard::PlanOptions;

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "Lockstep.toml";

/// First pre-funded account of a default Anvil or Hardhat node.
pub const DEFAULT_DEPLOYER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
/// Second pre-funded account of a default Anvil or Hardhat node.
pub const DEFAULT_ADMIN: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_NETWORK: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Network name; also the registry file name.
    pub network: String,
    pub rpc_url: String,
    /// Unlocked account sending every transaction.
    pub deployer: Address,
    /// Holder that keeps the administrative roles after the deployer renounces.
    pub admin: Address,
    pub registry_dir: PathBuf,
    /// Directory of `<Kind>.json` compilation artifacts.
    pub artifacts_dir: PathBuf,
    pub receipt_timeout_secs: u64,
    pub finalize_retry_delay_ms: u64,
    /// Already-deployed components that may be adopted under `--reuse`.
    pub external: BTreeMap<String, Address>,
    pub plan: PlanOptions,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            deployer: DEFAULT_DEPLOYER,
            admin: DEFAULT_ADMIN,
            registry_dir: PathBuf::from("deployments"),
            artifacts_dir: PathBuf::from("artifacts"),
            receipt_timeout_secs: 120,
            finalize_retry_delay_ms: 2000,
            external: BTreeMap::new(),
            plan: PlanOptions::default(),
        }
    }
}

impl DeployConfig {
    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deploy config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file, or from `Lockstep.toml` inside a directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file or directory not found: {}",
                path.display()
            ));
        }

        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let content = std::fs::read_to_string(&config_path)
            .context(format!("Failed to read config from {}", config_path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        tracing::info!(path = %config_path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn rpc_url(&self) -> Result<url::Url> {
        url::Url::parse(&self.rpc_url).context(format!("Invalid RPC URL `{}`", self.rpc_url))
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn finalize_retry_delay(&self) -> Duration {
        Duration::from_millis(self.finalize_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.rpc_url()?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("RPC URL must use http or https, got `{}`", url.scheme());
        }
        if self.receipt_timeout_secs == 0 {
            anyhow::bail!("receipt_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Run context for this configuration.
    pub fn run_context(&self, mode: RunMode, policy: Policy) -> Result<RunContext> {
        let mut ctx = RunContext::new(&self.network, self.deployer, self.admin)
            .with_mode(mode)
            .with_policy(policy)
            .with_config_hash(DeploymentConfigHash::from_config(self).compute_hash()?);
        ctx.external = self.external.clone();
        Ok(ctx)
    }
}

/// Configuration parameters that affect what gets deployed.
///
/// Runtime-only settings (RPC endpoint, directories, timeouts) are left out so
/// that moving a registry between machines does not look like a config change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfigHash {
    pub network: String,
    pub deployer: Address,
    pub admin: Address,
    pub external: BTreeMap<String, Address>,
    pub plan: PlanOptions,
}

impl DeploymentConfigHash {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            network: config.network.clone(),
            deployer: config.deployer,
            admin: config.admin,
            external: config.external.clone(),
            plan: config.plan.clone(),
        }
    }

    /// Hex-encoded SHA-256 of the JSON serialization. Maps are ordered, so the
    /// same configuration always produces the same hash.
    pub fn compute_hash(&self) -> Result<String> {
        let json =
            serde_json::to_string(self).context("Failed to serialize deployment config hash")?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}
