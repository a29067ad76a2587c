//! Persistent per-network registry of deployed components.
//!
//! One JSON file per network lives under the registry directory, next to a
//! `<network>.lock` file that is held exclusively for the registry's lifetime.
//! Every successful write is persisted atomically (temporary file + rename) and
//! bumps a version stamp that is checked against the file on disk before the
//! next write.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use alloy_core::primitives::{Address, B256};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::context::{RunContext, RunMode, validate_network};
use crate::error::{DeployError, Result};

/// Name prefix marking a component as a stand-in that must not reach production.
pub const PLACEHOLDER_PREFIX: &str = "Mock";

/// Kinds of components the deployment knows how to create.
///
/// The display form is the artifact name used to look up creation bytecode.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum ComponentKind {
    AccessController,
    ProviderRegistry,
    OracleRouter,
    LendingRateOracle,
    LendingPool,
    LendingPoolConfigurator,
    CollateralManager,
    ProtocolDataProvider,
    WethGateway,
    Treasury,
    StakeConfigurator,
    StakeToken,
    RewardToken,
    RewardConfigurator,
    RewardController,
    RewardPool,
    MockPriceOracle,
}

impl ComponentKind {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::MockPriceOracle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRecord {
    /// Kind name as written; unknown kinds survive a load so the audit can report them.
    pub kind: String,
    pub address: Address,
    /// Creation transaction, absent for adopted components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    #[serde(default)]
    pub block_number: u64,
    /// Insertion order within the registry.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub placeholder: bool,
}

impl ComponentRecord {
    pub fn new(kind: ComponentKind, address: Address) -> Self {
        Self {
            kind: kind.to_string(),
            address,
            tx_hash: None,
            block_number: 0,
            sequence: 0,
            placeholder: kind.is_placeholder(),
        }
    }

    pub fn with_creation(mut self, tx_hash: B256, block_number: u64) -> Self {
        self.tx_hash = Some(tx_hash);
        self.block_number = block_number;
        self
    }

    pub fn with_placeholder(mut self, placeholder: bool) -> Self {
        self.placeholder = self.placeholder || placeholder;
        self
    }

    pub fn known_kind(&self) -> Option<ComponentKind> {
        self.kind.parse().ok()
    }
}

/// Journal entry written before a creation is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCreation {
    pub kind: ComponentKind,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
}

/// On-disk layout of a network registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryFile {
    pub version: u64,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub next_sequence: u64,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending: BTreeMap<String, PendingCreation>,
}

impl RegistryFile {
    fn empty(network: &str) -> Self {
        Self {
            version: 0,
            network: network.to_string(),
            config_hash: None,
            updated_at: 0,
            next_sequence: 0,
            components: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }
}

/// Only the version stamp, so a concurrent check survives an unrelated format error.
#[derive(Deserialize)]
struct VersionStamp {
    #[serde(default)]
    version: u64,
}

/// Whether `put` may overwrite an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replace {
    No,
    Yes,
}

/// Findings of [`Registry::audit_duplicates`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateAudit {
    /// Distinct names whose address is shared with another name.
    pub multi_deployed: usize,
    /// Names whose kind is not a known component kind.
    pub unknown: usize,
    /// Names that are placeholders by prefix or flag.
    pub placeholders: Vec<String>,
}

/// Exclusive advisory lock on `<network>.lock`, released on drop.
#[derive(Debug)]
struct RegistryLock {
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    fn acquire(dir: &Path, network: &str) -> Result<Self> {
        let path = dir.join(format!("{network}.lock"));
        let file = File::create(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Acquired registry lock");
                Ok(Self { file, path })
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                tracing::error!(path = %path.display(), "Registry is locked by another run");
                Err(DeployError::RegistryLocked {
                    network: network.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release registry lock");
        }
    }
}

/// A locked, loaded network registry.
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    data: RegistryFile,
    _lock: RegistryLock,
}

impl Registry {
    /// Lock the registry of `network` under `dir`. The in-memory state starts
    /// empty; call [`Registry::load`] or [`Registry::reset`] next.
    pub fn open(dir: impl AsRef<Path>, network: &str) -> Result<Self> {
        validate_network(network)?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = RegistryLock::acquire(&dir, network)?;

        Ok(Self {
            dir,
            data: RegistryFile::empty(network),
            _lock: lock,
        })
    }

    pub fn network(&self) -> &str {
        &self.data.network
    }

    pub fn path(&self) -> PathBuf {
        Self::file_path(&self.dir, &self.data.network)
    }

    pub fn file_path(dir: &Path, network: &str) -> PathBuf {
        dir.join(format!("{network}.json"))
    }

    pub fn data(&self) -> &RegistryFile {
        &self.data
    }

    /// Replace in-memory state with the file on disk. A missing file is an empty registry.
    pub fn load(&mut self) -> Result<()> {
        let path = self.path();
        if !path.exists() {
            self.data = RegistryFile::empty(&self.data.network);
            return Ok(());
        }

        let content = fs::read_to_string(&path)?;
        let data: RegistryFile = serde_json::from_str(&content)?;
        if data.network != self.data.network {
            return Err(anyhow::anyhow!(
                "registry file {} belongs to network `{}`",
                path.display(),
                data.network
            )
            .into());
        }

        tracing::debug!(
            path = %path.display(),
            version = data.version,
            components = data.components.len(),
            "Registry loaded"
        );
        self.data = data;
        Ok(())
    }

    /// Drop every record and journal entry and persist the empty registry.
    pub fn reset(&mut self) -> Result<()> {
        let mut empty = RegistryFile::empty(&self.data.network);
        empty.version = self.disk_version()?;
        self.commit(empty)?;
        tracing::info!(network = %self.data.network, "Registry reset");
        Ok(())
    }

    fn disk_version(&self) -> Result<u64> {
        let path = self.path();
        if !path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&path)?;
        let stamp: VersionStamp = serde_json::from_str(&content)?;
        Ok(stamp.version)
    }

    /// Write the registry to disk, failing if someone else wrote it since our last read.
    pub fn persist(&mut self) -> Result<()> {
        self.commit(self.data.clone())
    }

    /// Write `next` to disk and adopt it as the in-memory state.
    ///
    /// `next.version` is the version it was derived from. The in-memory state
    /// is left untouched when the write is refused or fails.
    fn commit(&mut self, mut next: RegistryFile) -> Result<()> {
        let found = self.disk_version()?;
        if found != next.version {
            return Err(DeployError::ConcurrentModification {
                network: next.network,
                expected: next.version,
                found,
            });
        }

        next.version = found + 1;
        next.updated_at = chrono::Utc::now().timestamp();

        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&next)?)?;
        fs::rename(&tmp, &path)?;

        self.data = next;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ComponentRecord> {
        self.data.components.get(name)
    }

    pub fn len(&self) -> usize {
        self.data.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.components.is_empty()
    }

    /// Records in insertion order.
    pub fn ordered(&self) -> Vec<(&str, &ComponentRecord)> {
        let mut records: Vec<_> = self
            .data
            .components
            .iter()
            .map(|(name, record)| (name.as_str(), record))
            .collect();
        records.sort_by_key(|(_, record)| record.sequence);
        records
    }

    /// Record `name`. Collisions are errors except for an explicit replacement
    /// in an incremental run with reuse enabled.
    pub fn put(
        &mut self,
        ctx: &RunContext,
        name: &str,
        mut record: ComponentRecord,
        replace: Replace,
    ) -> Result<&ComponentRecord> {
        if self.data.components.contains_key(name) {
            let allowed =
                ctx.mode == RunMode::Incremental && ctx.policy.reuse && replace == Replace::Yes;
            if !allowed {
                return Err(DeployError::DuplicateComponent {
                    name: name.to_string(),
                    network: self.data.network.clone(),
                });
            }
            tracing::warn!(name, address = %record.address, "Replacing registry record");
        }

        let mut next = self.data.clone();
        record.sequence = next.next_sequence;
        next.next_sequence += 1;
        next.components.insert(name.to_string(), record);
        next.pending.remove(name);
        self.commit(next)?;

        self.data
            .components
            .get(name)
            .ok_or_else(|| DeployError::MissingComponent(name.to_string()))
    }

    pub fn config_hash(&self) -> Option<&str> {
        self.data.config_hash.as_deref()
    }

    pub fn set_config_hash(&mut self, hash: Option<String>) -> Result<()> {
        if self.data.config_hash == hash {
            return Ok(());
        }
        let mut next = self.data.clone();
        next.config_hash = hash;
        self.commit(next)
    }

    pub fn pending(&self, name: &str) -> Option<&PendingCreation> {
        self.data.pending.get(name)
    }

    /// Journal a creation about to be sent with `nonce`.
    pub fn begin_pending(&mut self, name: &str, kind: ComponentKind, nonce: u64) -> Result<()> {
        let mut next = self.data.clone();
        next.pending.insert(
            name.to_string(),
            PendingCreation {
                kind,
                nonce,
                tx_hash: None,
            },
        );
        self.commit(next)
    }

    pub fn record_pending_hash(&mut self, name: &str, tx_hash: B256) -> Result<()> {
        let mut next = self.data.clone();
        let Some(entry) = next.pending.get_mut(name) else {
            return Ok(());
        };
        entry.tx_hash = Some(tx_hash);
        self.commit(next)
    }

    pub fn clear_pending(&mut self, name: &str) -> Result<()> {
        if !self.data.pending.contains_key(name) {
            return Ok(());
        }
        let mut next = self.data.clone();
        next.pending.remove(name);
        self.commit(next)
    }

    pub fn audit_duplicates(&self) -> DuplicateAudit {
        let mut by_address: HashMap<Address, usize> = HashMap::new();
        for record in self.data.components.values() {
            *by_address.entry(record.address).or_default() += 1;
        }

        let mut audit = DuplicateAudit::default();
        for (name, record) in &self.data.components {
            if by_address.get(&record.address).copied().unwrap_or_default() > 1 {
                audit.multi_deployed += 1;
            }
            if record.known_kind().is_none() {
                audit.unknown += 1;
            }
            if record.placeholder || name.starts_with(PLACEHOLDER_PREFIX) {
                audit.placeholders.push(name.clone());
            }
        }
        audit
    }
}
