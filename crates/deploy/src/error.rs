//! Error taxonomy for deployment runs.

use alloy_core::primitives::Address;
use thiserror::Error;

use crate::capability::CapabilityError;

/// Outcome of a remote call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The call executed and reverted.
    #[error("reverted: {reason}")]
    Reverted { reason: String },

    /// The node refused the call before execution (bad nonce, unknown account, ...).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The node could not be reached or did not answer in time.
    #[error("transport: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn reverted(reason: impl Into<String>) -> Self {
        Self::Reverted {
            reason: reason.into(),
        }
    }

    /// Transport failures may succeed when retried; reverts and rejections will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Coarse classification used by the orchestrator to pick the next run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    DuplicateComponent,
    RemoteCallReverted,
    FinalizeFailed,
    ConsistencyWarning,
    FatalAbort,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("component `{name}` already exists in the `{network}` registry")]
    DuplicateComponent { name: String, network: String },

    #[error("remote call `{call}` reverted: {reason}")]
    RemoteCallReverted { call: String, reason: String },

    #[error("remote call `{call}` failed: {source}")]
    Remote {
        call: String,
        #[source]
        source: RemoteError,
    },

    #[error("finalization failed: {0}")]
    FinalizeFailed(String),

    #[error("consistency warning: {0}")]
    ConsistencyWarning(String),

    #[error("registry for `{network}` is locked by another run")]
    RegistryLocked { network: String },

    #[error("registry for `{network}` changed on disk (expected version {expected}, found {found})")]
    ConcurrentModification {
        network: String,
        expected: u64,
        found: u64,
    },

    #[error("component `{name}` is recorded at {address} but has no code there")]
    StaleComponent { name: String, address: Address },

    #[error("pending creation of `{name}` (nonce {nonce}) cannot be reconciled automatically")]
    UnreconciledCreation { name: String, nonce: u64 },

    #[error("component `{0}` is required but missing from the registry")]
    MissingComponent(String),

    #[error(
        "access controller {controller} is owned by {owner}; ownership must be handed back to the deployer before roles or addresses can change"
    )]
    ControllerHandedOver { controller: Address, owner: Address },

    #[error("holder {holder} is missing expected capabilities {missing}")]
    AccessCheckFailed { holder: Address, missing: String },

    #[error("invalid run context: {0}")]
    InvalidContext(String),

    #[error("invalid step plan: {0}")]
    InvalidPlan(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Wrap a remote failure, keeping reverts in their own taxonomy slot.
    pub fn remote(call: impl Into<String>, err: RemoteError) -> Self {
        match err {
            RemoteError::Reverted { reason } => Self::RemoteCallReverted {
                call: call.into(),
                reason,
            },
            source => Self::Remote {
                call: call.into(),
                source,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateComponent { .. } => ErrorKind::DuplicateComponent,
            Self::RemoteCallReverted { .. } => ErrorKind::RemoteCallReverted,
            Self::FinalizeFailed(_) => ErrorKind::FinalizeFailed,
            Self::ConsistencyWarning(_) => ErrorKind::ConsistencyWarning,
            _ => ErrorKind::FatalAbort,
        }
    }
}

pub type Result<T, E = DeployError> = std::result::Result<T, E>;
