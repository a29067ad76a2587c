//! Remote ledger seam.
//!
//! Every component creation and configuration call goes through [`Ledger`].
//! Calls are opaque to the engine: they either produce a successful receipt or
//! fail with a [`RemoteError`].

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use alloy_core::primitives::{Address, B256, U256, keccak256};

use crate::capability::{Capability, CapabilityMask};
use crate::error::RemoteError;
use crate::registry::ComponentKind;

mod rpc;
mod simulated;

pub use rpc::{ArtifactStore, RpcLedger};
pub use simulated::{Fault, FaultEffect, SimulatedLedger};

/// Interval between receipt polls.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default time to wait for a submitted transaction to be mined.
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// A static ABI value occupying one 32-byte word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Address(Address),
    Uint(U256),
    Bool(bool),
}

impl AbiValue {
    pub fn word(&self) -> [u8; 32] {
        match self {
            Self::Address(address) => address.into_word().0,
            Self::Uint(value) => value.to_be_bytes::<32>(),
            Self::Bool(flag) => U256::from(*flag as u8).to_be_bytes::<32>(),
        }
    }
}

impl fmt::Display for AbiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Bool(flag) => write!(f, "{flag}"),
        }
    }
}

/// First four bytes of the keccak hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_args(args: &[AbiValue]) -> Vec<u8> {
    args.iter().flat_map(|arg| arg.word()).collect()
}

pub fn encode_call(signature: &str, args: &[AbiValue]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode_args(args));
    data
}

pub const GRANT_ROLES: &str = "grantRoles(address,uint256)";
pub const REVOKE_ROLES: &str = "revokeRoles(address,uint256)";
pub const SET_ADDRESS: &str = "setAddress(uint256,address)";
pub const GET_ADDRESS: &str = "getAddress(uint256)";
pub const QUERY_MASK: &str = "queryAccessControlMask(address,uint256)";
pub const TRANSFER_OWNERSHIP: &str = "transferOwnership(address)";
pub const OWNER: &str = "owner()";

/// A mutating call issued by the deploying credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    /// Create a new component from its artifact.
    Create {
        kind: ComponentKind,
        args: Vec<AbiValue>,
    },
    GrantRoles {
        controller: Address,
        holder: Address,
        mask: CapabilityMask,
    },
    RevokeRoles {
        controller: Address,
        holder: Address,
        mask: CapabilityMask,
    },
    SetAddress {
        controller: Address,
        flag: Capability,
        target: Address,
    },
    /// Hand the controller, and with it the right to grant roles, to `new_owner`.
    TransferOwnership {
        controller: Address,
        new_owner: Address,
    },
    /// A declarative configuration setter on an existing component.
    Invoke {
        target: Address,
        signature: String,
        args: Vec<AbiValue>,
    },
}

impl LedgerCall {
    /// Destination of the call, `None` for creations.
    pub fn target(&self) -> Option<Address> {
        match self {
            Self::Create { .. } => None,
            Self::GrantRoles { controller, .. }
            | Self::RevokeRoles { controller, .. }
            | Self::SetAddress { controller, .. }
            | Self::TransferOwnership { controller, .. } => Some(*controller),
            Self::Invoke { target, .. } => Some(*target),
        }
    }

    /// Encoded call data. For creations this is only the constructor arguments.
    pub fn calldata(&self) -> Vec<u8> {
        match self {
            Self::Create { args, .. } => encode_args(args),
            Self::GrantRoles { holder, mask, .. } => encode_call(
                GRANT_ROLES,
                &[AbiValue::Address(*holder), AbiValue::Uint(mask.as_u256())],
            ),
            Self::RevokeRoles { holder, mask, .. } => encode_call(
                REVOKE_ROLES,
                &[AbiValue::Address(*holder), AbiValue::Uint(mask.as_u256())],
            ),
            Self::SetAddress { flag, target, .. } => encode_call(
                SET_ADDRESS,
                &[AbiValue::Uint(flag.id()), AbiValue::Address(*target)],
            ),
            Self::TransferOwnership { new_owner, .. } => {
                encode_call(TRANSFER_OWNERSHIP, &[AbiValue::Address(*new_owner)])
            }
            Self::Invoke {
                signature, args, ..
            } => encode_call(signature, args),
        }
    }

    /// Short human-readable description for logs and errors.
    pub fn label(&self) -> String {
        match self {
            Self::Create { kind, .. } => format!("create {kind}"),
            Self::GrantRoles { holder, mask, .. } => format!("grantRoles({holder}, {mask})"),
            Self::RevokeRoles { holder, mask, .. } => format!("revokeRoles({holder}, {mask})"),
            Self::SetAddress { flag, target, .. } => format!("setAddress({flag}, {target})"),
            Self::TransferOwnership { new_owner, .. } => format!("transferOwnership({new_owner})"),
            Self::Invoke {
                target, signature, ..
            } => format!("{target}.{signature}"),
        }
    }
}

/// A call bound to a sender and sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub nonce: u64,
    pub call: LedgerCall,
}

/// Mined transaction outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
    pub contract_address: Option<Address>,
}

/// Remote ledger operations consumed by the engine.
pub trait Ledger: Send + Sync {
    /// Submit a transaction, returning its hash once the node accepted it.
    fn submit(&self, tx: &TxRequest) -> impl Future<Output = Result<B256, RemoteError>> + Send;

    /// Look up a receipt; `None` while the transaction is unknown or unmined.
    fn receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<Receipt>, RemoteError>> + Send;

    /// Next sequence number for `account`, counting pending transactions.
    fn nonce(&self, account: Address) -> impl Future<Output = Result<u64, RemoteError>> + Send;

    fn balance(&self, account: Address) -> impl Future<Output = Result<U256, RemoteError>> + Send;

    fn has_code(&self, address: Address)
    -> impl Future<Output = Result<bool, RemoteError>> + Send;

    /// Authoritative role mask of `holder` on `controller`.
    fn role_mask(
        &self,
        controller: Address,
        holder: Address,
    ) -> impl Future<Output = Result<CapabilityMask, RemoteError>> + Send;

    /// Current owner of `controller`, the only account allowed to grant roles.
    fn owner(&self, controller: Address)
    -> impl Future<Output = Result<Address, RemoteError>> + Send;

    /// Address bound to `flag` on `controller`, zero when unbound.
    fn address_of(
        &self,
        controller: Address,
        flag: Capability,
    ) -> impl Future<Output = Result<Address, RemoteError>> + Send;
}

/// Poll until `tx_hash` is mined or `timeout` elapses.
///
/// Transport errors while polling are retried until the deadline, since the
/// transaction was already accepted and its outcome does not depend on them.
pub async fn wait_for_receipt<L: Ledger>(
    ledger: &L,
    tx_hash: B256,
    timeout: Duration,
) -> Result<Receipt, RemoteError> {
    let start = Instant::now();
    let mut last_error = None;

    loop {
        match ledger.receipt(tx_hash).await {
            Ok(Some(receipt)) if !receipt.success => {
                return Err(RemoteError::reverted(format!(
                    "transaction {tx_hash} reverted in block {}",
                    receipt.block_number
                )));
            }
            Ok(Some(receipt)) => return Ok(receipt),
            Ok(None) => {
                tracing::trace!(tx_hash = %tx_hash, "Receipt not available yet, retrying...");
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(tx_hash = %tx_hash, error = %err, "Receipt lookup failed, retrying...");
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }

        if start.elapsed() > timeout {
            let cause = last_error
                .map(|err| format!(" (last error: {err})"))
                .unwrap_or_default();
            return Err(RemoteError::Transport(format!(
                "timed out waiting for receipt of {tx_hash}{cause}"
            )));
        }

        tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
    }
}

/// Sequence numbers of the deploying credential.
///
/// Owned by the orchestrator and lent to steps and the finalizer; numbers are
/// handed out in strictly increasing order and only advance once the node has
/// accepted a transaction.
#[derive(Debug)]
pub struct TxSequencer {
    account: Address,
    next: u64,
    receipt_timeout: Duration,
}

impl TxSequencer {
    /// Read the account's next sequence number from the ledger.
    pub async fn sync<L: Ledger>(ledger: &L, account: Address) -> Result<Self, RemoteError> {
        let next = ledger.nonce(account).await?;
        tracing::debug!(account = %account, nonce = next, "Transaction sequence synced");
        Ok(Self {
            account,
            next,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        })
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn next_nonce(&self) -> u64 {
        self.next
    }

    pub fn receipt_timeout(&self) -> Duration {
        self.receipt_timeout
    }

    /// Submit `call` with the next sequence number.
    pub async fn submit<L: Ledger>(
        &mut self,
        ledger: &L,
        call: LedgerCall,
    ) -> Result<B256, RemoteError> {
        let tx = TxRequest {
            from: self.account,
            nonce: self.next,
            call,
        };

        match ledger.submit(&tx).await {
            Ok(hash) => {
                self.next += 1;
                tracing::debug!(nonce = tx.nonce, tx_hash = %hash, call = %tx.call.label(), "Transaction submitted");
                Ok(hash)
            }
            Err(err) => {
                // Whether the node kept the transaction is unknown after a transport error.
                if err.is_transient() {
                    if let Ok(next) = ledger.nonce(self.account).await {
                        self.next = next;
                    }
                }
                Err(err)
            }
        }
    }

    /// Submit `call` and wait for a successful receipt.
    pub async fn send<L: Ledger>(
        &mut self,
        ledger: &L,
        call: LedgerCall,
    ) -> Result<Receipt, RemoteError> {
        let hash = self.submit(ledger, call).await?;
        wait_for_receipt(ledger, hash, self.receipt_timeout).await
    }
}
