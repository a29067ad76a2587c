//! In-process ledger used by `--simulate` runs and tests.
//!
//! Executes calls instantly, models the access controller's ownership and role
//! rules, and supports injected faults so failure paths can be exercised.

use std::collections::{HashMap, HashSet};

use alloy_core::primitives::{Address, B256, U256, keccak256};
use tokio::sync::Mutex;

use super::{Ledger, LedgerCall, Receipt, TxRequest};
use crate::capability::{Capability, CapabilityMask};
use crate::error::RemoteError;
use crate::registry::ComponentKind;

/// Fee charged per executed call.
const CALL_FEE: u64 = 50_000_000_000_000;
/// Fee charged per creation.
const CREATE_FEE: u64 = 2_000_000_000_000_000;

type Matcher = Box<dyn Fn(&LedgerCall) -> bool + Send + Sync>;

/// What an injected fault does to a matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEffect {
    /// Reject at submission with a revert reason. Nothing executes.
    Revert(String),
    /// Fail at submission with a transport error. Nothing executes.
    Transport(String),
    /// Execute the call, then lose the first receipt lookup, as if the
    /// connection dropped while waiting for confirmation.
    DropReceipt,
    /// Execute the call, then fail every receipt lookup until
    /// [`SimulatedLedger::recover_receipts`] is called.
    LoseReceipt,
    /// Mine the call as reverted: the sequence number and fee are consumed,
    /// nothing executes and the receipt reports failure.
    RevertMined(String),
}

/// A fault applied to calls matching a predicate.
pub struct Fault {
    matcher: Matcher,
    effect: FaultEffect,
    remaining: Option<usize>,
}

impl Fault {
    pub fn new<F>(matcher: F, effect: FaultEffect) -> Self
    where
        F: Fn(&LedgerCall) -> bool + Send + Sync + 'static,
    {
        Self {
            matcher: Box::new(matcher),
            effect,
            remaining: None,
        }
    }

    pub fn on_create(kind: ComponentKind, effect: FaultEffect) -> Self {
        Self::new(
            move |call| matches!(call, LedgerCall::Create { kind: k, .. } if *k == kind),
            effect,
        )
    }

    pub fn on_revoke(effect: FaultEffect) -> Self {
        Self::new(|call| matches!(call, LedgerCall::RevokeRoles { .. }), effect)
    }

    pub fn on_transfer_ownership(effect: FaultEffect) -> Self {
        Self::new(|call| matches!(call, LedgerCall::TransferOwnership { .. }), effect)
    }

    pub fn on_invoke(effect: FaultEffect) -> Self {
        Self::new(|call| matches!(call, LedgerCall::Invoke { .. }), effect)
    }

    /// Only fire for the first `times` matching calls.
    pub fn times(mut self, times: usize) -> Self {
        self.remaining = Some(times);
        self
    }
}

#[derive(Debug, Default)]
struct Controller {
    owner: Address,
    roles: HashMap<Address, CapabilityMask>,
    addresses: HashMap<U256, Address>,
}

#[derive(Default)]
struct State {
    block: u64,
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    code: HashMap<Address, ComponentKind>,
    controllers: HashMap<Address, Controller>,
    receipts: HashMap<B256, Receipt>,
    dropped: Vec<B256>,
    lost: HashSet<B256>,
    executed: Vec<TxRequest>,
    faults: Vec<Fault>,
}

impl State {
    /// Return the effect of the first live fault matching `call`.
    fn take_fault(&mut self, call: &LedgerCall) -> Option<FaultEffect> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.remaining != Some(0) && (f.matcher)(call))?;
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(fault.effect.clone())
    }

    fn controller(&mut self, address: Address) -> Result<&mut Controller, RemoteError> {
        self.controllers
            .get_mut(&address)
            .ok_or_else(|| RemoteError::reverted(format!("no access controller at {address}")))
    }

    fn execute(&mut self, tx: &TxRequest) -> Result<Option<Address>, RemoteError> {
        match &tx.call {
            LedgerCall::Create { kind, .. } => {
                let address = derive_address(tx.from, tx.nonce);
                self.code.insert(address, *kind);
                if *kind == ComponentKind::AccessController {
                    self.controllers.insert(
                        address,
                        Controller {
                            owner: tx.from,
                            ..Default::default()
                        },
                    );
                }
                Ok(Some(address))
            }
            LedgerCall::GrantRoles {
                controller,
                holder,
                mask,
            } => {
                let ctl = self.controller(*controller)?;
                if ctl.owner != tx.from {
                    return Err(RemoteError::reverted("caller is not the owner"));
                }
                let prior = ctl.roles.get(holder).copied().unwrap_or_default();
                ctl.roles.insert(
                    *holder,
                    CapabilityMask::apply(prior, *mask, CapabilityMask::EMPTY),
                );
                Ok(None)
            }
            LedgerCall::RevokeRoles {
                controller,
                holder,
                mask,
            } => {
                let ctl = self.controller(*controller)?;
                if ctl.owner != tx.from && *holder != tx.from {
                    return Err(RemoteError::reverted(
                        "caller is neither the owner nor the holder",
                    ));
                }
                let prior = ctl.roles.get(holder).copied().unwrap_or_default();
                ctl.roles.insert(
                    *holder,
                    CapabilityMask::apply(prior, CapabilityMask::EMPTY, *mask),
                );
                Ok(None)
            }
            LedgerCall::SetAddress {
                controller,
                flag,
                target,
            } => {
                let ctl = self.controller(*controller)?;
                if ctl.owner != tx.from {
                    return Err(RemoteError::reverted("caller is not the owner"));
                }
                ctl.addresses.insert(flag.id(), *target);
                Ok(None)
            }
            LedgerCall::TransferOwnership {
                controller,
                new_owner,
            } => {
                let ctl = self.controller(*controller)?;
                if ctl.owner != tx.from {
                    return Err(RemoteError::reverted("caller is not the owner"));
                }
                ctl.owner = *new_owner;
                Ok(None)
            }
            LedgerCall::Invoke { target, .. } => {
                if !self.code.contains_key(target) {
                    return Err(RemoteError::reverted(format!("call to non-contract {target}")));
                }
                Ok(None)
            }
        }
    }
}

fn derive_address(sender: Address, nonce: u64) -> Address {
    let mut preimage = sender.to_vec();
    preimage.extend_from_slice(&nonce.to_be_bytes());
    Address::from_slice(&keccak256(&preimage)[12..])
}

fn derive_tx_hash(tx: &TxRequest) -> B256 {
    let mut preimage = tx.from.to_vec();
    preimage.extend_from_slice(&tx.nonce.to_be_bytes());
    preimage.extend(tx.call.calldata());
    keccak256(&preimage)
}

/// A ledger that lives in process memory.
#[derive(Default)]
pub struct SimulatedLedger {
    state: Mutex<State>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `amount` wei credited to `account`.
    pub fn with_balance(self, account: Address, amount: U256) -> Self {
        let mut state = self.state.into_inner();
        state.balances.insert(account, amount);
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn inject(&self, fault: Fault) {
        self.state.lock().await.faults.push(fault);
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Make receipts lost by [`FaultEffect::LoseReceipt`] available again.
    pub async fn recover_receipts(&self) {
        self.state.lock().await.lost.clear();
    }

    /// Every transaction that executed, in order.
    pub async fn executed(&self) -> Vec<TxRequest> {
        self.state.lock().await.executed.clone()
    }

    /// Number of executed transactions matching `predicate`.
    pub async fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&LedgerCall) -> bool,
    {
        self.state
            .lock()
            .await
            .executed
            .iter()
            .filter(|tx| predicate(&tx.call))
            .count()
    }

    pub async fn created(&self, kind: ComponentKind) -> usize {
        self.count(|call| matches!(call, LedgerCall::Create { kind: k, .. } if *k == kind))
            .await
    }
}

impl Ledger for SimulatedLedger {
    async fn submit(&self, tx: &TxRequest) -> Result<B256, RemoteError> {
        let mut state = self.state.lock().await;

        let expected = state.nonces.get(&tx.from).copied().unwrap_or_default();
        if tx.nonce != expected {
            return Err(RemoteError::Rejected(format!(
                "nonce mismatch for {}: expected {expected}, got {}",
                tx.from, tx.nonce
            )));
        }

        let fault = state.take_fault(&tx.call);
        match &fault {
            Some(FaultEffect::Revert(reason)) => return Err(RemoteError::reverted(reason.clone())),
            Some(FaultEffect::Transport(reason)) => {
                return Err(RemoteError::Transport(reason.clone()));
            }
            Some(_) | None => {}
        }

        let mined_revert = matches!(fault, Some(FaultEffect::RevertMined(_)));
        let contract_address = if mined_revert {
            None
        } else {
            state.execute(tx)?
        };

        let fee = match tx.call {
            LedgerCall::Create { .. } => CREATE_FEE,
            _ => CALL_FEE,
        };
        let balance = state.balances.entry(tx.from).or_default();
        *balance = balance.saturating_sub(U256::from(fee));

        state.nonces.insert(tx.from, expected + 1);
        state.block += 1;

        let tx_hash = derive_tx_hash(tx);
        let receipt = Receipt {
            tx_hash,
            block_number: state.block,
            success: !mined_revert,
            contract_address,
        };
        state.receipts.insert(tx_hash, receipt);
        if !mined_revert {
            state.executed.push(tx.clone());
        }
        match fault {
            Some(FaultEffect::DropReceipt) => state.dropped.push(tx_hash),
            Some(FaultEffect::LoseReceipt) => {
                state.lost.insert(tx_hash);
            }
            _ => {}
        }

        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, RemoteError> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.dropped.iter().position(|h| *h == tx_hash) {
            state.dropped.remove(pos);
            return Err(RemoteError::Transport("connection reset by peer".into()));
        }
        if state.lost.contains(&tx_hash) {
            return Err(RemoteError::Transport("receipt lookup timed out".into()));
        }
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn nonce(&self, account: Address) -> Result<u64, RemoteError> {
        Ok(self
            .state
            .lock()
            .await
            .nonces
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn balance(&self, account: Address) -> Result<U256, RemoteError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn has_code(&self, address: Address) -> Result<bool, RemoteError> {
        Ok(self.state.lock().await.code.contains_key(&address))
    }

    async fn role_mask(
        &self,
        controller: Address,
        holder: Address,
    ) -> Result<CapabilityMask, RemoteError> {
        let mut state = self.state.lock().await;
        let ctl = state.controller(controller)?;
        Ok(ctl.roles.get(&holder).copied().unwrap_or_default())
    }

    async fn owner(&self, controller: Address) -> Result<Address, RemoteError> {
        let mut state = self.state.lock().await;
        Ok(state.controller(controller)?.owner)
    }

    async fn address_of(
        &self,
        controller: Address,
        flag: Capability,
    ) -> Result<Address, RemoteError> {
        let mut state = self.state.lock().await;
        let ctl = state.controller(controller)?;
        Ok(ctl.addresses.get(&flag.id()).copied().unwrap_or_default())
    }
}
