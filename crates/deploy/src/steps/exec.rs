use alloy_core::primitives::Address;

use super::{Action, Arg, DeploySpec, Holder, Step, StepResult, StepStatus};
use crate::access::AccessController;
use crate::capability::{Capability, CapabilityMask, RoleIntent};
use crate::context::RunContext;
use crate::error::{DeployError, RemoteError, Result};
use crate::ledger::{AbiValue, Ledger, LedgerCall, TxSequencer, wait_for_receipt};
use crate::registry::{ComponentRecord, PendingCreation, Registry, Replace};

/// Progress of a single step, kept even when it fails halfway.
#[derive(Default)]
struct Progress {
    changed: bool,
    produced: Vec<(String, ComponentRecord)>,
}

/// Executes steps against one registry with the run's transaction sequencer.
pub struct StepExecutor<'a, L> {
    ctx: &'a RunContext,
    ledger: &'a L,
    registry: &'a mut Registry,
    sequencer: &'a mut TxSequencer,
    intent: &'a mut RoleIntent,
    controller: &'a str,
}

impl<'a, L: Ledger> StepExecutor<'a, L> {
    pub fn new(
        ctx: &'a RunContext,
        ledger: &'a L,
        registry: &'a mut Registry,
        sequencer: &'a mut TxSequencer,
        intent: &'a mut RoleIntent,
        controller: &'a str,
    ) -> Self {
        Self {
            ctx,
            ledger,
            registry,
            sequencer,
            intent,
            controller,
        }
    }

    pub async fn run(&mut self, step: &Step) -> StepResult {
        let mut progress = Progress::default();
        let mut error = None;

        for action in &step.actions {
            if let Err(err) = self.apply(action, &mut progress).await {
                error = Some(err);
                break;
            }
        }

        let status = match (&error, progress.changed) {
            (Some(_), _) => StepStatus::Failed,
            (None, true) => StepStatus::Ok,
            (None, false) => StepStatus::Skipped,
        };

        StepResult {
            status,
            produced: progress.produced,
            error,
        }
    }

    async fn apply(&mut self, action: &Action, progress: &mut Progress) -> Result<()> {
        match action {
            Action::Deploy(spec) => self.ensure_component(spec, progress).await,
            Action::SetAddress { flag, component } => {
                self.ensure_address(*flag, component, progress).await
            }
            Action::Grant { holder, flags } => self.ensure_roles(holder, flags, progress).await,
            Action::Invoke {
                component,
                signature,
                args,
            } => {
                let target = self.component(component)?.address;
                let args = self.resolve_args(args)?;
                self.sequencer
                    .send(
                        self.ledger,
                        LedgerCall::Invoke {
                            target,
                            signature: signature.clone(),
                            args,
                        },
                    )
                    .await
                    .map_err(|e| DeployError::remote(format!("{component}.{signature}"), e))?;
                tracing::debug!(component = %component, signature = %signature, "Setter invoked");
                progress.changed = true;
                Ok(())
            }
            Action::ExpectRoles { holder, flags } => {
                let holder = self.holder(holder)?;
                let expected = CapabilityMask::from_flags(flags);
                let held = self
                    .access()?
                    .current_mask(holder)
                    .await
                    .map_err(|e| DeployError::remote("queryAccessControlMask", e))?;
                let missing = expected.difference(held);
                if !missing.is_empty() {
                    return Err(DeployError::AccessCheckFailed {
                        holder,
                        missing: missing.to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    fn component(&self, name: &str) -> Result<&ComponentRecord> {
        self.registry
            .get(name)
            .ok_or_else(|| DeployError::MissingComponent(name.to_string()))
    }

    fn access(&self) -> Result<AccessController<'a, L>> {
        let address = self.component(self.controller)?.address;
        Ok(AccessController::new(self.ledger, address))
    }

    /// Controller writes need the deployer to still own the controller, which
    /// is no longer the case once a finalizer handed it to the admin.
    async fn ensure_owner(&self, access: &AccessController<'a, L>) -> Result<()> {
        let owner = access
            .owner()
            .await
            .map_err(|e| DeployError::remote("owner", e))?;
        if owner != self.ctx.deployer {
            return Err(DeployError::ControllerHandedOver {
                controller: access.address(),
                owner,
            });
        }
        Ok(())
    }

    fn holder(&self, holder: &Holder) -> Result<Address> {
        match holder {
            Holder::Deployer => Ok(self.ctx.deployer),
            Holder::Admin => Ok(self.ctx.admin),
            Holder::Component(name) => Ok(self.component(name)?.address),
        }
    }

    fn resolve_args(&self, args: &[Arg]) -> Result<Vec<AbiValue>> {
        args.iter()
            .map(|arg| {
                Ok(match arg {
                    Arg::Component(name) => AbiValue::Address(self.component(name)?.address),
                    Arg::Deployer => AbiValue::Address(self.ctx.deployer),
                    Arg::Admin => AbiValue::Address(self.ctx.admin),
                    Arg::Address(address) => AbiValue::Address(*address),
                    Arg::Uint(value) => AbiValue::Uint(*value),
                    Arg::Bool(flag) => AbiValue::Bool(*flag),
                })
            })
            .collect()
    }

    async fn ensure_component(&mut self, spec: &DeploySpec, progress: &mut Progress) -> Result<()> {
        let existing = self.registry.get(&spec.name).cloned();
        let replace = if existing.is_some() {
            Replace::Yes
        } else {
            Replace::No
        };

        if let Some(pending) = self.registry.pending(&spec.name).cloned() {
            if let Some(record) = self.reconcile(spec, pending, replace).await? {
                progress.changed = true;
                progress.produced.push((spec.name.clone(), record));
                return Ok(());
            }
        }

        if let Some(record) = existing {
            if !self.ctx.is_incremental() {
                return Err(DeployError::DuplicateComponent {
                    name: spec.name.clone(),
                    network: self.ctx.network.clone(),
                });
            }

            let live = self
                .ledger
                .has_code(record.address)
                .await
                .map_err(|e| DeployError::remote(format!("getCode {}", spec.name), e))?;
            if live {
                tracing::info!(name = %spec.name, address = %record.address, "Component already deployed, skipping creation");
                return Ok(());
            }
            if !self.ctx.policy.reuse {
                return Err(DeployError::StaleComponent {
                    name: spec.name.clone(),
                    address: record.address,
                });
            }
            tracing::warn!(name = %spec.name, address = %record.address, "Recorded component has no code, redeploying");
        }

        if self.ctx.policy.reuse && spec.adoptable {
            if let Some(&address) = self.ctx.external.get(&spec.name) {
                return self.adopt(spec, address, replace, progress).await;
            }
        }

        self.create(spec, replace, progress).await
    }

    async fn adopt(
        &mut self,
        spec: &DeploySpec,
        address: Address,
        replace: Replace,
        progress: &mut Progress,
    ) -> Result<()> {
        let live = self
            .ledger
            .has_code(address)
            .await
            .map_err(|e| DeployError::remote(format!("getCode {}", spec.name), e))?;
        if !live {
            return Err(DeployError::StaleComponent {
                name: spec.name.clone(),
                address,
            });
        }

        let record = ComponentRecord::new(spec.kind, address).with_placeholder(spec.placeholder);
        let record = self
            .registry
            .put(self.ctx, &spec.name, record, replace)?
            .clone();
        tracing::info!(name = %spec.name, address = %address, "Adopted existing component");
        progress.changed = true;
        progress.produced.push((spec.name.clone(), record));
        Ok(())
    }

    async fn create(
        &mut self,
        spec: &DeploySpec,
        replace: Replace,
        progress: &mut Progress,
    ) -> Result<()> {
        let args = self.resolve_args(&spec.args)?;
        let label = format!("create {}", spec.name);

        self.registry
            .begin_pending(&spec.name, spec.kind, self.sequencer.next_nonce())?;

        let submitted = self
            .sequencer
            .submit(
                self.ledger,
                LedgerCall::Create {
                    kind: spec.kind,
                    args,
                },
            )
            .await;
        let tx_hash = match submitted {
            Ok(hash) => hash,
            Err(err) => return Err(self.abandon_pending(&spec.name, label, err)),
        };
        self.registry.record_pending_hash(&spec.name, tx_hash)?;

        let receipt =
            match wait_for_receipt(self.ledger, tx_hash, self.sequencer.receipt_timeout()).await {
                Ok(receipt) => receipt,
                Err(err) => return Err(self.abandon_pending(&spec.name, label, err)),
            };
        let address = receipt.contract_address.ok_or_else(|| {
            DeployError::remote(
                label.clone(),
                RemoteError::Rejected("receipt carries no contract address".into()),
            )
        })?;

        let record = ComponentRecord::new(spec.kind, address)
            .with_creation(receipt.tx_hash, receipt.block_number)
            .with_placeholder(spec.placeholder);
        let record = self
            .registry
            .put(self.ctx, &spec.name, record, replace)?
            .clone();

        tracing::info!(
            name = %spec.name,
            kind = %spec.kind,
            address = %address,
            block = receipt.block_number,
            "Component created"
        );
        progress.changed = true;
        progress.produced.push((spec.name.clone(), record));
        Ok(())
    }

    /// Keep the journal entry when the outcome is unknown, drop it otherwise.
    fn abandon_pending(&mut self, name: &str, label: String, err: RemoteError) -> DeployError {
        if !err.is_transient() {
            if let Err(clear_err) = self.registry.clear_pending(name) {
                tracing::warn!(name, error = %clear_err, "Failed to clear pending creation");
            }
        }
        DeployError::remote(label, err)
    }

    /// Decide what happened to a creation interrupted in an earlier run.
    ///
    /// Returns the recovered record, or `None` when the creation never landed
    /// and must be re-issued.
    async fn reconcile(
        &mut self,
        spec: &DeploySpec,
        pending: PendingCreation,
        replace: Replace,
    ) -> Result<Option<ComponentRecord>> {
        let account_nonce = self
            .ledger
            .nonce(self.ctx.deployer)
            .await
            .map_err(|e| DeployError::remote("getTransactionCount", e))?;

        if account_nonce <= pending.nonce {
            tracing::info!(name = %spec.name, nonce = pending.nonce, "Pending creation never landed, re-issuing");
            self.registry.clear_pending(&spec.name)?;
            return Ok(None);
        }

        let Some(tx_hash) = pending.tx_hash else {
            return Err(DeployError::UnreconciledCreation {
                name: spec.name.clone(),
                nonce: pending.nonce,
            });
        };

        match wait_for_receipt(self.ledger, tx_hash, self.sequencer.receipt_timeout()).await {
            Ok(receipt) => {
                let Some(address) = receipt.contract_address else {
                    return Err(DeployError::UnreconciledCreation {
                        name: spec.name.clone(),
                        nonce: pending.nonce,
                    });
                };
                let record = ComponentRecord::new(pending.kind, address)
                    .with_creation(receipt.tx_hash, receipt.block_number)
                    .with_placeholder(spec.placeholder);
                let record = self
                    .registry
                    .put(self.ctx, &spec.name, record, replace)?
                    .clone();
                tracing::info!(name = %spec.name, address = %address, "Recovered interrupted creation");
                Ok(Some(record))
            }
            Err(RemoteError::Reverted { reason }) => {
                tracing::warn!(name = %spec.name, reason = %reason, "Interrupted creation reverted, re-issuing");
                self.registry.clear_pending(&spec.name)?;
                Ok(None)
            }
            Err(err) => Err(DeployError::remote(format!("receipt of {tx_hash}"), err)),
        }
    }

    async fn ensure_address(
        &mut self,
        flag: Capability,
        component: &str,
        progress: &mut Progress,
    ) -> Result<()> {
        let target = self.component(component)?.address;
        let access = self.access()?;

        let bound = access
            .address_of(flag)
            .await
            .map_err(|e| DeployError::remote(format!("getAddress({flag})"), e))?;
        if bound == target {
            tracing::debug!(flag = %flag, target = %target, "Address already bound");
            return Ok(());
        }

        self.ensure_owner(&access).await?;
        access
            .set_address(self.sequencer, flag, target)
            .await
            .map_err(|e| DeployError::remote(format!("setAddress({flag}, {component})"), e))?;
        progress.changed = true;
        Ok(())
    }

    async fn ensure_roles(
        &mut self,
        holder: &Holder,
        flags: &[Capability],
        progress: &mut Progress,
    ) -> Result<()> {
        let address = self.holder(holder)?;
        let mask = CapabilityMask::from_flags(flags);
        let access = self.access()?;
        self.intent.grant(address, mask);

        let held = access
            .current_mask(address)
            .await
            .map_err(|e| DeployError::remote("queryAccessControlMask", e))?;
        let missing = mask.difference(held);
        if missing.is_empty() {
            tracing::debug!(holder = %address, mask = %mask, "Roles already held");
            return Ok(());
        }

        self.ensure_owner(&access).await?;
        access
            .grant(self.sequencer, address, missing)
            .await
            .map_err(|e| DeployError::remote(format!("grantRoles({address}, {missing})"), e))?;
        progress.changed = true;
        Ok(())
    }
}
