//! Post-sequence lock-down of the deploying credential.
//!
//! Renouncing strips the deployer's roles and then hands the access controller
//! to the admin, so the deployer can neither use nor re-grant the roles.

use std::time::Duration;

use alloy_core::primitives::Address;
use backon::{ConstantBuilder, Retryable};
use tokio::sync::Mutex;

use crate::access::AccessController;
use crate::capability::{CapabilityMask, RoleIntent};
use crate::context::RunContext;
use crate::error::RemoteError;
use crate::ledger::{Ledger, TxSequencer};
use crate::registry::Registry;

/// Default pause before the single retry of a failed renouncement.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The run did not ask for renouncement.
    NotRequested,
    /// The access controller was never created, so there is nothing to renounce.
    NoController,
    /// The deployer held no capabilities.
    NothingHeld,
    Renounced(CapabilityMask),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub renounce: bool,
    pub outcome: FinalizeOutcome,
    /// Owner of the access controller once renouncement went through.
    pub owner: Option<Address>,
    pub warnings: Vec<String>,
}

impl FinalizeReport {
    fn new(renounce: bool, outcome: FinalizeOutcome) -> Self {
        Self {
            renounce,
            outcome,
            owner: None,
            warnings: Vec::new(),
        }
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, FinalizeOutcome::Failed(_))
    }
}

pub struct Finalizer<'a, L> {
    ledger: &'a L,
    retry_delay: Duration,
}

impl<'a, L: Ledger> Finalizer<'a, L> {
    pub fn new(ledger: &'a L) -> Self {
        Self {
            ledger,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Strip the deployer's capabilities and hand the controller to the admin
    /// when `renounce` is set.
    ///
    /// Never fails: problems are reported in the returned outcome. Without a
    /// sequencer (the run stopped before syncing one) a fresh one is synced here.
    pub async fn finalize(
        &self,
        ctx: &RunContext,
        registry: Option<&Registry>,
        controller: &str,
        sequencer: Option<&mut TxSequencer>,
        intent: &mut RoleIntent,
        renounce: bool,
    ) -> FinalizeReport {
        if !renounce {
            tracing::info!("Renouncement not requested, deployer keeps its capabilities");
            return FinalizeReport::new(renounce, FinalizeOutcome::NotRequested);
        }

        let Some(record) = registry.and_then(|r| r.get(controller)) else {
            tracing::info!(controller, "Access controller was never created, nothing to renounce");
            return FinalizeReport::new(renounce, FinalizeOutcome::NoController);
        };
        let access = AccessController::new(self.ledger, record.address);

        let mut synced;
        let sequencer = match sequencer {
            Some(sequencer) => sequencer,
            None => match TxSequencer::sync(self.ledger, ctx.deployer).await {
                Ok(fresh) => {
                    synced = fresh;
                    &mut synced
                }
                Err(err) => {
                    return self.failure(renounce, format!("cannot sync deployer nonce: {err}"));
                }
            },
        };

        let (deployer, admin) = (ctx.deployer, ctx.admin);
        let sequencer = Mutex::new(sequencer);
        let observed = Mutex::new(CapabilityMask::EMPTY);
        let (sequencer, access, seen) = (&sequencer, &access, &observed);

        let result = (move || async move {
            let mut guard = sequencer.lock().await;
            let mut seen = seen.lock().await;
            access.renounce_all(&mut **guard, deployer, &mut seen).await?;
            access.hand_over(&mut **guard, deployer, admin).await
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(self.retry_delay)
                .with_max_times(1),
        )
        .sleep(tokio::time::sleep)
        .when(|e: &RemoteError| e.is_transient())
        .notify(|err: &RemoteError, dur: Duration| {
            tracing::warn!(error = %err, retry_in_ms = dur.as_millis() as u64, "Renouncement failed, retrying");
        })
        .await;

        // A retry after a lost receipt reads an empty mask, so report every bit
        // seen across attempts.
        let renounced = observed.into_inner();
        let owner = match result {
            Ok(owner) => owner,
            Err(err) => return self.failure(renounce, err.to_string()),
        };

        let mut report = if renounced.is_empty() {
            let mut report = FinalizeReport::new(renounce, FinalizeOutcome::NothingHeld);
            report
                .warnings
                .push(format!("deployer {deployer} held no capabilities at finalization"));
            report
        } else {
            intent.revoke(deployer, renounced);
            tracing::info!(deployer = %deployer, mask = %renounced, "Deployer capabilities renounced");
            FinalizeReport::new(renounce, FinalizeOutcome::Renounced(renounced))
        };
        report.owner = Some(owner);
        if owner != admin {
            report.warnings.push(format!(
                "access controller is owned by {owner}, not by the admin {admin}"
            ));
        }

        match access.current_mask(ctx.admin).await {
            Ok(mask) if mask.is_empty() => report.warnings.push(format!(
                "admin {} holds no capabilities after finalization",
                ctx.admin
            )),
            Ok(_) => {}
            Err(err) => report
                .warnings
                .push(format!("cannot read admin capabilities: {err}")),
        }

        for warning in &report.warnings {
            tracing::warn!("{warning}");
        }
        report
    }

    fn failure(&self, renounce: bool, reason: String) -> FinalizeReport {
        tracing::error!(reason = %reason, "Error during finalization and renouncement");
        let mut report = FinalizeReport::new(renounce, FinalizeOutcome::Failed(reason.clone()));
        report.warnings.push(format!("finalization failed: {reason}"));
        report
    }
}
