//! Run state machine.
//!
//! ```text
//! Init -> Running(0) -> ... -> Running(n-1) ---------------> Finalizing -> Completed
//!             |                                     ^                  \-> Failed
//!             +-> Aborted  (revert, duplicate) -----+
//!             +-> Degraded (anything else) ---------+
//! ```
//!
//! The finalizer runs exactly once per run whatever the outcome. It renounces
//! when a step failed or the last step was reached, and always under the
//! secure policy. Resuming a renounced run needs the admin to hand the access
//! controller back to the deployer first. The auditor runs afterwards and,
//! under the strict policy, turns a nominal success into a failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_core::primitives::{Address, U256};
use derive_more::Deref;
use serde::Serialize;

use crate::audit::{AuditReport, Auditor};
use crate::capability::{CapabilityMask, RoleIntent, validate_flag_table};
use crate::context::{RunContext, RunMode};
use crate::error::{DeployError, ErrorKind, Result};
use crate::finalizer::{DEFAULT_RETRY_DELAY, FinalizeOutcome, FinalizeReport, Finalizer};
use crate::ledger::{DEFAULT_RECEIPT_TIMEOUT, Ledger, TxSequencer};
use crate::registry::{ComponentRecord, Registry};
use crate::steps::{Plan, StepExecutor, StepResult, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Init,
    Running(usize),
    Aborted,
    Degraded,
    Finalizing,
    Completed,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Running(index) => write!(f, "running({index})"),
            Self::Aborted => f.write_str("aborted"),
            Self::Degraded => f.write_str("degraded"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Completed => 0,
            Self::Failed => 1,
        }
    }
}

/// One entry of the run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub index: usize,
    pub id: String,
    pub status: StepStatus,
    /// Names and addresses written by the step.
    pub produced: Vec<(String, Address)>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl StepRecord {
    fn from_result(index: usize, id: &str, result: &StepResult) -> Self {
        Self {
            index,
            id: id.to_string(),
            status: result.status,
            produced: result
                .produced
                .iter()
                .map(|(name, record)| (name.clone(), record.address))
                .collect(),
            error: result.error.as_ref().map(ToString::to_string),
            error_kind: result.error.as_ref().map(DeployError::kind),
        }
    }

    fn skipped(index: usize, id: &str) -> Self {
        Self::from_result(index, id, &StepResult::skipped())
    }

    /// Comma-separated produced addresses, for log lines.
    pub fn identity(&self) -> String {
        self.produced
            .iter()
            .map(|(name, address)| format!("{name}={address}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Append-only log of step outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref)]
pub struct RunLog(Vec<StepRecord>);

impl RunLog {
    fn push(&mut self, record: StepRecord) {
        tracing::info!(
            index = record.index,
            name = %record.id,
            status = %record.status,
            identity = %record.identity(),
            "Step finished"
        );
        self.0.push(record);
    }

    pub fn statuses(&self) -> Vec<StepStatus> {
        self.0.iter().map(|record| record.status).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationEntry {
    pub name: String,
    pub kind: String,
    pub address: Address,
}

/// Everything a run produced, for the summary and for callers.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub network: String,
    pub mode: RunMode,
    pub states: Vec<RunState>,
    pub log: RunLog,
    pub finalize: Option<FinalizeReport>,
    pub audit: Option<AuditReport>,
    pub status: RunStatus,
    pub warnings: Vec<String>,
    pub errors: Vec<(ErrorKind, String)>,
    pub start_balance: U256,
    pub end_balance: U256,
    /// Registry contents at the end of the run, in insertion order.
    pub components: Vec<(String, ComponentRecord)>,
    /// Ledger role masks of the deployer and the admin at the end of the run.
    pub roles: Vec<(String, Address, CapabilityMask)>,
    pub verification_manifest: Option<PathBuf>,
}

impl RunReport {
    fn new(ctx: &RunContext) -> Self {
        Self {
            network: ctx.network.clone(),
            mode: ctx.mode,
            states: Vec::new(),
            log: RunLog::default(),
            finalize: None,
            audit: None,
            status: RunStatus::Failed,
            warnings: Vec::new(),
            errors: Vec::new(),
            start_balance: U256::ZERO,
            end_balance: U256::ZERO,
            components: Vec::new(),
            roles: Vec::new(),
            verification_manifest: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        tracing::debug!(state = %state, "Run state");
        self.states.push(state);
    }

    fn warn(&mut self, warning: String) {
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    fn error(&mut self, err: &DeployError) {
        tracing::error!(kind = %err.kind(), error = %err, "Run error");
        self.errors.push((err.kind(), err.to_string()));
    }

    /// Wei spent by the deployer over the run.
    pub fn expenditure(&self) -> U256 {
        self.start_balance.saturating_sub(self.end_balance)
    }

    pub fn final_state(&self) -> Option<RunState> {
        self.states.last().copied()
    }
}

/// Sequences a plan's steps against a ledger and a network registry.
pub struct Orchestrator<'a, L> {
    ledger: &'a L,
    plan: &'a Plan,
    registry_dir: PathBuf,
    receipt_timeout: Duration,
    finalize_retry_delay: Duration,
}

impl<'a, L: Ledger> Orchestrator<'a, L> {
    pub fn new(ledger: &'a L, plan: &'a Plan, registry_dir: impl AsRef<Path>) -> Self {
        Self {
            ledger,
            plan,
            registry_dir: registry_dir.as_ref().to_path_buf(),
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            finalize_retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn with_finalize_retry_delay(mut self, delay: Duration) -> Self {
        self.finalize_retry_delay = delay;
        self
    }

    /// Execute one run. Never returns early: every outcome ends in a report.
    pub async fn run(&self, mut ctx: RunContext) -> RunReport {
        let mut report = RunReport::new(&ctx);
        let mut registry: Option<Registry> = None;
        let mut sequencer: Option<TxSequencer> = None;
        let mut intent = RoleIntent::default();

        let mut step_failed = false;
        let mut failed = false;
        let mut reached_final_step = false;

        report.enter(RunState::Init);
        let init = self
            .init(&mut ctx, &mut registry, &mut sequencer, &mut report)
            .await;

        match (init, registry.as_mut(), sequencer.as_mut()) {
            (Ok(()), Some(registry), Some(sequencer)) => {
                let last = self.plan.steps.len().saturating_sub(1);
                for (index, step) in self.plan.steps.iter().enumerate() {
                    report.enter(RunState::Running(index));
                    reached_final_step = index == last;
                    tracing::info!(index, name = %step.id, "{}", step.description);

                    let result = StepExecutor::new(
                        &ctx,
                        self.ledger,
                        registry,
                        sequencer,
                        &mut intent,
                        &self.plan.controller,
                    )
                    .run(step)
                    .await;
                    report.log.push(StepRecord::from_result(index, &step.id, &result));

                    if let Some(err) = result.error {
                        report.error(&err);
                        failed = true;
                        step_failed = true;
                        match err.kind() {
                            ErrorKind::DuplicateComponent | ErrorKind::RemoteCallReverted => {
                                report.enter(RunState::Aborted);
                            }
                            _ => report.enter(RunState::Degraded),
                        }
                        for (rest, step) in self.plan.steps.iter().enumerate().skip(index + 1) {
                            report.log.push(StepRecord::skipped(rest, &step.id));
                        }
                        break;
                    }
                }
                if self.plan.steps.is_empty() {
                    reached_final_step = true;
                }
            }
            (init, _, _) => {
                let err = init.err().unwrap_or_else(|| {
                    DeployError::InvalidContext("run initialization did not complete".into())
                });
                report.error(&err);
                failed = true;
                report.enter(RunState::Degraded);
                for (index, step) in self.plan.steps.iter().enumerate() {
                    report.log.push(StepRecord::skipped(index, &step.id));
                }
            }
        }

        report.enter(RunState::Finalizing);
        let renounce = ctx.policy.secure || reached_final_step || step_failed;
        let finalize = Finalizer::new(self.ledger)
            .with_retry_delay(self.finalize_retry_delay)
            .finalize(
                &ctx,
                registry.as_ref(),
                &self.plan.controller,
                sequencer.as_mut(),
                &mut intent,
                renounce,
            )
            .await;
        for warning in &finalize.warnings {
            report.warnings.push(warning.clone());
        }
        if let FinalizeOutcome::Failed(reason) = &finalize.outcome {
            report.error(&DeployError::FinalizeFailed(reason.clone()));
        }
        report.finalize = Some(finalize);

        if let Some(registry) = registry.as_ref() {
            let audit = Auditor::for_plan(self.plan).audit(registry);
            for warning in audit.warnings() {
                report.warn(warning);
            }
            if ctx.policy.strict && audit.has_findings() && !failed {
                let err = DeployError::ConsistencyWarning(
                    "warnings are present under the strict policy".into(),
                );
                report.error(&err);
                failed = true;
            }
            report.audit = Some(audit);

            self.check_roles(&ctx, registry, &intent, &mut report).await;
            report.components = registry
                .ordered()
                .into_iter()
                .map(|(name, record)| (name.to_string(), record.clone()))
                .collect();
        }

        match self.ledger.balance(ctx.deployer).await {
            Ok(balance) => report.end_balance = balance,
            Err(err) => report.warn(format!("cannot read deployer end balance: {err}")),
        }

        if !failed && ctx.policy.verify {
            match self.write_verification_manifest(&ctx, &report.components) {
                Ok(path) => report.verification_manifest = Some(path),
                Err(err) => report.warn(format!("cannot write verification manifest: {err}")),
            }
        }

        let (state, status) = if failed {
            (RunState::Failed, RunStatus::Failed)
        } else {
            (RunState::Completed, RunStatus::Completed)
        };
        report.enter(state);
        report.status = status;
        tracing::info!(network = %ctx.network, status = %status, "Deployment run finished");
        report
    }

    async fn init(
        &self,
        ctx: &mut RunContext,
        registry: &mut Option<Registry>,
        sequencer: &mut Option<TxSequencer>,
        report: &mut RunReport,
    ) -> Result<()> {
        ctx.validate()?;
        validate_flag_table()?;
        self.plan.validate()?;

        let mut opened = Registry::open(&self.registry_dir, &ctx.network)?;
        match ctx.mode {
            RunMode::Fresh => opened.reset()?,
            RunMode::Incremental => {
                opened.load()?;
                tracing::info!(
                    network = %ctx.network,
                    components = opened.len(),
                    "Incremental mode, reusing recorded components"
                );
            }
        }

        if let (Some(stored), Some(current)) = (opened.config_hash(), ctx.config_hash.as_deref()) {
            if stored != current {
                report.warn(format!(
                    "deployment configuration changed since the registry was written ({stored} -> {current})"
                ));
            }
        }
        opened.set_config_hash(ctx.config_hash.clone())?;
        *registry = Some(opened);

        let synced = TxSequencer::sync(self.ledger, ctx.deployer)
            .await
            .map_err(|e| DeployError::remote("getTransactionCount", e))?
            .with_receipt_timeout(self.receipt_timeout);
        *sequencer = Some(synced);

        ctx.start_balance = self
            .ledger
            .balance(ctx.deployer)
            .await
            .map_err(|e| DeployError::remote("getBalance", e))?;
        report.start_balance = ctx.start_balance;
        tracing::info!(deployer = %ctx.deployer, balance = %ctx.start_balance, "Deployment started");
        Ok(())
    }

    /// Compare the locally mirrored intent with the controller's state and
    /// snapshot the deployer's and admin's masks.
    async fn check_roles(
        &self,
        ctx: &RunContext,
        registry: &Registry,
        intent: &RoleIntent,
        report: &mut RunReport,
    ) {
        let Some(controller) = registry.get(&self.plan.controller) else {
            return;
        };

        for (holder, expected) in intent.iter() {
            match self.ledger.role_mask(controller.address, *holder).await {
                Ok(actual) if actual != *expected => report.warn(format!(
                    "role drift for {holder}: expected {expected}, ledger holds {actual}"
                )),
                Ok(_) => {}
                Err(err) => report.warn(format!("cannot read roles of {holder}: {err}")),
            }
        }

        for (label, holder) in [("deployer", ctx.deployer), ("admin", ctx.admin)] {
            if let Ok(mask) = self.ledger.role_mask(controller.address, holder).await {
                report.roles.push((label.to_string(), holder, mask));
            }
        }
    }

    fn write_verification_manifest(
        &self,
        ctx: &RunContext,
        components: &[(String, ComponentRecord)],
    ) -> Result<PathBuf> {
        let entries: Vec<VerificationEntry> = components
            .iter()
            .filter(|(_, record)| !record.placeholder)
            .map(|(name, record)| VerificationEntry {
                name: name.clone(),
                kind: record.kind.clone(),
                address: record.address,
            })
            .collect();

        let path = self.registry_dir.join(format!("{}.verify.json", ctx.network));
        std::fs::write(&path, serde_json::to_string_pretty(&entries)?)?;
        tracing::info!(path = %path.display(), count = entries.len(), "Verification manifest written");
        Ok(path)
    }
}
