//! End-to-end runs of the orchestrator against the simulated ledger.
//!
//! Every test gets its own registry directory, so they run in parallel.
//! Run with: cargo test --test orchestrator_test

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use alloy_core::primitives::{Address, U256};
use anyhow::{Context, Result};
use lockstep_deploy::ledger::{Fault, FaultEffect, LedgerCall};
use lockstep_deploy::orchestrator::RunLog;
use lockstep_deploy::registry::Replace;
use lockstep_deploy::steps::{DeploySpec, Holder};
use lockstep_deploy::{
    Capability, CapabilityMask, ComponentKind, ComponentRecord, ErrorKind, FinalizeOutcome,
    Ledger, Orchestrator, Plan, PlanOptions, Policy, Registry, RunContext, RunMode, RunReport,
    RunState, RunStatus, SimulatedLedger, Step, StepStatus, TxSequencer, standard_plan,
};
use tempdir::TempDir;

const NETWORK: &str = "testnet";
const DEPLOYER: Address = Address::new([0xd1; 20]);
const ADMIN: Address = Address::new([0xad; 20]);
const STALE: Address = Address::new([0x5e; 20]);

/// Shared setup: a funded simulated ledger and a scratch registry directory.
struct TestContext {
    ledger: SimulatedLedger,
    dir: TempDir,
}

impl TestContext {
    fn new(prefix: &str) -> Self {
        let balance = U256::from(10u64).pow(U256::from(20u64));
        Self {
            ledger: SimulatedLedger::new().with_balance(DEPLOYER, balance),
            dir: TempDir::new(prefix).expect("Failed to create temp dir"),
        }
    }

    fn registry_dir(&self) -> &Path {
        self.dir.path()
    }

    fn context(&self, mode: RunMode, policy: Policy) -> RunContext {
        RunContext::new(NETWORK, DEPLOYER, ADMIN)
            .with_mode(mode)
            .with_policy(policy)
    }

    async fn run(&self, plan: &Plan, ctx: RunContext) -> RunReport {
        Orchestrator::new(&self.ledger, plan, self.registry_dir())
            .with_receipt_timeout(Duration::from_secs(1))
            .with_finalize_retry_delay(Duration::from_millis(10))
            .run(ctx)
            .await
    }

    async fn revokes(&self) -> usize {
        self.ledger
            .count(|call| matches!(call, LedgerCall::RevokeRoles { .. }))
            .await
    }

    /// The admin returns the controller to the deployer so a renounced run can resume.
    async fn hand_back(&self, controller: Address) {
        let mut admin = TxSequencer::sync(&self.ledger, ADMIN).await.unwrap();
        admin
            .send(
                &self.ledger,
                LedgerCall::TransferOwnership {
                    controller,
                    new_owner: DEPLOYER,
                },
            )
            .await
            .unwrap();
    }

    /// Overwrite the recorded address of `name` with one that has no code.
    fn record_stale(&self, name: &str, kind: ComponentKind) {
        let mut registry = Registry::open(self.registry_dir(), NETWORK).unwrap();
        registry.load().unwrap();
        let reuse = Policy {
            reuse: true,
            ..Default::default()
        };
        registry
            .put(
                &self.context(RunMode::Incremental, reuse),
                name,
                ComponentRecord::new(kind, STALE),
                Replace::Yes,
            )
            .unwrap();
    }
}

fn addresses(report: &RunReport) -> BTreeMap<String, Address> {
    report
        .components
        .iter()
        .map(|(name, record)| (name.clone(), record.address))
        .collect()
}

fn controller_of(report: &RunReport, plan: &Plan) -> Address {
    report
        .components
        .iter()
        .find(|(name, _)| *name == plan.controller)
        .map(|(_, record)| record.address)
        .expect("controller must be recorded")
}

fn failed_steps(log: &RunLog) -> usize {
    log.iter()
        .filter(|record| record.status == StepStatus::Failed)
        .count()
}

/// Controller plus one component per step after it.
fn three_step_plan() -> Plan {
    Plan::new(
        "Controller",
        vec![
            Step::new("controller", "Deploy the access controller")
                .deploy(DeploySpec::new("Controller", ComponentKind::AccessController))
                .grant(Holder::Deployer, &[Capability::PoolAdmin])
                .deploy(DeploySpec::new("Registry", ComponentKind::ProviderRegistry)),
            Step::new("treasury", "Deploy the treasury")
                .deploy(DeploySpec::new("Treasury", ComponentKind::Treasury)),
            Step::new("pool", "Deploy the lending pool")
                .deploy(DeploySpec::new("Pool", ComponentKind::LendingPool)),
        ],
    )
}

#[tokio::test]
async fn test_revert_in_second_step_aborts_and_renounces() {
    let test = TestContext::new("lockstep-revert");
    test.ledger
        .inject(Fault::on_create(
            ComponentKind::Treasury,
            FaultEffect::Revert("out of gas".into()),
        ))
        .await;

    let report = test
        .run(&three_step_plan(), test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(
        report.log.statuses(),
        vec![StepStatus::Ok, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(
        report.states,
        vec![
            RunState::Init,
            RunState::Running(0),
            RunState::Running(1),
            RunState::Aborted,
            RunState::Finalizing,
            RunState::Failed,
        ]
    );
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.status.exit_code(), 1);
    assert_eq!(report.log[1].error_kind, Some(ErrorKind::RemoteCallReverted));

    let finalize = report.finalize.as_ref().expect("finalizer must run");
    assert!(finalize.renounce);
    assert_eq!(
        finalize.outcome,
        FinalizeOutcome::Renounced(Capability::PoolAdmin.mask())
    );
    assert_eq!(test.revokes().await, 1);
    assert!(report.expenditure() > U256::ZERO);
}

#[tokio::test]
async fn test_finalizer_runs_once_for_failure_at_any_step() {
    let failing = [
        ComponentKind::ProviderRegistry,
        ComponentKind::Treasury,
        ComponentKind::LendingPool,
    ];

    for (step, kind) in failing.into_iter().enumerate() {
        let test = TestContext::new("lockstep-finalize-once");
        test.ledger
            .inject(Fault::on_create(kind, FaultEffect::Revert("boom".into())))
            .await;

        let report = test
            .run(&three_step_plan(), test.context(RunMode::Fresh, Policy::default()))
            .await;

        let finalizing = report
            .states
            .iter()
            .filter(|state| **state == RunState::Finalizing)
            .count();
        assert_eq!(finalizing, 1, "failure at step {step}");
        assert!(report.finalize.as_ref().is_some_and(|f| f.renounce));
        assert_eq!(test.revokes().await, 1, "failure at step {step}");
        assert_eq!(report.log[step].status, StepStatus::Failed);
        assert_eq!(failed_steps(&report.log), 1);
        assert_eq!(report.status, RunStatus::Failed);
    }
}

#[tokio::test]
async fn test_transport_failure_degrades_and_renounces() {
    let test = TestContext::new("lockstep-degraded");
    test.ledger
        .inject(Fault::on_create(
            ComponentKind::Treasury,
            FaultEffect::Transport("connection refused".into()),
        ))
        .await;

    let plan = three_step_plan();
    let report = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(
        report.states,
        vec![
            RunState::Init,
            RunState::Running(0),
            RunState::Running(1),
            RunState::Degraded,
            RunState::Finalizing,
            RunState::Failed,
        ]
    );
    assert_eq!(report.log[1].error_kind, Some(ErrorKind::FatalAbort));

    let finalize = report.finalize.as_ref().expect("finalizer must run");
    assert!(finalize.renounce);
    assert_eq!(
        finalize.outcome,
        FinalizeOutcome::Renounced(Capability::PoolAdmin.mask())
    );
    assert_eq!(finalize.owner, Some(ADMIN));
    assert_eq!(test.revokes().await, 1);
    assert_eq!(
        test.ledger.owner(controller_of(&report, &plan)).await.unwrap(),
        ADMIN
    );
}

#[tokio::test]
async fn test_secure_policy_requests_renounce_after_init_failure() {
    let policy = Policy {
        secure: true,
        ..Default::default()
    };

    for (policy, renounce) in [(Policy::default(), false), (policy, true)] {
        let test = TestContext::new("lockstep-secure");
        let _held = Registry::open(test.registry_dir(), NETWORK).unwrap();

        let report = test
            .run(&three_step_plan(), test.context(RunMode::Fresh, policy))
            .await;

        assert!(report.states.contains(&RunState::Degraded));
        let finalize = report.finalize.as_ref().expect("finalizer must run");
        assert_eq!(finalize.renounce, renounce);
        let outcome = if renounce {
            FinalizeOutcome::NoController
        } else {
            FinalizeOutcome::NotRequested
        };
        assert_eq!(finalize.outcome, outcome);
        assert_eq!(report.status, RunStatus::Failed);
    }
}

#[tokio::test]
async fn test_standard_plan_completes() {
    let test = TestContext::new("lockstep-standard");
    let plan = standard_plan(&PlanOptions::default());

    let report = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(report.status, RunStatus::Completed, "{:?}", report.errors);
    assert_eq!(report.final_state(), Some(RunState::Completed));
    assert!(report.log.iter().all(|r| r.status == StepStatus::Ok || r.id == "access-test"));
    assert_eq!(report.components.len(), plan.expected_components().len());
    assert!(!report.audit.as_ref().is_some_and(|a| a.has_findings()));

    // The final step was reached, so the deployer gave up its roles.
    let deployer_roles = report
        .roles
        .iter()
        .find(|(label, _, _)| label == "deployer")
        .map(|(_, _, mask)| *mask);
    assert_eq!(deployer_roles, Some(CapabilityMask::EMPTY));
    assert!(matches!(
        report.finalize.as_ref().map(|f| &f.outcome),
        Some(FinalizeOutcome::Renounced(_))
    ));
}

#[tokio::test]
async fn test_incremental_rerun_is_idempotent() -> Result<()> {
    let test = TestContext::new("lockstep-idempotent");
    let plan = standard_plan(&PlanOptions::default());

    let first = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;
    assert_eq!(first.status, RunStatus::Completed, "{:?}", first.errors);
    let controller = controller_of(&first, &plan);

    test.hand_back(controller).await;
    let second = test
        .run(&plan, test.context(RunMode::Incremental, Policy::default()))
        .await;
    assert_eq!(second.status, RunStatus::Completed, "{:?}", second.errors);

    test.hand_back(controller).await;
    let third = test
        .run(&plan, test.context(RunMode::Incremental, Policy::default()))
        .await;
    assert_eq!(third.status, RunStatus::Completed, "{:?}", third.errors);

    // Same identities, no new creations and no duplicate records.
    assert_eq!(addresses(&first), addresses(&second));
    assert_eq!(addresses(&second), addresses(&third));
    assert_eq!(test.ledger.created(ComponentKind::AccessController).await, 1);
    assert_eq!(test.ledger.created(ComponentKind::RewardPool).await, 2);
    assert_eq!(second.audit.as_ref().map(|a| a.multi_deployed), Some(0));

    // Identical final role masks per holder.
    assert_eq!(second.roles, third.roles);
    assert_eq!(first.roles, second.roles);

    let registry = Registry::open(test.registry_dir(), NETWORK)
        .context("registry should be released after the run")?;
    assert_eq!(registry.len(), plan.expected_components().len());
    Ok(())
}

#[tokio::test]
async fn test_resume_refused_while_admin_owns_controller() {
    let test = TestContext::new("lockstep-handed-over");
    let plan = three_step_plan();

    let first = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;
    assert_eq!(first.status, RunStatus::Completed, "{:?}", first.errors);
    assert_eq!(first.finalize.as_ref().and_then(|f| f.owner), Some(ADMIN));
    let grants = |call: &LedgerCall| matches!(call, LedgerCall::GrantRoles { .. });
    let granted = test.ledger.count(grants).await;

    let second = test
        .run(&plan, test.context(RunMode::Incremental, Policy::default()))
        .await;

    assert_eq!(second.status, RunStatus::Failed);
    assert_eq!(
        second.log.statuses(),
        vec![StepStatus::Failed, StepStatus::Skipped, StepStatus::Skipped]
    );
    assert!(
        second.log[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("must be handed back"))
    );
    // The deployer could not grant itself anything.
    assert_eq!(test.ledger.count(grants).await, granted);
    assert_eq!(addresses(&first), addresses(&second));
    assert_eq!(test.ledger.created(ComponentKind::AccessController).await, 1);
}

#[tokio::test]
async fn test_fresh_rerun_starts_over() {
    let test = TestContext::new("lockstep-fresh-rerun");
    let plan = three_step_plan();

    let first = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;
    let second = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(first.status, RunStatus::Completed, "{:?}", first.errors);
    assert_eq!(second.status, RunStatus::Completed, "{:?}", second.errors);
    assert_ne!(addresses(&first), addresses(&second));
    assert_eq!(test.ledger.created(ComponentKind::Treasury).await, 2);
}

#[tokio::test]
async fn test_placeholder_escalates_under_strict() {
    let options = PlanOptions {
        mock_price_oracle: true,
        ..Default::default()
    };
    let plan = standard_plan(&options);

    let lenient = TestContext::new("lockstep-lenient");
    let report = lenient
        .run(&plan, lenient.context(RunMode::Fresh, Policy::default()))
        .await;
    assert_eq!(report.status, RunStatus::Completed, "{:?}", report.errors);
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("placeholder component detected: MockPriceOracle"))
    );

    let strict = TestContext::new("lockstep-strict");
    let policy = Policy {
        strict: true,
        ..Default::default()
    };
    let report = strict.run(&plan, strict.context(RunMode::Fresh, policy)).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(failed_steps(&report.log), 0);
    assert!(
        report
            .errors
            .iter()
            .any(|(kind, _)| *kind == ErrorKind::ConsistencyWarning)
    );
}

#[tokio::test]
async fn test_dropped_receipt_lookup_is_retried() {
    let test = TestContext::new("lockstep-drop");
    test.ledger
        .inject(Fault::on_create(ComponentKind::Treasury, FaultEffect::DropReceipt).times(1))
        .await;

    let report = test
        .run(&three_step_plan(), test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(report.status, RunStatus::Completed, "{:?}", report.errors);
    assert_eq!(test.ledger.created(ComponentKind::Treasury).await, 1);
    assert!(addresses(&report).contains_key("Treasury"));
}

#[tokio::test]
async fn test_lost_receipt_is_reconciled_without_second_creation() {
    let test = TestContext::new("lockstep-reconcile");
    let plan = standard_plan(&PlanOptions::default());
    test.ledger
        .inject(Fault::on_create(ComponentKind::Treasury, FaultEffect::LoseReceipt).times(1))
        .await;

    let first = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;
    assert_eq!(first.status, RunStatus::Failed);
    assert!(first.states.contains(&RunState::Degraded));
    assert!(first.finalize.as_ref().is_some_and(|f| f.renounce));
    {
        let mut registry = Registry::open(test.registry_dir(), NETWORK).unwrap();
        registry.load().unwrap();
        assert!(registry.pending("TreasuryImpl").is_some());
        assert!(registry.get("TreasuryImpl").is_none());
    }

    test.ledger.recover_receipts().await;
    test.hand_back(controller_of(&first, &plan)).await;
    let second = test
        .run(&plan, test.context(RunMode::Incremental, Policy::default()))
        .await;
    assert_eq!(second.status, RunStatus::Completed, "{:?}", second.errors);
    assert_eq!(test.ledger.created(ComponentKind::Treasury).await, 1);
    assert!(addresses(&second).contains_key("TreasuryImpl"));
}

#[tokio::test]
async fn test_locked_registry_fails_fast() {
    let test = TestContext::new("lockstep-locked");
    let _held = Registry::open(test.registry_dir(), NETWORK).unwrap();

    let report = test
        .run(&three_step_plan(), test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.states,
        vec![
            RunState::Init,
            RunState::Degraded,
            RunState::Finalizing,
            RunState::Failed,
        ]
    );
    assert!(report.errors[0].1.contains("locked"));
    assert!(test.ledger.executed().await.is_empty());
}

#[tokio::test]
async fn test_alias_conflict_rejected_at_init() {
    let test = TestContext::new("lockstep-alias");
    let plan = Plan::new(
        "Controller",
        vec![
            Step::new("controller", "Deploy the access controller")
                .deploy(DeploySpec::new("Controller", ComponentKind::AccessController))
                .deploy(DeploySpec::new("Gateway", ComponentKind::WethGateway))
                .set_address(Capability::WethGateway, "Gateway")
                .set_address(Capability::ReferralRegistry, "Gateway"),
        ],
    );

    let report = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.log.statuses(), vec![StepStatus::Skipped]);
    assert_eq!(report.errors[0].0, ErrorKind::FatalAbort);
    assert!(test.ledger.executed().await.is_empty());
}

#[tokio::test]
async fn test_invalid_context_rejected_at_init() {
    let test = TestContext::new("lockstep-context");
    let ctx = RunContext::new(NETWORK, DEPLOYER, DEPLOYER);

    let report = test.run(&three_step_plan(), ctx).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.states.contains(&RunState::Degraded));
    assert!(test.ledger.executed().await.is_empty());
}

#[tokio::test]
async fn test_verify_writes_manifest() -> Result<()> {
    let test = TestContext::new("lockstep-verify");
    let plan = standard_plan(&PlanOptions {
        mock_price_oracle: true,
        ..Default::default()
    });
    let policy = Policy {
        verify: true,
        ..Default::default()
    };

    let report = test.run(&plan, test.context(RunMode::Fresh, policy)).await;
    assert_eq!(report.status, RunStatus::Completed, "{:?}", report.errors);

    let path = report
        .verification_manifest
        .clone()
        .context("manifest should be written")?;
    assert_eq!(path, test.registry_dir().join("testnet.verify.json"));

    let entries: Vec<serde_json::Value> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    // The placeholder oracle is left out.
    assert_eq!(entries.len(), report.components.len() - 1);
    assert!(
        entries
            .iter()
            .all(|entry| entry["name"] != "MockPriceOracle")
    );
    Ok(())
}

#[tokio::test]
async fn test_reuse_adopts_external_component() {
    let test = TestContext::new("lockstep-adopt");

    // An oracle router deployed earlier by someone else.
    let other = Address::new([0x77; 20]);
    let mut sequencer = TxSequencer::sync(&test.ledger, other).await.unwrap();
    let external = sequencer
        .send(
            &test.ledger,
            LedgerCall::Create {
                kind: ComponentKind::OracleRouter,
                args: vec![],
            },
        )
        .await
        .unwrap()
        .contract_address
        .unwrap();

    let plan = standard_plan(&PlanOptions::default());
    let policy = Policy {
        reuse: true,
        ..Default::default()
    };
    let ctx = test
        .context(RunMode::Fresh, policy)
        .with_external("OracleRouter", external);

    let report = test.run(&plan, ctx).await;

    assert_eq!(report.status, RunStatus::Completed, "{:?}", report.errors);
    assert_eq!(addresses(&report).get("OracleRouter"), Some(&external));
    assert_eq!(test.ledger.created(ComponentKind::OracleRouter).await, 1);
}

#[tokio::test]
async fn test_stale_record_fails_without_reuse() {
    let test = TestContext::new("lockstep-stale");
    let plan = three_step_plan();

    let first = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;
    assert_eq!(first.status, RunStatus::Completed, "{:?}", first.errors);
    test.record_stale("Treasury", ComponentKind::Treasury);
    test.hand_back(controller_of(&first, &plan)).await;

    let second = test
        .run(&plan, test.context(RunMode::Incremental, Policy::default()))
        .await;

    assert_eq!(second.status, RunStatus::Failed);
    assert_eq!(
        second.log.statuses(),
        vec![StepStatus::Ok, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(second.log[1].error_kind, Some(ErrorKind::FatalAbort));
    assert!(
        second.log[1]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("has no code"))
    );
    assert!(second.states.contains(&RunState::Degraded));
    assert_eq!(addresses(&second).get("Treasury"), Some(&STALE));
    assert_eq!(test.ledger.created(ComponentKind::Treasury).await, 1);
}

#[tokio::test]
async fn test_stale_record_redeployed_under_reuse() {
    let test = TestContext::new("lockstep-stale-reuse");
    let plan = three_step_plan();

    let first = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;
    assert_eq!(first.status, RunStatus::Completed, "{:?}", first.errors);
    test.record_stale("Treasury", ComponentKind::Treasury);
    test.hand_back(controller_of(&first, &plan)).await;

    let policy = Policy {
        reuse: true,
        ..Default::default()
    };
    let second = test
        .run(&plan, test.context(RunMode::Incremental, policy))
        .await;

    assert_eq!(second.status, RunStatus::Completed, "{:?}", second.errors);
    assert_eq!(second.log[1].status, StepStatus::Ok);
    let treasury = addresses(&second).get("Treasury").copied();
    assert!(treasury.is_some_and(|address| address != STALE));
    assert_ne!(treasury, addresses(&first).get("Treasury").copied());
    assert!(test.ledger.has_code(treasury.unwrap()).await.unwrap());
    assert_eq!(test.ledger.created(ComponentKind::Treasury).await, 2);
    assert_eq!(second.audit.as_ref().map(|a| a.multi_deployed), Some(0));
}

#[tokio::test]
async fn test_unjournaled_creation_is_not_reconciled() {
    let test = TestContext::new("lockstep-unreconciled");
    {
        let mut registry = Registry::open(test.registry_dir(), NETWORK).unwrap();
        registry
            .begin_pending("Controller", ComponentKind::AccessController, 0)
            .unwrap();
    }
    // Sequence number 0 was consumed, but by which transaction is unknown.
    let mut sequencer = TxSequencer::sync(&test.ledger, DEPLOYER).await.unwrap();
    sequencer
        .send(
            &test.ledger,
            LedgerCall::Create {
                kind: ComponentKind::Treasury,
                args: vec![],
            },
        )
        .await
        .unwrap();

    let report = test
        .run(
            &three_step_plan(),
            test.context(RunMode::Incremental, Policy::default()),
        )
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.log[0].status, StepStatus::Failed);
    assert_eq!(report.log[0].error_kind, Some(ErrorKind::FatalAbort));
    assert!(
        report.log[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("cannot be reconciled"))
    );
    assert_eq!(test.ledger.created(ComponentKind::AccessController).await, 0);
    assert_eq!(
        report.finalize.as_ref().map(|f| f.outcome.clone()),
        Some(FinalizeOutcome::NoController)
    );
}

#[tokio::test]
async fn test_reverted_interrupted_creation_is_reissued() {
    let test = TestContext::new("lockstep-reissue");
    test.ledger
        .inject(Fault::on_create(
            ComponentKind::AccessController,
            FaultEffect::RevertMined("out of gas".into()),
        ))
        .await;
    {
        let mut registry = Registry::open(test.registry_dir(), NETWORK).unwrap();
        registry
            .begin_pending("Controller", ComponentKind::AccessController, 0)
            .unwrap();
        let mut sequencer = TxSequencer::sync(&test.ledger, DEPLOYER).await.unwrap();
        let tx_hash = sequencer
            .submit(
                &test.ledger,
                LedgerCall::Create {
                    kind: ComponentKind::AccessController,
                    args: vec![],
                },
            )
            .await
            .unwrap();
        registry.record_pending_hash("Controller", tx_hash).unwrap();
    }
    test.ledger.clear_faults().await;

    let report = test
        .run(
            &three_step_plan(),
            test.context(RunMode::Incremental, Policy::default()),
        )
        .await;

    assert_eq!(report.status, RunStatus::Completed, "{:?}", report.errors);
    assert_eq!(report.log[0].status, StepStatus::Ok);
    assert_eq!(test.ledger.created(ComponentKind::AccessController).await, 1);
    assert_eq!(test.ledger.nonce(DEPLOYER).await.unwrap(), 8);
}

#[tokio::test]
async fn test_missing_expected_roles_fail_access_check() {
    let test = TestContext::new("lockstep-access-check");
    let plan = Plan::new(
        "Controller",
        vec![
            Step::new("controller", "Deploy the access controller")
                .deploy(DeploySpec::new("Controller", ComponentKind::AccessController))
                .grant(Holder::Deployer, &[Capability::PoolAdmin]),
            Step::new("access-test", "Access test")
                .expect_roles(Holder::Deployer, &[Capability::PoolAdmin])
                .expect_roles(Holder::Admin, &[Capability::EmergencyAdmin]),
        ],
    );

    let report = test
        .run(&plan, test.context(RunMode::Fresh, Policy::default()))
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.log.statuses(),
        vec![StepStatus::Ok, StepStatus::Failed]
    );
    assert_eq!(report.log[1].error_kind, Some(ErrorKind::FatalAbort));
    assert!(
        report.log[1]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("missing expected capabilities"))
    );
    assert!(report.finalize.as_ref().is_some_and(|f| f.renounce));
}
