//! lockstep-deploy - Resumable, role-aware deployment of a lending protocol.
//!
//! A deployment is a [`Plan`] of ordered steps. The [`Orchestrator`] runs the
//! steps against a [`Ledger`], records every created component in a per-network
//! [`Registry`], and always finishes by stripping the deploying credential of
//! its capabilities when the run requires it.

pub mod access;
pub mod audit;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod finalizer;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod steps;

pub use access::AccessController;
pub use audit::{AuditReport, Auditor};
pub use capability::{Capability, CapabilityMask, RoleIntent};
pub use config::{CONFIG_FILENAME, DeployConfig, DeploymentConfigHash};
pub use context::{Policy, RunContext, RunMode};
pub use error::{DeployError, ErrorKind, RemoteError, Result};
pub use finalizer::{FinalizeOutcome, FinalizeReport, Finalizer};
pub use ledger::{ArtifactStore, Ledger, RpcLedger, SimulatedLedger, TxSequencer};
pub use orchestrator::{Orchestrator, RunReport, RunState, RunStatus};
pub use registry::{ComponentKind, ComponentRecord, Registry};
pub use report::{print_summary, render_summary};
pub use steps::standard::{PlanOptions, standard_plan};
pub use steps::{Plan, Step, StepStatus};
