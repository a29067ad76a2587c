//! Typed deployment steps and the ordered plan they form.
//!
//! A [`Step`] is a list of declarative [`Action`]s. Executing a step twice
//! against the same registry and ledger state changes nothing the second time,
//! except for [`Action::Invoke`] setters which are always re-sent.

use std::collections::BTreeSet;

use alloy_core::primitives::{Address, U256};

use crate::capability::{Capability, check_alias_usage};
use crate::error::{DeployError, Result};
use crate::registry::{ComponentKind, ComponentRecord};

mod exec;
pub mod standard;

pub use exec::StepExecutor;

/// A capability holder, resolved against the run context or the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    Deployer,
    Admin,
    Component(String),
}

impl Holder {
    pub fn component(name: impl Into<String>) -> Self {
        Self::Component(name.into())
    }
}

/// A constructor or setter argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Address of a component recorded by an earlier action.
    Component(String),
    Deployer,
    Admin,
    Address(Address),
    Uint(U256),
    Bool(bool),
}

impl Arg {
    pub fn component(name: impl Into<String>) -> Self {
        Self::Component(name.into())
    }

    pub fn uint(value: u64) -> Self {
        Self::Uint(U256::from(value))
    }
}

/// Ensure a named component exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySpec {
    pub name: String,
    pub kind: ComponentKind,
    pub args: Vec<Arg>,
    /// Stand-in component that must not survive a strict run.
    pub placeholder: bool,
    /// May be taken from the configured external components under `reuse`.
    pub adoptable: bool,
}

impl DeploySpec {
    pub fn new(name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            args: Vec::new(),
            placeholder: kind.is_placeholder(),
            adoptable: false,
        }
    }

    pub fn args(mut self, args: Vec<Arg>) -> Self {
        self.args = args;
        self
    }

    pub fn adoptable(mut self) -> Self {
        self.adoptable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Deploy(DeploySpec),
    /// Bind the address slot of `flag` on the access controller.
    SetAddress { flag: Capability, component: String },
    Grant { holder: Holder, flags: Vec<Capability> },
    /// Configuration setter on an existing component.
    Invoke {
        component: String,
        signature: String,
        args: Vec<Arg>,
    },
    /// Read-only check that `holder` holds every flag.
    ExpectRoles { holder: Holder, flags: Vec<Capability> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub actions: Vec<Action>,
}

impl Step {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            actions: Vec::new(),
        }
    }

    pub fn deploy(mut self, spec: DeploySpec) -> Self {
        self.actions.push(Action::Deploy(spec));
        self
    }

    pub fn set_address(mut self, flag: Capability, component: impl Into<String>) -> Self {
        self.actions.push(Action::SetAddress {
            flag,
            component: component.into(),
        });
        self
    }

    pub fn grant(mut self, holder: Holder, flags: &[Capability]) -> Self {
        self.actions.push(Action::Grant {
            holder,
            flags: flags.to_vec(),
        });
        self
    }

    pub fn invoke(
        mut self,
        component: impl Into<String>,
        signature: impl Into<String>,
        args: Vec<Arg>,
    ) -> Self {
        self.actions.push(Action::Invoke {
            component: component.into(),
            signature: signature.into(),
            args,
        });
        self
    }

    pub fn expect_roles(mut self, holder: Holder, flags: &[Capability]) -> Self {
        self.actions.push(Action::ExpectRoles {
            holder,
            flags: flags.to_vec(),
        });
        self
    }

    /// Logical names this step produces; its idempotency key.
    pub fn produces(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                Action::Deploy(spec) => Some(spec.name.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    /// The step ran and changed something.
    Ok,
    /// Nothing to do, or not run because an earlier step failed.
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct StepResult {
    pub status: StepStatus,
    /// Records written by this step, including partial progress before a failure.
    pub produced: Vec<(String, ComponentRecord)>,
    pub error: Option<DeployError>,
}

impl StepResult {
    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            produced: Vec::new(),
            error: None,
        }
    }
}

/// An ordered list of steps sharing one access controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Logical name of the access-controller component.
    pub controller: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(controller: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            controller: controller.into(),
            steps,
        }
    }

    /// Every logical name the plan produces, in order.
    pub fn expected_components(&self) -> Vec<&str> {
        self.steps.iter().flat_map(|step| step.produces()).collect()
    }

    /// Flags whose address slot the plan binds.
    pub fn bound_flags(&self) -> Vec<Capability> {
        self.steps
            .iter()
            .flat_map(|step| &step.actions)
            .filter_map(|action| match action {
                Action::SetAddress { flag, .. } => Some(*flag),
                _ => None,
            })
            .collect()
    }

    /// Check alias usage and that every reference points at a component
    /// produced earlier in the plan.
    pub fn validate(&self) -> Result<()> {
        check_alias_usage(self.bound_flags())?;

        let mut step_ids = BTreeSet::new();
        let mut produced: BTreeSet<&str> = BTreeSet::new();

        for step in &self.steps {
            if !step_ids.insert(step.id.as_str()) {
                return Err(DeployError::InvalidPlan(format!(
                    "step id `{}` is used twice",
                    step.id
                )));
            }

            for action in &step.actions {
                let refs = references(action);
                for name in &refs {
                    if !produced.contains(name) {
                        return Err(DeployError::InvalidPlan(format!(
                            "step `{}` uses `{name}` before it is produced",
                            step.id
                        )));
                    }
                }

                let needs_controller = matches!(
                    action,
                    Action::SetAddress { .. } | Action::Grant { .. } | Action::ExpectRoles { .. }
                );
                if needs_controller && !produced.contains(self.controller.as_str()) {
                    return Err(DeployError::InvalidPlan(format!(
                        "step `{}` needs the access controller `{}` before it is produced",
                        step.id, self.controller
                    )));
                }

                if let Action::Deploy(spec) = action {
                    if !produced.insert(spec.name.as_str()) {
                        return Err(DeployError::InvalidPlan(format!(
                            "component `{}` is produced twice",
                            spec.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Component names an action reads from the registry.
fn references(action: &Action) -> Vec<&str> {
    fn from_args(args: &[Arg]) -> Vec<&str> {
        args.iter()
            .filter_map(|arg| match arg {
                Arg::Component(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    fn from_holder(holder: &Holder) -> Vec<&str> {
        match holder {
            Holder::Component(name) => vec![name.as_str()],
            _ => vec![],
        }
    }

    match action {
        Action::Deploy(spec) => from_args(&spec.args),
        Action::SetAddress { component, .. } => vec![component.as_str()],
        Action::Grant { holder, .. } | Action::ExpectRoles { holder, .. } => from_holder(holder),
        Action::Invoke {
            component, args, ..
        } => {
            let mut names = from_args(args);
            names.push(component.as_str());
            names
        }
    }
}
