//! Post-run consistency scan of the registry.

use std::collections::BTreeSet;

use crate::registry::Registry;
use crate::steps::Plan;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Distinct names sharing an address with another name.
    pub multi_deployed: usize,
    /// Records whose kind is not a known component kind.
    pub unknown: usize,
    pub placeholders: Vec<String>,
    pub expected: usize,
    pub actual: usize,
    /// Planned components absent from the registry.
    pub missing: Vec<String>,
    /// Recorded components the plan does not produce.
    pub extra: Vec<String>,
}

impl AuditReport {
    pub fn has_findings(&self) -> bool {
        self.multi_deployed > 0
            || self.unknown > 0
            || !self.placeholders.is_empty()
            || !self.missing.is_empty()
            || !self.extra.is_empty()
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.multi_deployed > 0 {
            warnings.push(format!(
                "multi-deployed components detected: {} names share an address",
                self.multi_deployed
            ));
        }
        if self.unknown > 0 {
            warnings.push(format!("unknown components detected: {}", self.unknown));
        }
        for name in &self.placeholders {
            warnings.push(format!("placeholder component detected: {name}"));
        }
        if self.expected != self.actual || !self.missing.is_empty() || !self.extra.is_empty() {
            warnings.push(format!(
                "registry holds {} components, plan expects {} (missing: [{}], extra: [{}])",
                self.actual,
                self.expected,
                self.missing.join(", "),
                self.extra.join(", ")
            ));
        }
        warnings
    }
}

/// Compares a registry against the components a plan is expected to produce.
#[derive(Debug, Clone, Default)]
pub struct Auditor {
    expected: BTreeSet<String>,
}

impl Auditor {
    pub fn for_plan(plan: &Plan) -> Self {
        Self {
            expected: plan
                .expected_components()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn audit(&self, registry: &Registry) -> AuditReport {
        let duplicates = registry.audit_duplicates();
        let recorded: BTreeSet<String> = registry
            .ordered()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();

        AuditReport {
            multi_deployed: duplicates.multi_deployed,
            unknown: duplicates.unknown,
            placeholders: duplicates.placeholders,
            expected: self.expected.len(),
            actual: recorded.len(),
            missing: self.expected.difference(&recorded).cloned().collect(),
            extra: recorded.difference(&self.expected).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::registry::{ComponentKind, ComponentRecord, Replace};
    use crate::steps::{DeploySpec, Step};
    use alloy_core::primitives::Address;
    use tempdir::TempDir;

    fn plan() -> Plan {
        Plan::new(
            "Controller",
            vec![
                Step::new("one", "Controller and treasury")
                    .deploy(DeploySpec::new("Controller", ComponentKind::AccessController))
                    .deploy(DeploySpec::new("Treasury", ComponentKind::Treasury)),
            ],
        )
    }

    #[test]
    fn test_clean_registry_has_no_findings() {
        let dir = TempDir::new("lockstep-audit").expect("Failed to create temp dir");
        let ctx = RunContext::new("testnet", Address::repeat_byte(1), Address::repeat_byte(2));
        let mut registry = Registry::open(dir.path(), "testnet").unwrap();
        for (i, (name, kind)) in [
            ("Controller", ComponentKind::AccessController),
            ("Treasury", ComponentKind::Treasury),
        ]
        .into_iter()
        .enumerate()
        {
            registry
                .put(
                    &ctx,
                    name,
                    ComponentRecord::new(kind, Address::repeat_byte(10 + i as u8)),
                    Replace::No,
                )
                .unwrap();
        }

        let report = Auditor::for_plan(&plan()).audit(&registry);
        assert!(!report.has_findings());
        assert!(report.warnings().is_empty());
    }

    #[test]
    fn test_missing_and_extra_reported() {
        let dir = TempDir::new("lockstep-audit").expect("Failed to create temp dir");
        let ctx = RunContext::new("testnet", Address::repeat_byte(1), Address::repeat_byte(2));
        let mut registry = Registry::open(dir.path(), "testnet").unwrap();
        registry
            .put(
                &ctx,
                "Controller",
                ComponentRecord::new(ComponentKind::AccessController, Address::repeat_byte(10)),
                Replace::No,
            )
            .unwrap();
        registry
            .put(
                &ctx,
                "MockPriceOracle",
                ComponentRecord::new(ComponentKind::MockPriceOracle, Address::repeat_byte(11)),
                Replace::No,
            )
            .unwrap();

        let report = Auditor::for_plan(&plan()).audit(&registry);
        assert!(report.has_findings());
        assert_eq!(report.missing, vec!["Treasury".to_string()]);
        assert_eq!(report.extra, vec!["MockPriceOracle".to_string()]);
        assert_eq!(report.placeholders, vec!["MockPriceOracle".to_string()]);
        assert_eq!(report.warnings().len(), 2);
    }
}
