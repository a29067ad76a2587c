//! End-of-run summary rendering.

use alloy_core::primitives::U256;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};

use crate::finalizer::FinalizeOutcome;
use crate::orchestrator::{RunReport, RunStatus};
use crate::steps::StepStatus;

const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;
/// Fractional digits shown for ether amounts.
const ETHER_DECIMALS: usize = 6;

/// Format a wei amount as ether with six decimals, truncating the rest.
pub fn format_ether(wei: U256) -> String {
    let unit = U256::from(WEI_PER_ETHER);
    let whole = wei / unit;
    let scale = U256::from(10u64).pow(U256::from(18 - ETHER_DECIMALS));
    let fraction = ((wei % unit) / scale).to_string();
    format!("{whole}.{fraction:0>width$}", width = ETHER_DECIMALS)
}

fn status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Ok => Color::Green,
        StepStatus::Skipped => Color::DarkGrey,
        StepStatus::Failed => Color::Red,
    };
    Cell::new(status).fg(color)
}

pub fn steps_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "Step", "Status", "Produced", "Error"]);

    for record in report.log.iter() {
        table.add_row(vec![
            Cell::new(record.index + 1),
            Cell::new(&record.id),
            status_cell(record.status),
            Cell::new(record.identity().replace(',', "\n")),
            Cell::new(record.error.as_deref().unwrap_or("")),
        ]);
    }
    table
}

pub fn components_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Name", "Kind", "Address", "Block"]);

    for (name, record) in &report.components {
        let name = if record.placeholder {
            Cell::new(format!("{name} (placeholder)")).fg(Color::Yellow)
        } else {
            Cell::new(name)
        };
        table.add_row(vec![
            name,
            Cell::new(&record.kind),
            Cell::new(record.address),
            Cell::new(record.block_number),
        ]);
    }
    table
}

/// Render the full summary: tables, balances, roles, finalization and warnings.
pub fn render_summary(report: &RunReport) -> String {
    let mut lines = Vec::new();

    lines.push(steps_table(report).to_string());
    if !report.components.is_empty() {
        lines.push(components_table(report).to_string());
    }

    for (label, holder, mask) in &report.roles {
        lines.push(format!("Roles of {label} {holder}: {mask}"));
    }

    if let Some(finalize) = &report.finalize {
        let outcome = match &finalize.outcome {
            FinalizeOutcome::NotRequested => "not requested".to_string(),
            FinalizeOutcome::NoController => "no access controller".to_string(),
            FinalizeOutcome::NothingHeld => "deployer held nothing".to_string(),
            FinalizeOutcome::Renounced(mask) => format!("renounced {mask}"),
            FinalizeOutcome::Failed(reason) => format!("FAILED: {reason}"),
        };
        lines.push(format!("Finalize: {outcome}"));
        if let Some(owner) = finalize.owner {
            lines.push(format!("Access controller owner: {owner}"));
        }
    }

    lines.push(format!(
        "Deployer start balance: {}",
        format_ether(report.start_balance)
    ));
    lines.push(format!(
        "Deployer end balance:   {}",
        format_ether(report.end_balance)
    ));
    lines.push(format!(
        "Deploy expenses:        {}",
        format_ether(report.expenditure())
    ));

    for warning in &report.warnings {
        lines.push(format!("WARNING: {warning}"));
    }
    for (kind, error) in &report.errors {
        lines.push(format!("ERROR ({kind}): {error}"));
    }
    if let Some(path) = &report.verification_manifest {
        lines.push(format!("Verification manifest: {}", path.display()));
    }

    lines.push(match report.status {
        RunStatus::Completed => "Deployment has finished".to_string(),
        RunStatus::Failed => "Deployment has failed".to_string(),
    });

    lines.join("\n")
}

pub fn print_summary(report: &RunReport) {
    println!("{}", render_summary(report));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ether() {
        assert_eq!(format_ether(U256::ZERO), "0.000000");
        assert_eq!(
            format_ether(U256::from(1_500_000_000_000_000_000u128)),
            "1.500000"
        );
        assert_eq!(format_ether(U256::from(1_234_567_890_123u64)), "0.000001");
        assert_eq!(
            format_ether(U256::from(100u64) * U256::from(WEI_PER_ETHER)),
            "100.000000"
        );
    }
}
