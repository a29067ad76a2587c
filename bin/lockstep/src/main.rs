//! lockstep is a CLI tool to deploy a lending protocol in resumable, role-aware steps.

mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use alloy_core::primitives::U256;
use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};

use cli::{Cli, Command, DeployArgs};
use lockstep_deploy::{
    ArtifactStore, Auditor, DeployConfig, Ledger, Orchestrator, Registry, RpcLedger, RunContext,
    RunReport, SimulatedLedger, print_summary, standard_plan,
};

/// Balance given to the deployer of a simulated run.
const SIMULATED_BALANCE_ETHER: u64 = 100;

/// Subdirectory of the registry directory used by simulated runs.
const SIMULATED_REGISTRY_DIR: &str = "simulated";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    if let Command::Init { force } = cli.command {
        init_config(&cli.config, force)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = load_config(&cli.config)?;
    if let Some(network) = cli.network {
        config.network = network;
    }

    match cli.command {
        Command::Deploy(args) => deploy(config, &args).await,
        Command::Audit { strict } => audit(&config, strict),
        Command::Init { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// Layer defaults, the TOML file and `LOCKSTEP_*` environment variables.
fn load_config(path: &Path) -> Result<DeployConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No configuration file, using defaults");
    }

    let config: DeployConfig = Figment::from(Serialized::defaults(DeployConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("LOCKSTEP_").split("__"))
        .extract()
        .context("Failed to load deploy configuration")?;

    tracing::info!(
        network = %config.network,
        rpc_url = %config.rpc_url,
        registry_dir = %config.registry_dir.display(),
        "Configuration loaded"
    );
    Ok(config)
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }
    DeployConfig::default().save_to_file(path)
}

async fn deploy(mut config: DeployConfig, args: &DeployArgs) -> Result<ExitCode> {
    if let Some(rpc_url) = &args.rpc_url {
        config.rpc_url = rpc_url.clone();
    }
    config.validate()?;

    let ctx = config.run_context(args.mode(), args.policy())?;
    tracing::info!(
        network = %ctx.network,
        mode = %ctx.mode,
        deployer = %ctx.deployer,
        admin = %ctx.admin,
        simulate = args.simulate,
        "Starting deployment..."
    );

    let report = if args.simulate {
        let balance = U256::from(SIMULATED_BALANCE_ETHER) * U256::from(10u64).pow(U256::from(18));
        let ledger = SimulatedLedger::new().with_balance(config.deployer, balance);
        run(&ledger, &config, ctx, args.simulate).await
    } else {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        let ledger = RpcLedger::new(&config.rpc_url()?, artifacts)?;
        run(&ledger, &config, ctx, args.simulate).await
    };

    print_summary(&report);
    Ok(ExitCode::from(report.status.exit_code()))
}

/// Simulated runs keep their own registry so they never touch a real deployment's records.
fn registry_dir(config: &DeployConfig, simulate: bool) -> PathBuf {
    if simulate {
        config.registry_dir.join(SIMULATED_REGISTRY_DIR)
    } else {
        config.registry_dir.clone()
    }
}

async fn run<L: Ledger>(
    ledger: &L,
    config: &DeployConfig,
    ctx: RunContext,
    simulate: bool,
) -> RunReport {
    let plan = standard_plan(&config.plan);
    let registry_dir = registry_dir(config, simulate);
    tracing::debug!(registry_dir = %registry_dir.display(), "Using registry directory");
    Orchestrator::new(ledger, &plan, registry_dir)
        .with_receipt_timeout(config.receipt_timeout())
        .with_finalize_retry_delay(config.finalize_retry_delay())
        .run(ctx)
        .await
}

fn audit(config: &DeployConfig, strict: bool) -> Result<ExitCode> {
    let mut registry = Registry::open(&config.registry_dir, &config.network)
        .context("Failed to open the deployment registry")?;
    registry.load().context("Failed to load the deployment registry")?;

    let report = Auditor::for_plan(&standard_plan(&config.plan)).audit(&registry);
    println!(
        "Registry {}: {} components, plan expects {}",
        registry.path().display(),
        report.actual,
        report.expected
    );
    for warning in report.warnings() {
        println!("WARNING: {warning}");
    }

    if !report.has_findings() {
        println!("Registry is consistent");
        return Ok(ExitCode::SUCCESS);
    }
    Ok(if strict {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_runs_use_separate_registry() {
        let config = DeployConfig::default();
        assert_eq!(registry_dir(&config, false), config.registry_dir);

        let simulated = registry_dir(&config, true);
        assert_ne!(simulated, config.registry_dir);
        assert!(simulated.starts_with(&config.registry_dir));
    }

    #[test]
    fn test_audit_rejects_path_like_network() {
        let config = DeployConfig {
            network: "../x".into(),
            ..Default::default()
        };
        let err = audit(&config, false).unwrap_err();
        assert!(format!("{err:#}").contains("network name"));
    }
}
