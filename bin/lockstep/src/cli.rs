use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use lockstep_deploy::{CONFIG_FILENAME, Policy, RunMode};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(
    author,
    version,
    about = "Deploy a lending protocol step by step, with resumable runs and role lock-down"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "LOCKSTEP_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the `Lockstep.toml` configuration file.
    ///
    /// Missing files are fine: defaults and `LOCKSTEP_*` environment variables still apply.
    #[arg(short, long, alias = "conf", env = "LOCKSTEP_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Override the network name from the configuration.
    #[arg(short, long)]
    pub network: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the deployment plan.
    Deploy(DeployArgs),
    /// Audit the registry of a previous run against the plan.
    Audit {
        /// Exit with an error when the audit has findings.
        #[arg(long)]
        strict: bool,
    },
    /// Write a configuration file with the default values.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    /// Resume from the existing registry instead of starting over.
    #[arg(long)]
    pub incremental: bool,

    /// Always renounce the deployer's capabilities at the end of the run.
    #[arg(long)]
    pub secure: bool,

    /// Fail the run when the registry audit has findings.
    #[arg(long)]
    pub strict: bool,

    /// Replace stale records and adopt configured external components.
    #[arg(long)]
    pub reuse: bool,

    /// Write a verification manifest after a successful run.
    #[arg(long)]
    pub verify: bool,

    /// Run against an in-memory ledger instead of the RPC endpoint.
    #[arg(long)]
    pub simulate: bool,

    /// Override the RPC endpoint from the configuration.
    #[arg(long, alias = "rpc")]
    pub rpc_url: Option<String>,
}

impl DeployArgs {
    pub fn mode(&self) -> RunMode {
        if self.incremental {
            RunMode::Incremental
        } else {
            RunMode::Fresh
        }
    }

    pub fn policy(&self) -> Policy {
        Policy {
            secure: self.secure,
            strict: self.strict,
            reuse: self.reuse,
            verify: self.verify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deploy_flags() {
        let cli = Cli::try_parse_from([
            "lockstep",
            "--network",
            "sepolia",
            "deploy",
            "--incremental",
            "--secure",
            "--verify",
        ])
        .unwrap();

        assert_eq!(cli.network.as_deref(), Some("sepolia"));
        let Command::Deploy(args) = cli.command else {
            panic!("expected the deploy command");
        };
        assert_eq!(args.mode(), RunMode::Incremental);
        assert_eq!(
            args.policy(),
            Policy {
                secure: true,
                strict: false,
                reuse: false,
                verify: true,
            }
        );
    }

    #[test]
    fn test_parse_audit() {
        let cli = Cli::try_parse_from(["lockstep", "audit", "--strict"]).unwrap();
        assert!(matches!(cli.command, Command::Audit { strict: true }));
    }
}
