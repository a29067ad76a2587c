//! The standard protocol bring-up, in dependency order.

use alloy_core::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use super::{Arg, DeploySpec, Holder, Plan, Step};
use crate::capability::Capability;
use crate::registry::ComponentKind;

/// Logical name of the market access controller.
pub const ACCESS_CONTROLLER: &str = "MarketAccessController";

/// Roles the deploying credential needs to configure the protocol.
pub const DEPLOYER_ROLES: &[Capability] = &[
    Capability::PoolAdmin,
    Capability::StakeAdmin,
    Capability::RewardConfigAdmin,
    Capability::RewardRateAdmin,
    Capability::TreasuryAdmin,
];

/// Roles the long-term administrator keeps after the deployer renounces.
pub const ADMIN_ROLES: &[Capability] = &[
    Capability::EmergencyAdmin,
    Capability::PoolAdmin,
    Capability::TreasuryAdmin,
    Capability::RewardConfigAdmin,
    Capability::RewardRateAdmin,
    Capability::StakeAdmin,
    Capability::ReferralAdmin,
];

/// 1e27, the fixed-point unit of rates.
fn ray() -> U256 {
    U256::from(10u64).pow(U256::from(27u64))
}

/// Knobs of the standard plan that vary per network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanOptions {
    /// Deploy a placeholder price oracle as the router's fallback.
    pub mock_price_oracle: bool,
    /// Wrapped native token used by the oracle router and the gateway.
    pub weth: Address,
    /// Flash loan premium in basis points.
    pub flash_loan_premium: u64,
    pub stake_cooldown_blocks: u64,
    pub stake_unstake_blocks: u64,
    /// Maximum slashable share of a stake, in basis points.
    pub max_slashable_percentage: u64,
    /// Share of rewards frozen on claim, in basis points.
    pub reward_freeze_percentage: u64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            mock_price_oracle: false,
            weth: Address::ZERO,
            flash_loan_premium: 9,
            stake_cooldown_blocks: 10,
            stake_unstake_blocks: 10,
            max_slashable_percentage: 3000,
            reward_freeze_percentage: 0,
        }
    }
}

pub fn standard_plan(options: &PlanOptions) -> Plan {
    let controller = || Arg::component(ACCESS_CONTROLLER);

    let mut oracles = Step::new("oracles", "Deploy oracles");
    let fallback = if options.mock_price_oracle {
        oracles = oracles.deploy(DeploySpec::new("MockPriceOracle", ComponentKind::MockPriceOracle));
        Arg::component("MockPriceOracle")
    } else {
        Arg::Address(Address::ZERO)
    };
    let oracles = oracles
        .deploy(
            DeploySpec::new("OracleRouter", ComponentKind::OracleRouter)
                .args(vec![controller(), fallback, Arg::Address(options.weth)])
                .adoptable(),
        )
        .deploy(
            DeploySpec::new("LendingRateOracle", ComponentKind::LendingRateOracle)
                .args(vec![controller()])
                .adoptable(),
        )
        .set_address(Capability::PriceOracle, "OracleRouter")
        .set_address(Capability::LendingRateOracle, "LendingRateOracle");

    let steps = vec![
        Step::new("address-provider", "Deploy address provider registry")
            .deploy(DeploySpec::new(ACCESS_CONTROLLER, ComponentKind::AccessController))
            .deploy(DeploySpec::new(
                "AddressesProviderRegistry",
                ComponentKind::ProviderRegistry,
            ))
            .grant(Holder::Deployer, DEPLOYER_ROLES)
            .grant(Holder::Admin, ADMIN_ROLES),
        oracles,
        Step::new("lending-pool", "Deploy lending pool")
            .deploy(DeploySpec::new("LendingPoolImpl", ComponentKind::LendingPool))
            .deploy(DeploySpec::new(
                "LendingPoolConfiguratorImpl",
                ComponentKind::LendingPoolConfigurator,
            ))
            .set_address(Capability::LendingPool, "LendingPoolImpl")
            .set_address(
                Capability::LendingPoolConfigurator,
                "LendingPoolConfiguratorImpl",
            ),
        Step::new("weth-gateway", "Deploy WETH gateway")
            .deploy(
                DeploySpec::new("WETHGateway", ComponentKind::WethGateway)
                    .args(vec![Arg::Address(options.weth)]),
            )
            .set_address(Capability::WethGateway, "WETHGateway"),
        Step::new("aux-contracts", "Deploy auxiliary contracts")
            .deploy(DeploySpec::new(
                "LendingPoolCollateralManagerImpl",
                ComponentKind::CollateralManager,
            ))
            .set_address(
                Capability::LendingPoolCollateralManager,
                "LendingPoolCollateralManagerImpl",
            )
            .deploy(
                DeploySpec::new("ProtocolDataProvider", ComponentKind::ProtocolDataProvider)
                    .args(vec![controller()]),
            )
            .deploy(
                DeploySpec::new("TreasuryImpl", ComponentKind::Treasury).args(vec![controller()]),
            )
            .set_address(Capability::Treasury, "TreasuryImpl"),
        Step::new("initialize-lending-pool", "Initialize lending pool").invoke(
            "LendingPoolConfiguratorImpl",
            "setFlashLoanPremium(uint16)",
            vec![Arg::uint(options.flash_loan_premium)],
        ),
        Step::new("stake-configurator", "Deploy stake configurator")
            .deploy(DeploySpec::new(
                "StakeConfiguratorImpl",
                ComponentKind::StakeConfigurator,
            ))
            .set_address(Capability::StakeConfigurator, "StakeConfiguratorImpl"),
        Step::new("stake-tokens", "Deploy and initialize stake tokens")
            .deploy(
                DeploySpec::new("StakeTokenImpl", ComponentKind::StakeToken).args(vec![
                    controller(),
                    Arg::uint(options.stake_cooldown_blocks),
                    Arg::uint(options.stake_unstake_blocks),
                ]),
            )
            .invoke(
                "StakeTokenImpl",
                "setMaxSlashablePercentage(uint16)",
                vec![Arg::uint(options.max_slashable_percentage)],
            ),
        Step::new("reward-contracts", "Deploy reward contracts and reward token")
            .deploy(
                DeploySpec::new("RewardTokenImpl", ComponentKind::RewardToken)
                    .args(vec![controller()]),
            )
            .set_address(Capability::RewardToken, "RewardTokenImpl")
            .deploy(DeploySpec::new(
                "RewardConfiguratorImpl",
                ComponentKind::RewardConfigurator,
            ))
            .set_address(Capability::RewardConfigurator, "RewardConfiguratorImpl")
            .deploy(
                DeploySpec::new("RewardFreezer", ComponentKind::RewardController)
                    .args(vec![controller(), Arg::component("RewardTokenImpl")]),
            )
            .set_address(Capability::RewardController, "RewardFreezer")
            .grant(Holder::component("RewardFreezer"), &[Capability::RewardMint])
            .invoke(
                "RewardFreezer",
                "admin_setFreezePercentage(uint32)",
                vec![Arg::uint(options.reward_freeze_percentage)],
            ),
        Step::new("reward-pools", "Deploy reward pools")
            .deploy(
                DeploySpec::new("TokenWeightedRewardPoolAG", ComponentKind::RewardPool).args(vec![
                    Arg::component("RewardFreezer"),
                    Arg::Uint(ray()),
                    Arg::uint(0),
                    Arg::Uint(ray() * U256::from(100u64)),
                ]),
            )
            .deploy(
                DeploySpec::new("TokenWeightedRewardPoolAGF", ComponentKind::RewardPool).args(
                    vec![
                        Arg::component("RewardFreezer"),
                        Arg::Uint(ray()),
                        Arg::uint(0),
                        Arg::Uint(ray() * U256::from(100u64)),
                    ],
                ),
            ),
        Step::new("access-test", "Access test")
            .expect_roles(Holder::Admin, ADMIN_ROLES)
            .expect_roles(Holder::Deployer, DEPLOYER_ROLES)
            .expect_roles(Holder::component("RewardFreezer"), &[Capability::RewardMint]),
    ];

    Plan::new(ACCESS_CONTROLLER, steps)
}
