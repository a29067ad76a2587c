//! Capability flags and role masks.
//!
//! A role mask is a 256-bit integer where each bit authorizes one privileged
//! action on the access controller. Flags above bit 63 are in use, so masks are
//! never represented as machine words.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use alloy_core::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use thiserror::Error;

/// Number of bit positions a role mask can hold.
pub const MASK_WIDTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("bit position {0} exceeds the 256-bit mask width")]
    OutOfRange(usize),

    #[error("{first} and {second} share bit {bit} without a reviewed alias entry")]
    UnreviewedAlias {
        first: Capability,
        second: Capability,
        bit: usize,
    },

    #[error("{first} and {second} are aliased on bit {bit} and cannot both be bound by one plan")]
    AliasConflict {
        first: Capability,
        second: Capability,
        bit: usize,
    },
}

/// Named capability flags understood by the access controller.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    EmergencyAdmin,
    PoolAdmin,
    TreasuryAdmin,
    RewardConfigAdmin,
    RewardRateAdmin,
    StakeAdmin,
    ReferralAdmin,
    /// Can slash and pause stakes.
    LiquidityController,
    LendingPool,
    LendingPoolConfigurator,
    LendingPoolCollateralManager,
    PriceOracle,
    LendingRateOracle,
    Treasury,
    RewardToken,
    RewardStakeToken,
    RewardController,
    RewardConfigurator,
    StakeConfigurator,
    ReferralRegistry,
    WethGateway,
    RewardMint,
    RewardBurn,
    PoolSponsoredLoanUser,
}

impl Capability {
    /// Bit position of this flag in a role mask.
    pub const fn bit(self) -> usize {
        match self {
            Self::EmergencyAdmin => 0,
            Self::PoolAdmin => 1,
            Self::TreasuryAdmin => 2,
            Self::RewardConfigAdmin => 3,
            Self::RewardRateAdmin => 4,
            Self::StakeAdmin => 5,
            Self::ReferralAdmin => 6,
            Self::LiquidityController => 15,
            Self::LendingPool => 16,
            Self::LendingPoolConfigurator => 17,
            Self::LendingPoolCollateralManager => 18,
            Self::PriceOracle => 19,
            Self::LendingRateOracle => 20,
            Self::Treasury => 21,
            Self::RewardToken => 22,
            Self::RewardStakeToken => 23,
            Self::RewardController => 24,
            Self::RewardConfigurator => 25,
            Self::StakeConfigurator => 26,
            Self::ReferralRegistry => 27,
            Self::WethGateway => 27,
            Self::RewardMint => 64,
            Self::RewardBurn => 65,
            Self::PoolSponsoredLoanUser => 66,
        }
    }

    pub fn mask(self) -> CapabilityMask {
        CapabilityMask(U256::from(1u8) << self.bit())
    }

    /// The flag id passed to `setAddress`/`getAddress`, which is the flag's mask.
    pub fn id(self) -> U256 {
        self.mask().as_u256()
    }
}

/// Two flags deliberately sharing one bit position.
#[derive(Debug, Clone, Copy)]
pub struct FlagAlias {
    pub primary: Capability,
    pub alias: Capability,
    pub note: &'static str,
}

/// Every bit shared by two flag names must be listed here.
pub const REVIEWED_ALIASES: &[FlagAlias] = &[FlagAlias {
    primary: Capability::WethGateway,
    alias: Capability::ReferralRegistry,
    note: "address slot 27 is shared by the deployed controller; only one of the two may be bound per deployment",
}];

fn reviewed_alias(a: Capability, b: Capability) -> Option<&'static FlagAlias> {
    REVIEWED_ALIASES
        .iter()
        .find(|e| (e.primary == a && e.alias == b) || (e.primary == b && e.alias == a))
}

/// Check that every shared bit in the flag table is a reviewed alias.
pub fn validate_flag_table() -> Result<(), CapabilityError> {
    let mut seen: BTreeMap<usize, Capability> = BTreeMap::new();
    for flag in Capability::iter() {
        if flag.bit() >= MASK_WIDTH {
            return Err(CapabilityError::OutOfRange(flag.bit()));
        }
        if let Some(&first) = seen.get(&flag.bit()) {
            if reviewed_alias(first, flag).is_none() {
                return Err(CapabilityError::UnreviewedAlias {
                    first,
                    second: flag,
                    bit: flag.bit(),
                });
            }
        } else {
            seen.insert(flag.bit(), flag);
        }
    }
    Ok(())
}

/// Reject a set of bound flags that uses both names of an alias pair.
pub fn check_alias_usage<I>(flags: I) -> Result<(), CapabilityError>
where
    I: IntoIterator<Item = Capability>,
{
    let used: Vec<Capability> = flags.into_iter().collect();
    for entry in REVIEWED_ALIASES {
        if used.contains(&entry.primary) && used.contains(&entry.alias) {
            return Err(CapabilityError::AliasConflict {
                first: entry.primary,
                second: entry.alias,
                bit: entry.primary.bit(),
            });
        }
    }
    Ok(())
}

/// A 256-bit role mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityMask(U256);

impl CapabilityMask {
    pub const EMPTY: Self = Self(U256::ZERO);

    /// Mask with the single bit `pos` set.
    pub fn bit(pos: usize) -> Result<Self, CapabilityError> {
        if pos >= MASK_WIDTH {
            return Err(CapabilityError::OutOfRange(pos));
        }
        Ok(Self(U256::from(1u8) << pos))
    }

    pub fn from_flags<'a, I>(flags: I) -> Self
    where
        I: IntoIterator<Item = &'a Capability>,
    {
        flags
            .into_iter()
            .fold(Self::EMPTY, |acc, flag| acc | flag.mask())
    }

    pub fn from_u256(value: U256) -> Self {
        Self(value)
    }

    pub fn as_u256(self) -> U256 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0.is_zero()
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bits of `self` that are not in `other`.
    pub fn difference(self, other: Self) -> Self {
        self & !other
    }

    /// The only mutation path for a role assignment: `(prior | grant) & !revoke`.
    pub fn apply(prior: Self, grant: Self, revoke: Self) -> Self {
        (prior | grant) & !revoke
    }

    /// Set bit positions, lowest first.
    pub fn positions(self) -> impl Iterator<Item = usize> {
        (0..MASK_WIDTH).filter(move |&pos| self.0.bit(pos))
    }

    /// Flag names covering the set bits. Aliased bits report every name.
    pub fn flags(self) -> Vec<Capability> {
        Capability::iter()
            .filter(|flag| self.0.bit(flag.bit()))
            .collect()
    }
}

impl BitOr for CapabilityMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for CapabilityMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for CapabilityMask {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Display for CapabilityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("[]");
        }
        let names: Vec<String> = self.flags().iter().map(ToString::to_string).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Locally mirrored role intent. The access controller remains the source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleIntent {
    holders: BTreeMap<Address, CapabilityMask>,
}

impl RoleIntent {
    pub fn grant(&mut self, holder: Address, mask: CapabilityMask) {
        self.update(holder, mask, CapabilityMask::EMPTY);
    }

    pub fn revoke(&mut self, holder: Address, mask: CapabilityMask) {
        self.update(holder, CapabilityMask::EMPTY, mask);
    }

    fn update(&mut self, holder: Address, grant: CapabilityMask, revoke: CapabilityMask) {
        let prior = self.get(holder);
        self.holders
            .insert(holder, CapabilityMask::apply(prior, grant, revoke));
    }

    pub fn get(&self, holder: Address) -> CapabilityMask {
        self.holders.get(&holder).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &CapabilityMask)> {
        self.holders.iter()
    }
}
