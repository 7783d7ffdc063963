//! Duration tiers.
//!
//! A deployment runs one ledger per unlock-delay tier; the tier fixes
//! the delay and the fee-token amount required of depositors. Shorter
//! locks carry a higher fee requirement.

use serde::{Deserialize, Serialize};

/// The standard unlock-delay tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnlockTier {
    Day1,
    Day3,
    Day7,
    Day14,
    Day21,
    Day28,
    Day90,
    Day180,
    Day365,
}

impl UnlockTier {
    /// Every tier, shortest delay first.
    pub const ALL: [UnlockTier; 9] = [
        UnlockTier::Day1,
        UnlockTier::Day3,
        UnlockTier::Day7,
        UnlockTier::Day14,
        UnlockTier::Day21,
        UnlockTier::Day28,
        UnlockTier::Day90,
        UnlockTier::Day180,
        UnlockTier::Day365,
    ];

    /// The unlock delay in whole days.
    pub fn days(&self) -> i64 {
        match self {
            UnlockTier::Day1 => 1,
            UnlockTier::Day3 => 3,
            UnlockTier::Day7 => 7,
            UnlockTier::Day14 => 14,
            UnlockTier::Day21 => 21,
            UnlockTier::Day28 => 28,
            UnlockTier::Day90 => 90,
            UnlockTier::Day180 => 180,
            UnlockTier::Day365 => 365,
        }
    }

    /// The unlock delay applied to withdrawal requests.
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::days(self.days())
    }

    /// Fee-token amount required of depositors at this tier, in the
    /// smallest denomination.
    pub fn fee_amount(&self) -> u64 {
        match self {
            UnlockTier::Day1 => 20_000_000,
            UnlockTier::Day3 => 15_000_000,
            UnlockTier::Day7 => 10_000_000,
            UnlockTier::Day14 => 8_000_000,
            UnlockTier::Day21 => 6_000_000,
            UnlockTier::Day28 => 5_000_000,
            UnlockTier::Day90 => 3_000_000,
            UnlockTier::Day180 => 2_000_000,
            UnlockTier::Day365 => 1_000_000,
        }
    }
}

impl std::fmt::Display for UnlockTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}d", self.days())
    }
}
