//! Incentive ledger document.
//!
//! One ledger per participant, one entry per catalog tier, in tier order.
//! `earned` is set by the evaluator, `authorized` is written by the intake
//! system and only read here, and a non-empty `code` marks the tier as
//! issued forever.

use serde::{Deserialize, Serialize};

/// State of a single incentive tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierState {
    #[serde(default)]
    pub earned: bool,
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub code: String,
}

impl TierState {
    /// Issued tiers are never touched again.
    pub fn issued(&self) -> bool {
        !self.code.is_empty()
    }
}

/// Ordered per-participant ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncentiveLedger {
    #[serde(default)]
    pub tiers: Vec<TierState>,
}

impl IncentiveLedger {
    /// Blank ledger with one entry per catalog tier.
    pub fn sized(tier_count: usize) -> Self {
        IncentiveLedger {
            tiers: vec![TierState::default(); tier_count],
        }
    }

    /// Pad an older document up to the current tier count.
    pub fn ensure_tiers(&mut self, tier_count: usize) {
        while self.tiers.len() < tier_count {
            self.tiers.push(TierState::default());
        }
    }

    pub fn tier(&self, idx: usize) -> Option<&TierState> {
        self.tiers.get(idx)
    }

    pub fn issued_count(&self) -> usize {
        self.tiers.iter().filter(|t| t.issued()).count()
    }

    /// True once the last tier has a code, i.e. the study payout is done.
    pub fn terminal_issued(&self) -> bool {
        self.tiers.last().map(TierState::issued).unwrap_or(false)
    }
}

/// Pool label for a dollar amount, e.g. `"$15"`.
pub fn amount_label(amount_usd: u32) -> String {
    format!("${amount_usd}")
}
