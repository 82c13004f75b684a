// 6.2: deleveraging. when a liquidation can't close a position on the book,
// the remainder is offset against subaccounts holding the opposite position,
// at the liquidated subaccount's bankruptcy price.
// ranked by leverage: the most levered offsetting position is taken first.

use crate::margin::RiskSummary;
use crate::types::SubaccountId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleveragingParams {
    pub max_offsetting_subaccounts: usize, // cap per deleveraging match
}

impl Default for DeleveragingParams {
    fn default() -> Self {
        Self {
            max_offsetting_subaccounts: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OffsettingCandidate {
    pub subaccount_id: SubaccountId,
    pub position_quantums: i128,
    pub score: Decimal, // higher = offset first
}

impl OffsettingCandidate {
    pub fn new(subaccount_id: SubaccountId, position_quantums: i128, position_notional: i128, risk: &RiskSummary) -> Self {
        Self {
            subaccount_id,
            position_quantums,
            score: leverage_score(position_notional, risk.net_collateral),
        }
    }
}

impl PartialEq for OffsettingCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.subaccount_id == other.subaccount_id
    }
}

impl Eq for OffsettingCandidate {}

impl PartialOrd for OffsettingCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OffsettingCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // descending score, then subaccount id so every node ranks the same way
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.subaccount_id.cmp(&other.subaccount_id))
    }
}

// |notional| / net collateral. non-positive collateral ranks first.
fn leverage_score(position_notional: i128, net_collateral: i128) -> Decimal {
    let notional = Decimal::try_from_i128_with_scale(position_notional.abs(), 0).unwrap_or(Decimal::MAX);
    if net_collateral <= 0 {
        return Decimal::MAX;
    }
    let collateral = Decimal::try_from_i128_with_scale(net_collateral, 0).unwrap_or(Decimal::MAX);
    notional.checked_div(collateral).unwrap_or(Decimal::MAX)
}

/// Keeps candidates whose position is opposite to `liquidated_position` and
/// sorts them by priority.
pub fn rank_offsetting_candidates(
    candidates: Vec<OffsettingCandidate>,
    liquidated: &SubaccountId,
    liquidated_position: i128,
) -> Vec<OffsettingCandidate> {
    let mut ranked: Vec<OffsettingCandidate> = candidates
        .into_iter()
        .filter(|c| &c.subaccount_id != liquidated)
        .filter(|c| c.position_quantums != 0)
        .filter(|c| c.position_quantums.signum() == -liquidated_position.signum())
        .collect();
    ranked.sort();
    ranked
}

/// How much to take from each candidate, in order, to offset `quantums`.
pub fn allocate_offsetting_fills(
    ranked: &[OffsettingCandidate],
    quantums: u64,
    params: &DeleveragingParams,
) -> Vec<(SubaccountId, u64)> {
    let mut remaining = quantums;
    let mut fills = Vec::new();

    for candidate in ranked.iter().take(params.max_offsetting_subaccounts) {
        if remaining == 0 {
            break;
        }
        let available = u64::try_from(candidate.position_quantums.unsigned_abs()).unwrap_or(u64::MAX);
        let fill = remaining.min(available);
        if fill > 0 {
            fills.push((candidate.subaccount_id.clone(), fill));
            remaining -= fill;
        }
    }

    fills
}
