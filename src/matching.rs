//! Matching engine.
//!
//! Walks the opposite side of a book in priority order and hands every candidate
//! fill to a callback. The callback owns collateral and state checks; this module
//! only knows prices, sizes and self-trade prevention.
//!
//! Matching mutates the live book. Every maker it touches is recorded in
//! [`MatchOutcome::undo`] so a caller that rejects the placement afterwards can
//! put the book back with [`OrderBook::restore`].

use crate::order::{crosses, MatchableOrder, Order, OrderId, OrderRemovalReason};
use crate::orderbook::{BookError, OrderBook, RestingOrder};
use crate::types::mul_ppm_round_half_away;
use serde::{Deserialize, Serialize};

/// What to do when the best maker belongs to the taker's subaccount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfTradePolicy {
    /// Drop the resting order and keep matching.
    #[default]
    CancelResting,
    /// Stop matching the incoming order.
    CancelIncoming,
}

/// Verdict of the per-fill callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillDecision {
    Accept,
    RemoveMaker(OrderRemovalReason),
    StopTaker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakerFill {
    pub maker_order: Order,
    pub fill_amount: u64,
}

impl MakerFill {
    /// Maker sets the price.
    pub fn subticks(&self) -> u64 {
        self.maker_order.subticks
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub fills: Vec<MakerFill>,
    pub removed_makers: Vec<(OrderId, OrderRemovalReason)>,
    pub remaining: u64,
    pub stopped_by_self_trade: bool,
    pub stopped_by_callback: bool,
    /// Touched makers as they rested before this match.
    pub undo: Vec<RestingOrder>,
}

impl MatchOutcome {
    pub fn filled(&self) -> u64 {
        self.fills.iter().map(|f| f.fill_amount).sum()
    }
}

/// A single applied match with its fees. negative fees are rebates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchWithOrders {
    pub taker: MatchableOrder,
    pub maker: Order,
    pub fill_amount: u64,
    pub maker_fee: i64,
    pub taker_fee: i64,
}

/// `round_half_away_from_zero(quote * ppm / 1e6)`; None on overflow.
pub fn fee_for_quote(quote_quantums: u64, fee_ppm: i32) -> Option<i64> {
    let fee = mul_ppm_round_half_away(quote_quantums as i128, fee_ppm)?;
    i64::try_from(fee).ok()
}

// 2.7: the matching loop.
pub fn match_order<F>(
    book: &mut OrderBook,
    taker: &MatchableOrder,
    quantums: u64,
    policy: SelfTradePolicy,
    mut on_fill: F,
) -> Result<MatchOutcome, BookError>
where
    F: FnMut(&Order, u64) -> FillDecision,
{
    let taker_side = taker.side();
    let maker_side = taker_side.opposite();
    let mut outcome = MatchOutcome {
        remaining: quantums,
        ..MatchOutcome::default()
    };

    while outcome.remaining > 0 {
        let Some(best) = book.best(maker_side) else {
            break;
        };
        if !crosses(taker_side, taker.subticks(), best.order.subticks) {
            break;
        }
        let maker = best.order.clone();
        let maker_remaining = best.remaining;
        let maker_id = maker.order_id.clone();
        let before = best.clone();

        if &maker_id.subaccount_id == taker.subaccount_id() {
            match policy {
                SelfTradePolicy::CancelResting => {
                    outcome.undo.push(before);
                    book.remove(&maker_id);
                    outcome
                        .removed_makers
                        .push((maker_id, OrderRemovalReason::InvalidSelfTrade));
                    continue;
                }
                SelfTradePolicy::CancelIncoming => {
                    outcome.stopped_by_self_trade = true;
                    break;
                }
            }
        }

        let fill_amount = outcome.remaining.min(maker_remaining);
        match on_fill(&maker, fill_amount) {
            FillDecision::Accept => {
                outcome.undo.push(before);
                if let Err(err) = book.reduce(&maker_id, fill_amount) {
                    book.restore(std::mem::take(&mut outcome.undo));
                    return Err(err);
                }
                outcome.remaining -= fill_amount;
                outcome.fills.push(MakerFill {
                    maker_order: maker,
                    fill_amount,
                });
            }
            FillDecision::RemoveMaker(reason) => {
                outcome.undo.push(before);
                book.remove(&maker_id);
                outcome.removed_makers.push((maker_id, reason));
            }
            FillDecision::StopTaker => {
                outcome.stopped_by_callback = true;
                break;
            }
        }
    }

    Ok(outcome)
}
