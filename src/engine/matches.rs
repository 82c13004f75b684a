// 8.5 engine/matches.rs: applying one regular fill to state.
//
// used by local matching and by replay alike, so both paths move balances, fees
// and fill amounts the same way. callers branch the store and throw the branch
// away when a fill is rejected.

use super::core::ClobKeeper;
use super::fill_state::STATEFUL_PRUNABLE_BLOCK_HEIGHT;
use super::results::{ClobError, OrderStatus};
use crate::bank::ModuleAccount;
use crate::clob_pair::ClobPair;
use crate::indexer::{
    OrderFillEventV1, PendingEvents, StatefulOrderEventV1, SubaccountUpdateEventV1, SUBTYPE_ORDER_FILL,
    SUBTYPE_STATEFUL_ORDER, SUBTYPE_SUBACCOUNT_UPDATE,
};
use crate::matching::{fee_for_quote, MatchWithOrders};
use crate::order::{MatchableOrder, Order, OrderId, OrderRemovalReason};
use crate::store::KvStore;
use crate::subaccount::{SubaccountError, SubaccountUpdate, UpdateKind};
use crate::types::{fill_amount_to_quote_quantums, SubaccountId};
use tracing::trace;

/// One fill that made it into state.
#[derive(Debug, Clone)]
pub(super) struct AppliedFill {
    pub match_with_orders: MatchWithOrders,
    pub quote_quantums: u64,
    pub taker_total_filled: u64,
    pub maker_total_filled: u64,
}

impl AppliedFill {
    pub fn maker_fully_filled(&self) -> bool {
        self.maker_total_filled >= self.match_with_orders.maker.quantums
    }
}

/// How local matching reacts to a fill the state rejected.
#[derive(Debug)]
pub(super) enum FillRejection {
    RemoveMaker(OrderRemovalReason),
    StopTaker(OrderStatus),
    Fatal(ClobError),
}

/// Blames the maker or the taker for a rejected fill. anything else aborts.
pub(super) fn classify_rejected_fill(err: ClobError, maker: &Order) -> FillRejection {
    let maker_id = &maker.order_id;
    match err {
        ClobError::Subaccount(SubaccountError::Undercollateralized { ref subaccount_id, .. }) => {
            if subaccount_id == &maker_id.subaccount_id {
                FillRejection::RemoveMaker(OrderRemovalReason::Undercollateralized)
            } else {
                FillRejection::StopTaker(OrderStatus::Undercollateralized)
            }
        }
        ClobError::InvalidReduceOnly(ref order_id) => {
            if order_id == maker_id {
                FillRejection::RemoveMaker(OrderRemovalReason::InvalidReduceOnly)
            } else {
                FillRejection::StopTaker(OrderStatus::ReduceOnlyStopped)
            }
        }
        ClobError::OrderOverfilled { ref order_id, .. } if order_id == maker_id => {
            FillRejection::RemoveMaker(OrderRemovalReason::FullyFilled)
        }
        other => FillRejection::Fatal(other),
    }
}

/// A reduce-only order may only shrink its position towards zero.
pub(super) fn reduces_position(position: i128, delta: i128) -> bool {
    position != 0 && position.signum() == -delta.signum() && delta.abs() <= position.abs()
}

impl ClobKeeper {
    // 8.5.1: regular fill. every check runs before the first write.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn process_single_order_fill(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        tx_index: u32,
        pair: &ClobPair,
        taker: &Order,
        maker: &Order,
        fill_amount: u64,
    ) -> Result<AppliedFill, ClobError> {
        let taker_id = &taker.order_id;
        let maker_id = &maker.order_id;
        if taker_id.clob_pair_id != pair.id || maker_id.clob_pair_id != pair.id {
            return Err(ClobError::InvalidMatch(format!(
                "taker {taker_id} and maker {maker_id} must both trade on {}",
                pair.id
            )));
        }
        if taker.side == maker.side {
            return Err(ClobError::InvalidMatch(format!(
                "taker {taker_id} and maker {maker_id} are on the same side"
            )));
        }
        if !taker.crosses(maker) {
            return Err(ClobError::InvalidMatch(format!(
                "taker {taker_id} at {} does not cross maker {maker_id} at {}",
                taker.subticks, maker.subticks
            )));
        }
        if taker_id.subaccount_id == maker_id.subaccount_id {
            return Err(ClobError::SelfTrade {
                taker: taker_id.clone(),
                maker: maker_id.clone(),
            });
        }
        if taker.is_post_only() {
            return Err(ClobError::PostOnlyWouldCrossMakerOrder(taker_id.clone()));
        }
        if pair.step_base_quantums > 0 && fill_amount % pair.step_base_quantums != 0 {
            return Err(ClobError::FillNotMultipleOfStep {
                fill_amount,
                step: pair.step_base_quantums,
            });
        }

        let taker_total = self.checked_total_fill(store, taker, fill_amount)?;
        let maker_total = self.checked_total_fill(store, maker, fill_amount)?;

        let perpetual_id = pair.perpetual_id;
        let taker_delta = taker.side.sign() * fill_amount as i128;
        for (order, delta) in [(taker, taker_delta), (maker, -taker_delta)] {
            if order.reduce_only {
                let position = self
                    .subaccounts
                    .get_subaccount(store, &order.order_id.subaccount_id)?
                    .position_quantums(perpetual_id);
                if !reduces_position(position, delta) {
                    return Err(ClobError::InvalidReduceOnly(order.order_id.clone()));
                }
            }
        }

        let quote = fill_amount_to_quote_quantums(maker.subticks, fill_amount, pair.quantum_conversion_exponent)
            .ok_or(ClobError::Overflow("fill quote quantums"))?;
        let taker_fee = fee_for_quote(quote, pair.fee_ppm(true)).ok_or(ClobError::Overflow("taker fee"))?;
        let maker_fee = fee_for_quote(quote, pair.fee_ppm(false)).ok_or(ClobError::Overflow("maker fee"))?;

        // the buyer pays quote, the seller receives it; both pay their fee
        let taker_quote = -taker.side.sign() * quote as i128 - taker_fee as i128;
        let maker_quote = taker.side.sign() * quote as i128 - maker_fee as i128;
        self.subaccounts.update_subaccounts(
            store,
            &[
                SubaccountUpdate::trade(taker_id.subaccount_id.clone(), taker_quote, perpetual_id, taker_delta),
                SubaccountUpdate::trade(maker_id.subaccount_id.clone(), maker_quote, perpetual_id, -taker_delta),
            ],
            UpdateKind::Match,
        )?;
        self.bank.transfer_signed(
            store,
            ModuleAccount::Subaccounts,
            ModuleAccount::FeeCollector,
            taker_fee as i128 + maker_fee as i128,
        )?;

        self.record_order_fill(store, taker, taker_total)?;
        self.record_order_fill(store, maker, maker_total)?;
        self.stats.record_fill(
            store,
            &taker_id.subaccount_id.owner,
            &maker_id.subaccount_id.owner,
            quote,
        )?;

        events.add_txn(
            tx_index,
            SUBTYPE_ORDER_FILL,
            &OrderFillEventV1 {
                maker_order: maker.clone(),
                taker_order: MatchableOrder::Order(taker.clone()),
                fill_amount,
                maker_fee,
                taker_fee,
                total_filled_maker: maker_total,
                total_filled_taker: taker_total,
            },
        )?;
        self.emit_subaccount_update(store, events, tx_index, &taker_id.subaccount_id)?;
        self.emit_subaccount_update(store, events, tx_index, &maker_id.subaccount_id)?;

        trace!(taker = %taker_id, maker = %maker_id, fill_amount, quote, "applied fill");
        Ok(AppliedFill {
            match_with_orders: MatchWithOrders {
                taker: MatchableOrder::Order(taker.clone()),
                maker: maker.clone(),
                fill_amount,
                maker_fee,
                taker_fee,
            },
            quote_quantums: quote,
            taker_total_filled: taker_total,
            maker_total_filled: maker_total,
        })
    }

    /// Cumulative fill after adding `fill_amount`, rejected past the order's size.
    pub(super) fn checked_total_fill(&self, store: &dyn KvStore, order: &Order, fill_amount: u64) -> Result<u64, ClobError> {
        let (_, filled, _) = self.get_order_fill_amount(store, &order.order_id)?;
        let total = filled
            .checked_add(fill_amount)
            .ok_or(ClobError::Overflow("order fill amount"))?;
        if total > order.quantums {
            return Err(ClobError::OrderOverfilled {
                order_id: order.order_id.clone(),
                total,
                quantums: order.quantums,
            });
        }
        Ok(total)
    }

    // short-term fill states are pruned once the order can no longer be placed
    pub(super) fn record_order_fill(&self, store: &mut dyn KvStore, order: &Order, total: u64) -> Result<(), ClobError> {
        match order.good_til_block() {
            Some(good_til_block) if !order.is_stateful() => {
                let (exists, _, current) = self.get_order_fill_amount(store, &order.order_id)?;
                let prunable = if exists { current.max(good_til_block) } else { good_til_block };
                self.set_order_fill_amount(store, &order.order_id, total, prunable)?;
                self.add_orders_for_pruning(store, std::slice::from_ref(&order.order_id), prunable)?;
            }
            _ => self.set_order_fill_amount(store, &order.order_id, total, STATEFUL_PRUNABLE_BLOCK_HEIGHT)?,
        }
        Ok(())
    }

    pub(super) fn emit_subaccount_update(
        &self,
        store: &dyn KvStore,
        events: &mut PendingEvents,
        tx_index: u32,
        subaccount_id: &SubaccountId,
    ) -> Result<(), ClobError> {
        let subaccount = self.subaccounts.get_subaccount(store, subaccount_id)?;
        events.add_txn(
            tx_index,
            SUBTYPE_SUBACCOUNT_UPDATE,
            &SubaccountUpdateEventV1 {
                subaccount_id: subaccount_id.clone(),
                quote_balance: subaccount.quote_balance,
                updated_perpetual_positions: subaccount.perpetual_positions,
            },
        )?;
        Ok(())
    }

    /// Deletes a stateful order and records why. false if it was already gone.
    pub(super) fn remove_stateful_order(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        tx_index: u32,
        order_id: &OrderId,
        reason: OrderRemovalReason,
    ) -> Result<bool, ClobError> {
        if !self.delete_stateful_order(store, order_id)? {
            return Ok(false);
        }
        events.add_txn(
            tx_index,
            SUBTYPE_STATEFUL_ORDER,
            &StatefulOrderEventV1::Removal {
                order_id: order_id.clone(),
                reason,
            },
        )?;
        Ok(true)
    }
}
