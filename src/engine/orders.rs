// 8.9 engine/orders.rs: order entry.
//
// short-term orders and preexisting stateful orders match on the local book and
// write to check state. stateful placements and cancellations are transactions
// and go straight to the block being delivered.

use super::core::{ClobKeeper, OPERATIONS_TX_INDEX};
use super::matches::{classify_rejected_fill, AppliedFill, FillRejection};
use super::results::{ClobError, OrderStatus, PlaceOrderResult};
use super::stateful_orders::StatefulOrderPlacement;
use crate::clob_pair::ClobPair;
use crate::indexer::{PendingEvents, StatefulOrderEventV1, SUBTYPE_STATEFUL_ORDER};
use crate::matching::{match_order, FillDecision, MatchOutcome};
use crate::operations::{place_order_tx_bytes, OperationRaw, OperationsError};
use crate::order::{MatchableOrder, Order, OrderError, OrderFlags, OrderId};
use crate::orderbook::BookError;
use crate::store::{CacheStore, KvStore};
use crate::types::BlockContext;
use tracing::{debug, info};

impl ClobKeeper {
    // 8.9.1: the shared matching step. matches on the live book; nothing is
    // written and the book is restored unless the whole placement succeeds.
    fn match_and_rest(
        &self,
        store: &mut dyn KvStore,
        pair: &ClobPair,
        order: &Order,
        remaining: u64,
        tx_bytes: Option<Vec<u8>>,
    ) -> Result<PlaceOrderResult, ClobError> {
        let order_id = &order.order_id;
        let mut memclob = self.write_memclob()?;
        let book = memclob
            .book_mut(pair.id)
            .map_err(|_| ClobError::ClobPairNotFound(pair.id))?;
        if book.contains(order_id) {
            return Err(BookError::DuplicateOrder(order_id.clone()).into());
        }
        if order.is_post_only() && book.would_cross(order.side, order.subticks) {
            return Err(ClobError::PostOnlyWouldCrossMakerOrder(order_id.clone()));
        }

        let mut branch = CacheStore::new(store);
        let mut applied: Vec<AppliedFill> = Vec::new();
        let mut stop_status: Option<OrderStatus> = None;
        let mut fatal: Option<ClobError> = None;
        let mut outcome = match_order(
            book,
            &MatchableOrder::Order(order.clone()),
            remaining,
            self.config.self_trade_policy,
            |maker, fill_amount| {
                let mut fill_store = CacheStore::new(&mut branch);
                let attempt = self
                    .process_single_order_fill(
                        &mut fill_store,
                        &mut PendingEvents::new(),
                        OPERATIONS_TX_INDEX,
                        pair,
                        order,
                        maker,
                        fill_amount,
                    )
                    .and_then(|fill| {
                        if fill.maker_fully_filled() && maker.is_stateful() {
                            self.delete_stateful_order(&mut fill_store, &maker.order_id)?;
                        }
                        Ok(fill)
                    });
                match attempt {
                    Ok(fill) => {
                        fill_store.commit();
                        applied.push(fill);
                        FillDecision::Accept
                    }
                    Err(err) => match classify_rejected_fill(err, maker) {
                        FillRejection::RemoveMaker(reason) => FillDecision::RemoveMaker(reason),
                        FillRejection::StopTaker(status) => {
                            stop_status = Some(status);
                            FillDecision::StopTaker
                        }
                        FillRejection::Fatal(err) => {
                            fatal = Some(err);
                            FillDecision::StopTaker
                        }
                    },
                }
            },
        )?;
        let undo = std::mem::take(&mut outcome.undo);
        if let Some(err) = fatal {
            book.restore(undo);
            return Err(err);
        }
        if order.is_fok() && outcome.remaining > 0 {
            book.restore(undo);
            return Err(ClobError::FokOrderCouldNotBeFullyFilled(order_id.clone()));
        }

        let status = match stop_status {
            Some(status) => status,
            None if outcome.stopped_by_self_trade => OrderStatus::SelfTradeStopped,
            None if order.is_ioc() && outcome.remaining > 0 => OrderStatus::RemainderCanceled,
            None => OrderStatus::Success,
        };
        let is_resting = outcome.remaining > 0 && status == OrderStatus::Success;
        if let Err(err) = self.settle_placement(&mut branch, order, &outcome, is_resting, tx_bytes) {
            book.restore(undo);
            return Err(err);
        }
        if is_resting {
            if let Err(err) = book.insert(order.clone(), outcome.remaining) {
                book.restore(undo);
                return Err(err.into());
            }
        }
        branch.commit();

        let filled_quantums = outcome.filled();
        debug!(
            %order_id,
            filled_quantums,
            remaining = outcome.remaining,
            is_resting,
            ?status,
            "placed order"
        );
        Ok(PlaceOrderResult {
            order_id: order_id.clone(),
            filled_quantums,
            remaining_quantums: outcome.remaining,
            is_resting,
            status,
            matches: applied.into_iter().map(|f| f.match_with_orders).collect(),
            removed_makers: outcome.removed_makers,
        })
    }

    /// State and queue writes of a matched placement.
    fn settle_placement(
        &self,
        branch: &mut dyn KvStore,
        order: &Order,
        outcome: &MatchOutcome,
        is_resting: bool,
        tx_bytes: Option<Vec<u8>>,
    ) -> Result<(), ClobError> {
        let order_id = &order.order_id;
        if outcome.remaining == 0 && order.is_stateful() {
            self.delete_stateful_order(branch, order_id)?;
        }

        let mut removals = Vec::new();
        for (maker_id, reason) in &outcome.removed_makers {
            if maker_id.is_stateful() && self.delete_stateful_order(branch, maker_id)? {
                removals.push((maker_id.clone(), *reason));
            }
        }

        let mut operations = self.operations_queue()?;
        if let Some(bytes) = tx_bytes {
            if (is_resting || !outcome.fills.is_empty()) && !operations.has_short_term_order_tx_bytes(order_id) {
                operations.add_short_term_order_tx_bytes(order, bytes)?;
            }
        }
        for (maker_id, reason) in removals {
            operations.add_order_removal(maker_id, reason)?;
        }
        if !outcome.fills.is_empty() {
            operations.add_order_match(order, &outcome.fills)?;
        }
        Ok(())
    }

    /// Unfilled quantums of an order, rejecting orders with nothing left.
    fn unfilled_quantums(&self, store: &dyn KvStore, order: &Order) -> Result<u64, ClobError> {
        let (_, filled, _) = self.get_order_fill_amount(store, &order.order_id)?;
        if filled >= order.quantums {
            return Err(ClobError::OrderFullyFilled(order.order_id.clone()));
        }
        Ok(order.quantums - filled)
    }

    // 8.9.2: local short-term placement, run against check state.
    pub fn place_short_term_order(
        &self,
        store: &mut dyn KvStore,
        block: &BlockContext,
        order: Order,
    ) -> Result<PlaceOrderResult, ClobError> {
        order.validate_basic()?;
        if !order.order_id.is_short_term() {
            return Err(OperationsError::NotShortTerm(order.order_id).into());
        }
        let pair = self.clob_pair_accepting(store, &order)?;
        order.validate_against(&pair)?;
        self.validate_good_til_block(&order, block)?;
        let remaining = self.unfilled_quantums(store, &order)?;
        let tx_bytes = place_order_tx_bytes(&order)?;
        self.match_and_rest(store, &pair, &order, remaining, Some(tx_bytes))
    }

    /// Takes a short-term order off the local book. an order already in the
    /// operations queue is still proposed.
    pub fn cancel_short_term_order(&self, order_id: &OrderId) -> Result<(), ClobError> {
        if !order_id.is_short_term() {
            return Err(OperationsError::NotShortTerm(order_id.clone()).into());
        }
        let mut memclob = self.write_memclob()?;
        memclob
            .remove_order(order_id)
            .ok_or_else(|| ClobError::OrderNotFound(order_id.clone()))?;
        match self.operations_queue()?.remove_short_term_order_tx_bytes(order_id) {
            Ok(()) => {}
            Err(OperationsError::AlreadyQueued(_)) => debug!(%order_id, "canceled order stays in the queue"),
            Err(err) => return Err(err.into()),
        }
        debug!(%order_id, "canceled short-term order");
        Ok(())
    }

    // 8.9.3: stateful placement inside a delivered block.
    pub fn place_stateful_order(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        block: &BlockContext,
        tx_index: u32,
        order: &Order,
    ) -> Result<(), ClobError> {
        let order_id = &order.order_id;
        order.validate_basic()?;
        if !order.is_stateful() {
            return Err(OperationsError::NotStateful(order_id.clone()).into());
        }
        let pair = self.clob_pair_accepting(store, order)?;
        order.validate_against(&pair)?;
        let good_til_block_time = order
            .good_til_block_time()
            .ok_or_else(|| OrderError::StatefulRequiresGoodTilBlockTime(order_id.clone()))?;
        self.validate_good_til_block_time(order_id, good_til_block_time, block)?;
        if self.get_stateful_order_placement(store, order_id)?.is_some() {
            return Err(ClobError::StatefulOrderAlreadyExists(order_id.clone()));
        }

        let conditional = order_id.order_flags == OrderFlags::Conditional;
        self.set_stateful_order_placement(
            store,
            &StatefulOrderPlacement {
                order: order.clone(),
                placement_height: block.height,
                triggered: !conditional,
            },
        )?;
        let mut summary = self.block_summary(store, block)?;
        summary.placed_stateful_order_ids.push(order_id.clone());
        self.set_block_summary(store, &summary)?;

        let event = if conditional {
            StatefulOrderEventV1::ConditionalPlacement { order: order.clone() }
        } else {
            StatefulOrderEventV1::Placement { order: order.clone() }
        };
        events.add_txn(tx_index, SUBTYPE_STATEFUL_ORDER, &event)?;
        info!(%order_id, height = block.height, "placed stateful order");
        Ok(())
    }

    pub fn cancel_stateful_order(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        block: &BlockContext,
        tx_index: u32,
        order_id: &OrderId,
        good_til_block_time: u32,
    ) -> Result<(), ClobError> {
        if !order_id.is_stateful() {
            return Err(OperationsError::NotStateful(order_id.clone()).into());
        }
        self.validate_good_til_block_time(order_id, good_til_block_time, block)?;
        if !self.delete_stateful_order(store, order_id)? {
            return Err(ClobError::StatefulOrderNotFound(order_id.clone()));
        }
        let mut summary = self.block_summary(store, block)?;
        summary.placed_stateful_cancellation_order_ids.push(order_id.clone());
        self.set_block_summary(store, &summary)?;

        events.add_txn(
            tx_index,
            SUBTYPE_STATEFUL_ORDER,
            &StatefulOrderEventV1::Cancelation {
                order_id: order_id.clone(),
            },
        )?;
        info!(%order_id, height = block.height, "canceled stateful order");
        Ok(())
    }

    /// Matches a committed stateful order against the local book and rests
    /// what is left.
    pub fn add_preexisting_stateful_order_to_book(
        &self,
        store: &mut dyn KvStore,
        order_id: &OrderId,
    ) -> Result<PlaceOrderResult, ClobError> {
        let placement = self
            .get_stateful_order_placement(store, order_id)?
            .ok_or_else(|| ClobError::StatefulOrderNotFound(order_id.clone()))?;
        if !placement.triggered {
            return Err(ClobError::ConditionalOrderUntriggered(order_id.clone()));
        }
        let order = placement.order;
        let pair = self.clob_pair_accepting(store, &order)?;
        let remaining = self.unfilled_quantums(store, &order)?;
        self.match_and_rest(store, &pair, &order, remaining, None)
    }

    /// Snapshot of the queue for the next proposal. cleared once a block commits.
    pub fn take_operations_to_propose(&self) -> Result<Vec<OperationRaw>, ClobError> {
        Ok(self.operations_queue()?.get_operations_to_propose())
    }
}
