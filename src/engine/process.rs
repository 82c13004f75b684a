// 8.8 engine/process.rs: deterministic replay of a proposed operations queue.
//
// every node runs the same queue against the same committed state and must end
// in the same state. replay never looks at the local books. any failing
// operation rejects the whole queue and nothing is written.

use super::core::{ClobKeeper, OPERATIONS_TX_INDEX};
use super::results::{ClobError, ProcessProposerMatchesEvents};
use crate::indexer::PendingEvents;
use crate::operations::{validate_and_transform_raw_operations, ClobMatch, InternalOperation, MatchOrders, OperationRaw, OrderRemoval};
use crate::order::{Order, OrderFlags, OrderId, OrderRemovalReason};
use crate::store::{get_value, set_value, CacheStore, KvStore, PROCESS_PROPOSER_MATCHES_EVENTS_KEY};
use crate::types::BlockContext;
use std::collections::BTreeMap;
use tracing::{info, warn};

impl ClobKeeper {
    /// Summary persisted by the last block that wrote one.
    pub fn get_process_proposer_matches_events(
        &self,
        store: &dyn KvStore,
    ) -> Result<ProcessProposerMatchesEvents, ClobError> {
        Ok(get_value(store, PROCESS_PROPOSER_MATCHES_EVENTS_KEY.as_bytes())?.unwrap_or_default())
    }

    /// The current block's summary. a summary left by an earlier block starts over.
    pub(super) fn block_summary(
        &self,
        store: &dyn KvStore,
        block: &BlockContext,
    ) -> Result<ProcessProposerMatchesEvents, ClobError> {
        let stored = self.get_process_proposer_matches_events(store)?;
        Ok(if stored.block_height == block.height {
            stored
        } else {
            ProcessProposerMatchesEvents::new(block.height)
        })
    }

    pub(super) fn set_block_summary(
        &self,
        store: &mut dyn KvStore,
        summary: &ProcessProposerMatchesEvents,
    ) -> Result<(), ClobError> {
        set_value(store, PROCESS_PROPOSER_MATCHES_EVENTS_KEY.as_bytes(), summary)?;
        Ok(())
    }

    /// Short-term orders come from this queue's placements, stateful orders from state.
    pub(super) fn resolve_order(
        &self,
        store: &dyn KvStore,
        placed: &BTreeMap<OrderId, Order>,
        order_id: &OrderId,
    ) -> Result<Order, ClobError> {
        if order_id.is_short_term() {
            return placed
                .get(order_id)
                .cloned()
                .ok_or_else(|| ClobError::OrderNotFound(order_id.clone()));
        }
        let placement = self
            .get_stateful_order_placement(store, order_id)?
            .ok_or_else(|| ClobError::StatefulOrderNotFound(order_id.clone()))?;
        if !placement.triggered {
            return Err(ClobError::ConditionalOrderUntriggered(order_id.clone()));
        }
        Ok(placement.order)
    }

    // 8.8.1: entry point for the operations tx. events reach `events` only when
    // the whole queue applies.
    pub fn process_proposer_operations(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        block: &BlockContext,
        operations: &[OperationRaw],
    ) -> Result<ProcessProposerMatchesEvents, ClobError> {
        let operations = validate_and_transform_raw_operations(operations)?;
        let mut branch = CacheStore::new(store);
        let mut queue_events = PendingEvents::new();
        let mut summary = self.block_summary(&branch, block)?;
        let mut placed: BTreeMap<OrderId, Order> = BTreeMap::new();

        for (index, operation) in operations.iter().enumerate() {
            self.replay_operation(&mut branch, block, &mut queue_events, &mut summary, &mut placed, operation)
                .map_err(|err| {
                    warn!(height = block.height, index, error = %err, "rejected proposed operations");
                    err
                })?;
        }

        self.set_block_summary(&mut branch, &summary)?;
        branch.commit();
        let emitted = queue_events.len();
        events.append(queue_events);
        info!(
            height = block.height,
            operations = operations.len(),
            filled = summary.order_ids_filled_in_last_block.len(),
            emitted,
            "processed proposer operations"
        );
        Ok(summary)
    }

    fn replay_operation(
        &self,
        store: &mut dyn KvStore,
        block: &BlockContext,
        events: &mut PendingEvents,
        summary: &mut ProcessProposerMatchesEvents,
        placed: &mut BTreeMap<OrderId, Order>,
        operation: &InternalOperation,
    ) -> Result<(), ClobError> {
        match operation {
            InternalOperation::ShortTermOrderPlacement(order) => {
                order.validate_basic()?;
                let pair = self.clob_pair_accepting(store, order)?;
                order.validate_against(&pair)?;
                self.validate_good_til_block(order, block)?;
                placed.insert(order.order_id.clone(), order.clone());
                Ok(())
            }
            InternalOperation::PreexistingStatefulOrder(order_id) => {
                self.resolve_order(store, placed, order_id).map(|_| ())
            }
            InternalOperation::OrderRemoval(removal) => self.replay_order_removal(store, events, summary, removal),
            InternalOperation::Match(ClobMatch::Orders(orders)) => {
                self.replay_match_orders(store, events, summary, placed, orders)
            }
            InternalOperation::Match(ClobMatch::PerpetualLiquidation(liquidation)) => {
                self.replay_liquidation(store, events, summary, placed, liquidation)
            }
            InternalOperation::Match(ClobMatch::PerpetualDeleveraging(deleveraging)) => {
                self.apply_deleveraging(store, events, OPERATIONS_TX_INDEX, deleveraging)
                    .map(|_| ())
            }
        }
    }

    fn replay_match_orders(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        summary: &mut ProcessProposerMatchesEvents,
        placed: &BTreeMap<OrderId, Order>,
        orders: &MatchOrders,
    ) -> Result<(), ClobError> {
        let taker = self.resolve_order(store, placed, &orders.taker_order_id)?;
        let pair = self.clob_pair_matching(store, taker.order_id.clob_pair_id)?;
        summary.order_ids_filled_in_last_block.push(taker.order_id.clone());

        let mut taker_total = 0;
        for fill in &orders.fills {
            let maker = self.resolve_order(store, placed, &fill.maker_order_id)?;
            let applied = self.process_single_order_fill(
                store,
                events,
                OPERATIONS_TX_INDEX,
                &pair,
                &taker,
                &maker,
                fill.fill_amount,
            )?;
            taker_total = applied.taker_total_filled;
            summary.order_ids_filled_in_last_block.push(maker.order_id.clone());
            if applied.maker_fully_filled() && maker.is_stateful() {
                self.remove_stateful_order(
                    store,
                    events,
                    OPERATIONS_TX_INDEX,
                    &maker.order_id,
                    OrderRemovalReason::FullyFilled,
                )?;
                summary.add_removed(maker.order_id.clone());
            }
        }

        if taker.is_fok() && taker_total < taker.quantums {
            return Err(ClobError::FokOrderCouldNotBeFullyFilled(taker.order_id));
        }
        if taker_total >= taker.quantums && taker.is_stateful() {
            self.remove_stateful_order(
                store,
                events,
                OPERATIONS_TX_INDEX,
                &taker.order_id,
                OrderRemovalReason::FullyFilled,
            )?;
            summary.add_removed(taker.order_id);
        }
        Ok(())
    }

    fn replay_order_removal(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        summary: &mut ProcessProposerMatchesEvents,
        removal: &OrderRemoval,
    ) -> Result<(), ClobError> {
        let order_id = &removal.order_id;
        let placement = self
            .get_stateful_order_placement(store, order_id)?
            .ok_or_else(|| ClobError::StatefulOrderNotFound(order_id.clone()))?;
        if placement.order.order_id.order_flags == OrderFlags::Conditional && !placement.triggered {
            return Err(ClobError::ConditionalOrderUntriggered(order_id.clone()));
        }
        self.remove_stateful_order(store, events, OPERATIONS_TX_INDEX, order_id, removal.removal_reason)?;
        summary.add_removed(order_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::app::{App, BTC, GENESIS_TIME, USDC};
    use crate::config::{ClobConfig, FeeTierParams};
    use crate::engine::ClobError;
    use crate::indexer::PendingEvents;
    use crate::operations::{
        place_order_tx_bytes, ClobMatch, DeleveragingFill, MatchOrders, MatchPerpetualDeleveraging, OperationRaw,
        OperationsError, ProposedFill,
    };
    use crate::operations::OrderRemoval;
    use crate::order::{GoodTil, Order, OrderFlags, OrderId, OrderRemovalReason, TimeInForce};
    use crate::proposal::{Msg, MsgPlaceOrder, Tx};
    use crate::store::{set_value, u32_key, CLOB_PAIR_PREFIX};
    use crate::subaccount::SubaccountLedger;
    use crate::types::{BlockContext, ClobPairId, PerpetualId, Side, SubaccountId};

    fn block() -> BlockContext {
        BlockContext::at(2, GENESIS_TIME + 1)
    }

    fn order(owner: &str, side: Side) -> Order {
        Order {
            order_id: OrderId::new(SubaccountId::new(owner, 0), 0, OrderFlags::ShortTerm, ClobPairId(0)),
            side,
            quantums: 1_000_000,
            subticks: 50_000_000_000,
            good_til: GoodTil::Block(5),
            time_in_force: TimeInForce::Unspecified,
            reduce_only: false,
            condition: None,
        }
    }

    fn matched(taker: &Order, maker: &Order) -> Vec<OperationRaw> {
        vec![
            OperationRaw::ShortTermOrderPlacement(place_order_tx_bytes(maker).unwrap()),
            OperationRaw::ShortTermOrderPlacement(place_order_tx_bytes(taker).unwrap()),
            OperationRaw::Match(ClobMatch::Orders(MatchOrders {
                taker_order_id: taker.order_id.clone(),
                fills: vec![ProposedFill {
                    maker_order_id: maker.order_id.clone(),
                    fill_amount: maker.quantums,
                }],
            })),
        ]
    }

    #[test]
    fn replayed_match_settles_quote_and_fees() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        app.fund_subaccount(SubaccountId::new("alice", 0), 100_000 * USDC, 0).unwrap();
        app.fund_subaccount(SubaccountId::new("bob", 0), 100_000 * USDC, BTC).unwrap();
        let (alice, bob) = (order("alice", Side::Buy), order("bob", Side::Sell));
        let mut store = app.committed().clone();

        let summary = app
            .clob()
            .process_proposer_operations(&mut store, &mut PendingEvents::new(), &block(), &matched(&alice, &bob))
            .unwrap();
        assert_eq!(summary.order_ids_filled_in_last_block, vec![alice.order_id.clone(), bob.order_id.clone()]);

        // $500 notional, 500 ppm taker and 200 ppm maker fees
        let ledger = app.clob().subaccounts();
        let a = ledger.get_subaccount(&store, &alice.order_id.subaccount_id).unwrap();
        let b = ledger.get_subaccount(&store, &bob.order_id.subaccount_id).unwrap();
        assert_eq!(a.quote_balance, 100_000 * USDC - 500 * USDC - 250_000);
        assert_eq!(b.quote_balance, 100_000 * USDC + 500 * USDC - 100_000);
        assert_eq!(a.position_quantums(PerpetualId(0)), 1_000_000);
        assert_eq!(b.position_quantums(PerpetualId(0)), i128::from(BTC) - 1_000_000);
        assert_eq!(a.position(PerpetualId(0)).unwrap().funding_index, 0);
        assert_eq!(app.clob().get_order_fill_amount(&store, &alice.order_id).unwrap(), (true, 1_000_000, 5));
    }

    #[test]
    fn failing_operation_rejects_the_whole_queue() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        app.fund_subaccount(SubaccountId::new("alice", 0), 100_000 * USDC, 0).unwrap();
        app.fund_subaccount(SubaccountId::new("bob", 0), 100_000 * USDC, 0).unwrap();
        let (alice, bob) = (order("alice", Side::Buy), order("bob", Side::Sell));
        let mut operations = matched(&alice, &bob);
        // the same fill again overfills both orders
        operations.push(operations[2].clone());
        let mut store = app.committed().clone();

        let err = app
            .clob()
            .process_proposer_operations(&mut store, &mut PendingEvents::new(), &block(), &operations)
            .unwrap_err();
        assert!(matches!(err, ClobError::OrderOverfilled { .. }));
        assert_eq!(&store, app.committed());
    }

    #[test]
    fn deleveraging_requires_a_liquidatable_subaccount() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        let carl = SubaccountId::new("carl", 0);
        let dave = SubaccountId::new("dave", 0);
        app.fund_subaccount(carl.clone(), 55_000 * USDC, -BTC).unwrap();
        app.fund_subaccount(dave.clone(), 50_000 * USDC, BTC).unwrap();
        let operations = vec![OperationRaw::Match(ClobMatch::PerpetualDeleveraging(MatchPerpetualDeleveraging {
            liquidated: carl.clone(),
            perpetual_id: PerpetualId(0),
            fills: vec![DeleveragingFill {
                offsetting_subaccount_id: dave,
                fill_amount: BTC as u64,
            }],
        }))];
        let mut store = app.committed().clone();

        let err = app
            .clob()
            .process_proposer_operations(&mut store, &mut PendingEvents::new(), &block(), &operations)
            .unwrap_err();
        assert!(err.to_string().contains("DeleveragedSubaccountNotLiquidatable"));
        assert_eq!(&store, app.committed());
    }

    #[test]
    fn match_needs_a_placed_maker() {
        let app = App::with_btc_market(ClobConfig::default()).unwrap();
        let (alice, bob) = (order("alice", Side::Buy), order("bob", Side::Sell));
        let mut operations = matched(&alice, &bob);
        operations.remove(0);
        let mut store = app.committed().clone();
        assert_eq!(
            app.clob()
                .process_proposer_operations(&mut store, &mut PendingEvents::new(), &block(), &operations)
                .unwrap_err(),
            ClobError::Operations(OperationsError::OrderNotPlaced(bob.order_id.clone()))
        );
    }

    #[test]
    fn removing_an_order_twice_rejects_the_queue() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        let alice = SubaccountId::new("alice", 0);
        app.fund_subaccount(alice.clone(), 100_000 * USDC, 0).unwrap();
        let long_term = Order {
            order_id: OrderId::new(alice, 3, OrderFlags::LongTerm, ClobPairId(0)),
            good_til: GoodTil::BlockTime((GENESIS_TIME + 600) as u32),
            ..order("alice", Side::Buy)
        };
        let place = Tx::single(Msg::PlaceOrder(MsgPlaceOrder { order: long_term.clone() }));
        let proposal = app.propose(Vec::new(), &[place]).unwrap();
        app.deliver_block(&proposal).unwrap();

        let removal = OperationRaw::OrderRemoval(OrderRemoval {
            order_id: long_term.order_id.clone(),
            removal_reason: OrderRemovalReason::Undercollateralized,
        });
        let mut store = app.committed().clone();
        let mut events = PendingEvents::new();
        let err = app
            .clob()
            .process_proposer_operations(&mut store, &mut events, &app.next_block(), &[removal.clone(), removal])
            .unwrap_err();
        assert_eq!(err, ClobError::StatefulOrderNotFound(long_term.order_id.clone()));
        assert_eq!(&store, app.committed());
        assert!(events.is_empty());
        assert!(app
            .clob()
            .get_stateful_order_placement(app.committed(), &long_term.order_id)
            .unwrap()
            .is_some());
    }

    #[test]
    fn fills_pay_the_pair_fees() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        app.fund_subaccount(SubaccountId::new("alice", 0), 100_000 * USDC, 0).unwrap();
        app.fund_subaccount(SubaccountId::new("bob", 0), 100_000 * USDC, BTC).unwrap();
        let (alice, bob) = (order("alice", Side::Buy), order("bob", Side::Sell));
        let mut store = app.committed().clone();
        let pair = app
            .clob()
            .get_clob_pair(&store, ClobPairId(0))
            .unwrap()
            .with_fees(FeeTierParams {
                maker_fee_ppm: -100,
                taker_fee_ppm: 1_000,
            });
        set_value(&mut store, &u32_key(CLOB_PAIR_PREFIX, 0), &pair).unwrap();

        app.clob()
            .process_proposer_operations(&mut store, &mut PendingEvents::new(), &block(), &matched(&alice, &bob))
            .unwrap();

        // $500 notional: the taker pays $0.50, the maker earns a $0.05 rebate
        let ledger = app.clob().subaccounts();
        let a = ledger.get_subaccount(&store, &alice.order_id.subaccount_id).unwrap();
        let b = ledger.get_subaccount(&store, &bob.order_id.subaccount_id).unwrap();
        assert_eq!(a.quote_balance, 100_000 * USDC - 500 * USDC - 500_000);
        assert_eq!(b.quote_balance, 100_000 * USDC + 500 * USDC + 50_000);
    }
}
