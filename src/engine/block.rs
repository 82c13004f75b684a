// 8.10 engine/block.rs: block lifecycle hooks.
//
// begin_block and end_block run on the delivered block's store. prepare_check_state
// runs after commit and brings the local books in line with what the block did.

use super::core::ClobKeeper;
use super::results::{ClobError, ProcessProposerMatchesEvents};
use crate::indexer::{BlockEventKind, PendingEvents, StatefulOrderEventV1, SUBTYPE_STATEFUL_ORDER};
use crate::operations::place_order_tx_bytes;
use crate::order::{Order, OrderFlags, OrderId};
use crate::registry::PerpetualsRegistry;
use crate::stats::EpochInfo;
use crate::store::{clear_prefix, KvStore, TRANSIENT_PREFIX};
use crate::types::{BlockContext, ClobPairId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

impl ClobKeeper {
    pub fn begin_block(&self, store: &mut dyn KvStore, block: &BlockContext) {
        let cleared = clear_prefix(store, TRANSIENT_PREFIX);
        debug!(height = block.height, cleared, "begin block");
    }

    // 8.10.1: prune, expire, trigger, then fold stats.
    pub fn end_block(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        block: &BlockContext,
    ) -> Result<ProcessProposerMatchesEvents, ClobError> {
        let mut summary = self.block_summary(store, block)?;
        let block_time = block.unix_seconds();

        let pruned = self.prune_orders_for_block_height(store, block.height)?;

        for order_id in self.get_expired_stateful_order_ids(store, block_time)? {
            self.delete_stateful_order(store, &order_id)?;
            events.add_block(
                SUBTYPE_STATEFUL_ORDER,
                &StatefulOrderEventV1::Expiration {
                    order_id: order_id.clone(),
                },
                BlockEventKind::EndBlock,
            )?;
            summary.expired_stateful_order_ids.push(order_id);
        }

        let triggered = self.trigger_conditional_orders(store)?;
        for order_id in &triggered {
            events.add_block(
                SUBTYPE_STATEFUL_ORDER,
                &StatefulOrderEventV1::ConditionalTriggered {
                    order_id: order_id.clone(),
                },
                BlockEventKind::EndBlock,
            )?;
        }
        summary
            .conditional_order_ids_triggered_in_last_block
            .extend(triggered);

        let epoch = EpochInfo::at(block_time, self.config.stats_epoch_secs);
        self.stats.process_block_stats(store, &epoch)?;
        self.stats.expire_old_stats(store, &epoch, block_time)?;

        self.set_block_summary(store, &summary)?;
        info!(
            height = block.height,
            pruned = pruned.len(),
            expired = summary.expired_stateful_order_ids.len(),
            triggered = summary.conditional_order_ids_triggered_in_last_block.len(),
            "end block"
        );
        Ok(summary)
    }

    /// Flags every untriggered conditional order whose trigger the oracle price has reached.
    fn trigger_conditional_orders(&self, store: &mut dyn KvStore) -> Result<Vec<OrderId>, ClobError> {
        let mut oracle: BTreeMap<ClobPairId, u64> = BTreeMap::new();
        let mut triggered = Vec::new();
        for order in self.get_untriggered_conditional_orders(store)? {
            let Some(condition) = order.condition else {
                continue;
            };
            let clob_pair_id = order.order_id.clob_pair_id;
            let oracle_subticks = match oracle.get(&clob_pair_id) {
                Some(subticks) => *subticks,
                None => {
                    let pair = self.get_clob_pair(store, clob_pair_id)?;
                    let subticks = self.perpetuals.get_oracle_subticks(store, &pair)?;
                    oracle.insert(clob_pair_id, subticks);
                    subticks
                }
            };
            if !condition.is_triggered(order.side, oracle_subticks) {
                continue;
            }
            let Some(mut placement) = self.get_stateful_order_placement(store, &order.order_id)? else {
                continue;
            };
            placement.triggered = true;
            self.set_stateful_order_placement(store, &placement)?;
            debug!(order_id = %order.order_id, oracle_subticks, "triggered conditional order");
            triggered.push(order.order_id);
        }
        Ok(triggered)
    }

    // 8.10.2: `store` is the fresh check state for `next_block`.
    pub fn prepare_check_state(&self, store: &mut dyn KvStore, next_block: &BlockContext) -> Result<(), ClobError> {
        let summary = self.get_process_proposer_matches_events(store)?;
        let mut memclob = self.write_memclob()?;

        let filled: BTreeSet<&OrderId> = summary.order_ids_filled_in_last_block.iter().collect();
        for order_id in filled {
            let Some(resting) = memclob.find_order(order_id) else {
                continue;
            };
            let (current, quantums) = (resting.remaining, resting.order.quantums);
            let (_, filled_amount, _) = self.get_order_fill_amount(store, order_id)?;
            let target = quantums.saturating_sub(filled_amount);
            if target < current {
                memclob.book_mut(order_id.clob_pair_id)?.reduce(order_id, current - target)?;
            }
        }

        let gone = summary
            .removed_stateful_order_ids
            .iter()
            .chain(&summary.expired_stateful_order_ids)
            .chain(&summary.placed_stateful_cancellation_order_ids);
        for order_id in gone {
            memclob.remove_order(order_id);
        }

        let mut resting_short_term: Vec<Order> = Vec::new();
        for clob_pair_id in memclob.clob_pair_ids() {
            let book = memclob.book_mut(clob_pair_id)?;
            for order_id in book.order_ids() {
                let Some(resting) = book.get(&order_id) else {
                    continue;
                };
                let Some(good_til_block) = resting.order.good_til_block() else {
                    continue;
                };
                if good_til_block < next_block.height {
                    book.remove(&order_id);
                } else {
                    resting_short_term.push(resting.order.clone());
                }
            }
        }

        {
            let mut operations = self.operations_queue()?;
            operations.clear();
            for order in &resting_short_term {
                operations.add_short_term_order_tx_bytes(order, place_order_tx_bytes(order)?)?;
            }
        }
        drop(memclob);

        let to_add = summary
            .placed_stateful_order_ids
            .iter()
            .filter(|id| id.order_flags == OrderFlags::LongTerm)
            .chain(&summary.conditional_order_ids_triggered_in_last_block);
        let mut added = 0usize;
        for order_id in to_add {
            if self.resting_quantums(order_id)?.is_some() {
                continue;
            }
            match self.add_preexisting_stateful_order_to_book(store, order_id) {
                Ok(_) => added += 1,
                Err(err) => warn!(%order_id, error = %err, "stateful order not added to book"),
            }
        }
        debug!(
            next_height = next_block.height,
            resting_short_term = resting_short_term.len(),
            added,
            "prepared check state"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::app::{App, GENESIS_TIME, USDC};
    use crate::config::ClobConfig;
    use crate::engine::{ClobError, StatefulOrderPlacement};
    use crate::indexer::PendingEvents;
    use crate::order::{ConditionType, GoodTil, Order, OrderCondition, OrderFlags, OrderId, TimeInForce};
    use crate::registry::{MarketPriceUpdate, PerpetualsRegistry};
    use crate::types::{BlockContext, ClobPairId, MarketId, Side, SubaccountId};

    const PRICE: u64 = 50_000_000_000;

    fn stateful(owner: &str, flags: OrderFlags, gtbt: u32) -> Order {
        Order {
            order_id: OrderId::new(SubaccountId::new(owner, 0), 1, flags, ClobPairId(0)),
            side: Side::Buy,
            quantums: 10,
            subticks: PRICE,
            good_til: GoodTil::BlockTime(gtbt),
            time_in_force: TimeInForce::Unspecified,
            reduce_only: false,
            condition: (flags == OrderFlags::Conditional).then_some(OrderCondition {
                condition_type: ConditionType::TakeProfit,
                trigger_subticks: 45_000_000_000,
            }),
        }
    }

    fn app() -> App {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        app.fund_subaccount(SubaccountId::new("alice", 0), 10_000 * USDC, 0).unwrap();
        app
    }

    #[test]
    fn expired_stateful_orders_are_removed() {
        let app = app();
        let gtbt = (GENESIS_TIME + 10) as u32;
        let order = stateful("alice", OrderFlags::LongTerm, gtbt);
        let mut store = app.committed().clone();
        let mut events = PendingEvents::new();
        let clob = app.clob();
        let placed_at = BlockContext::at(2, GENESIS_TIME + 1);
        clob.place_stateful_order(&mut store, &mut events, &placed_at, 1, &order).unwrap();

        let summary = clob.end_block(&mut store, &mut events, &BlockContext::at(3, GENESIS_TIME + 5)).unwrap();
        assert!(summary.expired_stateful_order_ids.is_empty());

        let summary = clob.end_block(&mut store, &mut events, &BlockContext::at(4, i64::from(gtbt))).unwrap();
        assert_eq!(summary.expired_stateful_order_ids, vec![order.order_id.clone()]);
        assert_eq!(clob.get_stateful_order_placement(&store, &order.order_id).unwrap(), None);
        // placement, then expiration
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn conditional_triggers_on_oracle_move() {
        let app = app();
        let order = stateful("alice", OrderFlags::Conditional, (GENESIS_TIME + 1_000) as u32);
        let mut store = app.committed().clone();
        let mut events = PendingEvents::new();
        let clob = app.clob();
        clob.place_stateful_order(&mut store, &mut events, &BlockContext::at(2, GENESIS_TIME + 1), 1, &order)
            .unwrap();

        let summary = clob.end_block(&mut store, &mut events, &BlockContext::at(2, GENESIS_TIME + 1)).unwrap();
        assert!(summary.conditional_order_ids_triggered_in_last_block.is_empty());

        app.perpetuals()
            .update_market_prices(
                &mut store,
                &[MarketPriceUpdate {
                    market_id: MarketId(0),
                    price: 4_400_000_000,
                }],
            )
            .unwrap();
        let pair = clob.get_clob_pair(&store, ClobPairId(0)).unwrap();
        assert!(app.perpetuals().get_oracle_subticks(&store, &pair).unwrap() < 45_000_000_000);

        let summary = clob.end_block(&mut store, &mut events, &BlockContext::at(3, GENESIS_TIME + 2)).unwrap();
        assert_eq!(summary.conditional_order_ids_triggered_in_last_block, vec![order.order_id.clone()]);
        let placement: StatefulOrderPlacement = clob
            .get_stateful_order_placement(&store, &order.order_id)
            .unwrap()
            .unwrap();
        assert!(placement.triggered);
    }

    #[test]
    fn stale_short_term_orders_leave_the_book() {
        let mut app = app();
        let order = Order {
            order_id: OrderId::new(SubaccountId::new("alice", 0), 0, OrderFlags::ShortTerm, ClobPairId(0)),
            side: Side::Buy,
            quantums: 10,
            subticks: PRICE,
            good_til: GoodTil::Block(2),
            time_in_force: TimeInForce::Unspecified,
            reduce_only: false,
            condition: None,
        };
        app.place_short_term_order(order.clone()).unwrap();
        assert_eq!(app.clob().resting_quantums(&order.order_id).unwrap(), Some(10));

        let mut store = app.committed().clone();
        app.clob().prepare_check_state(&mut store, &BlockContext::at(3, GENESIS_TIME + 3)).unwrap();
        assert_eq!(app.clob().resting_quantums(&order.order_id).unwrap(), None);
        assert!(app.clob().take_operations_to_propose().unwrap().is_empty());
    }

    #[test]
    fn untriggered_conditional_stays_off_book() {
        let app = app();
        let order = stateful("alice", OrderFlags::Conditional, (GENESIS_TIME + 1_000) as u32);
        let mut store = app.committed().clone();
        let mut events = PendingEvents::new();
        app.clob()
            .place_stateful_order(&mut store, &mut events, &BlockContext::at(2, GENESIS_TIME + 1), 1, &order)
            .unwrap();
        assert_eq!(
            app.clob().add_preexisting_stateful_order_to_book(&mut store, &order.order_id).unwrap_err(),
            ClobError::ConditionalOrderUntriggered(order.order_id)
        );
    }
}
