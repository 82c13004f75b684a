// 8.4 engine/stateful_orders.rs: long-term and conditional orders live in state
// until they are filled, canceled, expired or removed.

use super::core::ClobKeeper;
use super::results::ClobError;
use crate::order::{Order, OrderFlags, OrderId};
use crate::store::{encoded_key, get_all_values, get_value, set_value, KvStore, StoreError, STATEFUL_ORDER_PREFIX};
use crate::types::BlockContext;
use serde::{Deserialize, Serialize};

/// Furthest a stateful order's good-til-block-time may lie past the block time.
pub const STATEFUL_ORDER_TIME_WINDOW_SECS: i64 = 95 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulOrderPlacement {
    pub order: Order,
    pub placement_height: u32,
    /// Always true for long-term orders.
    pub triggered: bool,
}

fn placement_key(order_id: &OrderId) -> Result<Vec<u8>, StoreError> {
    encoded_key(STATEFUL_ORDER_PREFIX, order_id)
}

impl ClobKeeper {
    pub fn set_stateful_order_placement(
        &self,
        store: &mut dyn KvStore,
        placement: &StatefulOrderPlacement,
    ) -> Result<(), ClobError> {
        set_value(store, &placement_key(&placement.order.order_id)?, placement)?;
        Ok(())
    }

    pub fn get_stateful_order_placement(
        &self,
        store: &dyn KvStore,
        order_id: &OrderId,
    ) -> Result<Option<StatefulOrderPlacement>, ClobError> {
        Ok(get_value(store, &placement_key(order_id)?)?)
    }

    /// Drops the placement and its fill state. false if nothing was stored.
    pub fn delete_stateful_order(&self, store: &mut dyn KvStore, order_id: &OrderId) -> Result<bool, ClobError> {
        let key = placement_key(order_id)?;
        if !store.has(&key) {
            return Ok(false);
        }
        store.delete(&key);
        self.remove_order_fill_amount(store, order_id)?;
        Ok(true)
    }

    /// Sorted by order id.
    pub fn get_all_stateful_orders(&self, store: &dyn KvStore) -> Result<Vec<StatefulOrderPlacement>, ClobError> {
        let mut placements: Vec<StatefulOrderPlacement> = get_all_values(store, STATEFUL_ORDER_PREFIX)?;
        placements.sort_by(|a, b| a.order.order_id.cmp(&b.order.order_id));
        Ok(placements)
    }

    /// Orders whose good-til-block-time is at or before `block_time_secs`.
    pub fn get_expired_stateful_order_ids(
        &self,
        store: &dyn KvStore,
        block_time_secs: i64,
    ) -> Result<Vec<OrderId>, ClobError> {
        Ok(self
            .get_all_stateful_orders(store)?
            .into_iter()
            .filter(|p| {
                p.order
                    .good_til_block_time()
                    .is_some_and(|gtbt| i64::from(gtbt) <= block_time_secs)
            })
            .map(|p| p.order.order_id)
            .collect())
    }

    pub fn get_untriggered_conditional_orders(&self, store: &dyn KvStore) -> Result<Vec<Order>, ClobError> {
        Ok(self
            .get_all_stateful_orders(store)?
            .into_iter()
            .filter(|p| p.order.order_id.order_flags == OrderFlags::Conditional && !p.triggered)
            .map(|p| p.order)
            .collect())
    }

    pub(super) fn validate_good_til_block(&self, order: &Order, block: &BlockContext) -> Result<(), ClobError> {
        let Some(good_til_block) = order.good_til_block() else {
            return Ok(());
        };
        let max = block.height.saturating_add(self.config.short_block_window);
        if good_til_block < block.height || good_til_block > max {
            return Err(ClobError::GoodTilBlockOutOfRange {
                order_id: order.order_id.clone(),
                good_til_block,
                height: block.height,
                max,
            });
        }
        Ok(())
    }

    pub(super) fn validate_good_til_block_time(&self, order_id: &OrderId, good_til_block_time: u32, block: &BlockContext) -> Result<(), ClobError> {
        let block_time = block.unix_seconds();
        let max = block_time + STATEFUL_ORDER_TIME_WINDOW_SECS;
        let gtbt = i64::from(good_til_block_time);
        if gtbt <= block_time || gtbt > max {
            return Err(ClobError::GoodTilBlockTimeOutOfRange {
                order_id: order_id.clone(),
                good_til_block_time,
                block_time,
                max,
            });
        }
        Ok(())
    }
}
