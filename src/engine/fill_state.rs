// 8.2 engine/fill_state.rs: cumulative fill amounts and height-indexed pruning.
//
// a fill state is (fill amount, prunable block height). the per-height index
// lists order ids that may be pruned at that height, sorted and deduplicated so
// the stored bytes never depend on call order.

use super::core::ClobKeeper;
use super::results::ClobError;
use crate::order::OrderId;
use crate::store::{
    encoded_key, get_value, set_value, u32_key, KvStore, StoreError, ORDER_AMOUNT_PREFIX,
    PRUNABLE_ORDERS_PREFIX,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFillState {
    pub fill_amount: u64,
    pub prunable_block_height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentiallyPrunableOrders {
    pub order_ids: Vec<OrderId>,
}

/// Prunable height of stateful orders. they leave only through explicit removal.
pub const STATEFUL_PRUNABLE_BLOCK_HEIGHT: u32 = u32::MAX;

fn fill_key(order_id: &OrderId) -> Result<Vec<u8>, StoreError> {
    encoded_key(ORDER_AMOUNT_PREFIX, order_id)
}

impl ClobKeeper {
    /// Overwrites both fields.
    pub fn set_order_fill_amount(
        &self,
        store: &mut dyn KvStore,
        order_id: &OrderId,
        fill_amount: u64,
        prunable_block_height: u32,
    ) -> Result<(), ClobError> {
        let state = OrderFillState {
            fill_amount,
            prunable_block_height,
        };
        set_value(store, &fill_key(order_id)?, &state)?;
        Ok(())
    }

    /// `(exists, fill_amount, prunable_block_height)`. never set and pruned read the same.
    pub fn get_order_fill_amount(
        &self,
        store: &dyn KvStore,
        order_id: &OrderId,
    ) -> Result<(bool, u64, u32), ClobError> {
        let state: Option<OrderFillState> = get_value(store, &fill_key(order_id)?)?;
        Ok(match state {
            Some(s) => (true, s.fill_amount, s.prunable_block_height),
            None => (false, 0, 0),
        })
    }

    pub fn remove_order_fill_amount(&self, store: &mut dyn KvStore, order_id: &OrderId) -> Result<(), ClobError> {
        store.delete(&fill_key(order_id)?);
        Ok(())
    }

    pub fn add_orders_for_pruning(
        &self,
        store: &mut dyn KvStore,
        order_ids: &[OrderId],
        block_height: u32,
    ) -> Result<(), ClobError> {
        let key = u32_key(PRUNABLE_ORDERS_PREFIX, block_height);
        let mut prunable: PotentiallyPrunableOrders = get_value(store, &key)?.unwrap_or_default();
        prunable.order_ids.extend(order_ids.iter().cloned());
        prunable.order_ids.sort();
        prunable.order_ids.dedup();
        set_value(store, &key, &prunable)?;
        Ok(())
    }

    pub fn get_prunable_orders(
        &self,
        store: &dyn KvStore,
        block_height: u32,
    ) -> Result<PotentiallyPrunableOrders, ClobError> {
        let key = u32_key(PRUNABLE_ORDERS_PREFIX, block_height);
        Ok(get_value(store, &key)?.unwrap_or_default())
    }

    // 8.2.1: a fill state survives if a later fill moved its prunable height.
    pub fn prune_orders_for_block_height(
        &self,
        store: &mut dyn KvStore,
        block_height: u32,
    ) -> Result<Vec<OrderId>, ClobError> {
        let key = u32_key(PRUNABLE_ORDERS_PREFIX, block_height);
        let Some(prunable) = get_value::<PotentiallyPrunableOrders>(store, &key)? else {
            return Ok(Vec::new());
        };

        let mut pruned = Vec::new();
        for order_id in prunable.order_ids {
            let (exists, _, prunable_height) = self.get_order_fill_amount(store, &order_id)?;
            if exists && prunable_height == block_height {
                self.remove_order_fill_amount(store, &order_id)?;
                pruned.push(order_id);
            }
        }
        store.delete(&key);
        if !pruned.is_empty() {
            debug!(block_height, pruned = pruned.len(), "pruned order fill amounts");
        }
        Ok(pruned)
    }

    /// Every fill state, sorted by order id.
    pub fn get_all_order_fill_states(
        &self,
        store: &dyn KvStore,
    ) -> Result<Vec<(OrderId, OrderFillState)>, ClobError> {
        let prefix = ORDER_AMOUNT_PREFIX.as_bytes();
        let mut states = Vec::new();
        for (key, value) in store.prefix_entries(prefix) {
            let decode_err = |e: bincode::Error| StoreError::Decode {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            };
            let order_id: OrderId = bincode::deserialize(&key[prefix.len()..]).map_err(decode_err)?;
            let state: OrderFillState = bincode::deserialize(&value).map_err(decode_err)?;
            states.push((order_id, state));
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(states)
    }
}
