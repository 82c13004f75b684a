// 11.0: indexer events. every state change the off-chain indexer needs to
// rebuild its view becomes an event. payloads are JSON; ordering within a block
// is transaction events (by tx index, then emission order) followed by
// begin-block and end-block events.

use crate::order::{LiquidationOrder, MatchableOrder, Order, OrderId, OrderRemovalReason};
use crate::subaccount::PerpetualPosition;
use crate::types::{ClobPairId, MarketId, PerpetualId, SubaccountId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub const SUBTYPE_ORDER_FILL: &str = "order_fill";
pub const SUBTYPE_SUBACCOUNT_UPDATE: &str = "subaccount_update";
pub const SUBTYPE_DELEVERAGING: &str = "deleveraging";
pub const SUBTYPE_STATEFUL_ORDER: &str = "stateful_order";
pub const SUBTYPE_PERPETUAL_MARKET: &str = "perpetual_market";
pub const SUBTYPE_MARKET: &str = "market";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockEventKind {
    BeginBlock,
    EndBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrdering {
    Transaction(u32),
    Block(BlockEventKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerEvent {
    pub subtype: String,
    pub data: String,
    pub ordering: EventOrdering,
    /// Position within its transaction or block phase.
    pub event_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerBlock {
    pub height: u32,
    pub time: DateTime<Utc>,
    pub events: Vec<IndexerEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexerError {
    #[error("failed to encode {subtype} event: {reason}")]
    Encode { subtype: String, reason: String },
}

pub fn encode_event<T: Serialize>(subtype: &str, event: &T) -> Result<String, IndexerError> {
    serde_json::to_string(event).map_err(|e| IndexerError::Encode {
        subtype: subtype.to_string(),
        reason: e.to_string(),
    })
}

/// Write-only sink. fire and forget.
pub trait IndexerEventManager: Send + Sync {
    fn enabled(&self) -> bool;

    fn add_txn_event(&self, tx_index: u32, subtype: &str, data: String);

    fn add_block_event(&self, subtype: &str, data: String, kind: BlockEventKind);
}

#[derive(Debug, Clone)]
struct RawEvent {
    subtype: String,
    data: String,
    ordering: EventOrdering,
}

/// In-process event manager. buffers events until `produce_block`.
#[derive(Debug)]
pub struct IndexerEventCollector {
    enabled: bool,
    events: Mutex<Vec<RawEvent>>,
}

impl IndexerEventCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, event: RawEvent) {
        if !self.enabled {
            return;
        }
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    pub fn pending(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drains everything added so far into an ordered block.
    pub fn produce_block(&self, height: u32, time: DateTime<Utc>) -> IndexerBlock {
        let raw: Vec<RawEvent> = {
            let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *events)
        };

        let mut txn: Vec<RawEvent> = Vec::new();
        let mut begin: Vec<RawEvent> = Vec::new();
        let mut end: Vec<RawEvent> = Vec::new();
        for event in raw {
            match event.ordering {
                EventOrdering::Transaction(_) => txn.push(event),
                EventOrdering::Block(BlockEventKind::BeginBlock) => begin.push(event),
                EventOrdering::Block(BlockEventKind::EndBlock) => end.push(event),
            }
        }
        // stable: emission order within a transaction survives
        txn.sort_by_key(|e| match e.ordering {
            EventOrdering::Transaction(index) => index,
            EventOrdering::Block(_) => u32::MAX,
        });

        let mut events = Vec::with_capacity(txn.len() + begin.len() + end.len());
        let mut current_tx: Option<u32> = None;
        let mut index = 0u32;
        for event in txn {
            let EventOrdering::Transaction(tx) = event.ordering else {
                continue;
            };
            if current_tx != Some(tx) {
                current_tx = Some(tx);
                index = 0;
            }
            events.push(IndexerEvent {
                subtype: event.subtype,
                data: event.data,
                ordering: event.ordering,
                event_index: index,
            });
            index += 1;
        }
        for group in [begin, end] {
            for (index, event) in group.into_iter().enumerate() {
                events.push(IndexerEvent {
                    subtype: event.subtype,
                    data: event.data,
                    ordering: event.ordering,
                    event_index: index as u32,
                });
            }
        }

        IndexerBlock { height, time, events }
    }
}

impl Default for IndexerEventCollector {
    fn default() -> Self {
        Self::new(true)
    }
}

impl IndexerEventManager for IndexerEventCollector {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn add_txn_event(&self, tx_index: u32, subtype: &str, data: String) {
        self.push(RawEvent {
            subtype: subtype.to_string(),
            data,
            ordering: EventOrdering::Transaction(tx_index),
        });
    }

    fn add_block_event(&self, subtype: &str, data: String, kind: BlockEventKind) {
        self.push(RawEvent {
            subtype: subtype.to_string(),
            data,
            ordering: EventOrdering::Block(kind),
        });
    }
}

/// Events held back until the state they describe is committed.
#[derive(Debug, Default)]
pub struct PendingEvents {
    events: Vec<RawEvent>,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txn<T: Serialize>(&mut self, tx_index: u32, subtype: &str, event: &T) -> Result<(), IndexerError> {
        let data = encode_event(subtype, event)?;
        self.events.push(RawEvent {
            subtype: subtype.to_string(),
            data,
            ordering: EventOrdering::Transaction(tx_index),
        });
        Ok(())
    }

    pub fn add_block<T: Serialize>(
        &mut self,
        subtype: &str,
        event: &T,
        kind: BlockEventKind,
    ) -> Result<(), IndexerError> {
        let data = encode_event(subtype, event)?;
        self.events.push(RawEvent {
            subtype: subtype.to_string(),
            data,
            ordering: EventOrdering::Block(kind),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Moves `other`'s events after ours.
    pub fn append(&mut self, mut other: PendingEvents) {
        self.events.append(&mut other.events);
    }

    pub fn flush(self, manager: &dyn IndexerEventManager) {
        if !manager.enabled() {
            return;
        }
        for event in self.events {
            match event.ordering {
                EventOrdering::Transaction(tx) => manager.add_txn_event(tx, &event.subtype, event.data),
                EventOrdering::Block(kind) => manager.add_block_event(&event.subtype, event.data, kind),
            }
        }
    }
}

// 11.1: payloads

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFillEventV1 {
    pub maker_order: Order,
    pub taker_order: MatchableOrder,
    pub fill_amount: u64,
    pub maker_fee: i64,
    pub taker_fee: i64,
    pub total_filled_maker: u64,
    pub total_filled_taker: u64,
}

impl OrderFillEventV1 {
    pub fn liquidation(
        maker_order: Order,
        liquidation: LiquidationOrder,
        fill_amount: u64,
        maker_fee: i64,
        insurance_fund_delta: i64,
        total_filled_maker: u64,
    ) -> Self {
        Self {
            maker_order,
            taker_order: MatchableOrder::Liquidation(liquidation),
            fill_amount,
            maker_fee,
            taker_fee: insurance_fund_delta,
            total_filled_maker,
            total_filled_taker: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountUpdateEventV1 {
    pub subaccount_id: SubaccountId,
    pub quote_balance: i64,
    pub updated_perpetual_positions: Vec<PerpetualPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleveragingEventV1 {
    pub liquidated: SubaccountId,
    pub offsetting: SubaccountId,
    pub perpetual_id: PerpetualId,
    pub fill_amount: u64,
    /// Quote quantums paid by the buyer.
    pub total_quote_quantums: u64,
    /// Whether the liquidated subaccount bought.
    pub is_buy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatefulOrderEventV1 {
    Placement { order: Order },
    Removal { order_id: OrderId, reason: OrderRemovalReason },
    ConditionalPlacement { order: Order },
    ConditionalTriggered { order_id: OrderId },
    Expiration { order_id: OrderId },
    Cancelation { order_id: OrderId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualMarketCreateEventV1 {
    pub clob_pair_id: ClobPairId,
    pub perpetual_id: PerpetualId,
    pub ticker: String,
    pub market_id: MarketId,
    pub atomic_resolution: i32,
    pub subticks_per_tick: u32,
    pub step_base_quantums: u64,
    pub quantum_conversion_exponent: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPriceUpdateEventV1 {
    pub market_id: MarketId,
    pub price: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn block_orders_txn_then_block_events() {
        let collector = IndexerEventCollector::new(true);
        collector.add_block_event(SUBTYPE_MARKET, "end".to_string(), BlockEventKind::EndBlock);
        collector.add_txn_event(1, SUBTYPE_ORDER_FILL, "tx1".to_string());
        collector.add_block_event(SUBTYPE_MARKET, "begin".to_string(), BlockEventKind::BeginBlock);
        collector.add_txn_event(0, SUBTYPE_ORDER_FILL, "tx0-a".to_string());
        collector.add_txn_event(0, SUBTYPE_SUBACCOUNT_UPDATE, "tx0-b".to_string());

        let block = collector.produce_block(7, time());
        let data: Vec<&str> = block.events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["tx0-a", "tx0-b", "tx1", "begin", "end"]);
        let indices: Vec<u32> = block.events.iter().map(|e| e.event_index).collect();
        assert_eq!(indices, vec![0, 1, 0, 0, 0]);
        assert_eq!(block.height, 7);
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn disabled_collector_drops_events() {
        let collector = IndexerEventCollector::new(false);
        collector.add_txn_event(0, SUBTYPE_ORDER_FILL, "x".to_string());
        assert!(!collector.enabled());
        assert!(collector.produce_block(1, time()).events.is_empty());
    }

    #[test]
    fn pending_events_flush_in_order() {
        let collector = IndexerEventCollector::new(true);
        let mut pending = PendingEvents::new();
        let event = MarketPriceUpdateEventV1 {
            market_id: MarketId(0),
            price: 5,
        };
        pending.add_txn(0, SUBTYPE_MARKET, &event).unwrap();
        pending
            .add_block(SUBTYPE_MARKET, &event, BlockEventKind::EndBlock)
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(collector.pending(), 0);

        pending.flush(&collector);
        let block = collector.produce_block(1, time());
        assert_eq!(block.events.len(), 2);
        let decoded: MarketPriceUpdateEventV1 = serde_json::from_str(&block.events[0].data).unwrap();
        assert_eq!(decoded, event);
    }
}
