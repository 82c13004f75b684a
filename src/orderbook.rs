//! Per-market resting order books and the `MemClob` that owns them.
//!
//! Both sides are keyed so that ascending iteration is priority order: bids by
//! descending subticks, asks by ascending subticks, then insertion sequence.

use crate::clob_pair::ClobPair;
use crate::order::{crosses, Order, OrderId};
use crate::types::{ClobPairId, PerpetualId, Side};
use std::collections::{BTreeMap, HashMap};

/// Price-time priority key. lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BookKey {
    priority: u64,
    sequence: u64,
}

impl BookKey {
    fn new(side: Side, subticks: u64, sequence: u64) -> Self {
        let priority = match side {
            Side::Buy => u64::MAX - subticks,
            Side::Sell => subticks,
        };
        Self { priority, sequence }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestingOrder {
    pub order: Order,
    pub remaining: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub subticks: u64,
    pub total_quantums: u64,
    pub order_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookError {
    #[error("order {0} is already resting on the book")]
    DuplicateOrder(OrderId),

    #[error("order {order_id} belongs to clob pair {order_pair}, not {book_pair}")]
    WrongClobPair {
        order_id: OrderId,
        order_pair: ClobPairId,
        book_pair: ClobPairId,
    },

    #[error("order {0} has nothing left to rest")]
    NothingToRest(OrderId),

    #[error("order {0} is not on the book")]
    NotFound(OrderId),

    #[error("fill of {fill} exceeds remaining {remaining} for order {order_id}")]
    Overfill {
        order_id: OrderId,
        fill: u64,
        remaining: u64,
    },

    #[error("orderbook for clob pair {0} already exists")]
    OrderbookExists(ClobPairId),

    #[error("orderbook for clob pair {0} does not exist")]
    OrderbookMissing(ClobPairId),
}

// 2.5: single market book.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub clob_pair_id: ClobPairId,
    bids: BTreeMap<BookKey, RestingOrder>,
    asks: BTreeMap<BookKey, RestingOrder>,
    index: HashMap<OrderId, (Side, BookKey)>,
    next_sequence: u64,
}

impl OrderBook {
    pub fn new(clob_pair_id: ClobPairId) -> Self {
        Self {
            clob_pair_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            next_sequence: 0,
        }
    }

    fn side_map(&self, side: Side) -> &BTreeMap<BookKey, RestingOrder> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_map_mut(&mut self, side: Side) -> &mut BTreeMap<BookKey, RestingOrder> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Rests `remaining` quantums of `order` behind everything already at its price.
    pub fn insert(&mut self, order: Order, remaining: u64) -> Result<(), BookError> {
        let order_id = order.order_id.clone();
        if order_id.clob_pair_id != self.clob_pair_id {
            return Err(BookError::WrongClobPair {
                order_pair: order_id.clob_pair_id,
                order_id,
                book_pair: self.clob_pair_id,
            });
        }
        if self.index.contains_key(&order_id) {
            return Err(BookError::DuplicateOrder(order_id));
        }
        if remaining == 0 {
            return Err(BookError::NothingToRest(order_id));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let side = order.side;
        let key = BookKey::new(side, order.subticks, sequence);
        self.index.insert(order_id, (side, key));
        self.side_map_mut(side).insert(
            key,
            RestingOrder {
                order,
                remaining,
                sequence,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, order_id: &OrderId) -> Option<RestingOrder> {
        let (side, key) = self.index.remove(order_id)?;
        self.side_map_mut(side).remove(&key)
    }

    pub fn get(&self, order_id: &OrderId) -> Option<&RestingOrder> {
        let (side, key) = self.index.get(order_id)?;
        self.side_map(*side).get(key)
    }

    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.index.contains_key(order_id)
    }

    /// Takes `fill` off a resting order; drops it once nothing remains. returns what is left.
    pub fn reduce(&mut self, order_id: &OrderId, fill: u64) -> Result<u64, BookError> {
        let (side, key) = *self
            .index
            .get(order_id)
            .ok_or_else(|| BookError::NotFound(order_id.clone()))?;
        let resting = self
            .side_map_mut(side)
            .get_mut(&key)
            .ok_or_else(|| BookError::NotFound(order_id.clone()))?;
        if fill > resting.remaining {
            return Err(BookError::Overfill {
                order_id: order_id.clone(),
                fill,
                remaining: resting.remaining,
            });
        }
        resting.remaining -= fill;
        let left = resting.remaining;
        if left == 0 {
            self.remove(order_id);
        }
        Ok(left)
    }

    /// Puts resting orders back exactly as they were, priority included.
    /// `snapshot` is in the order the orders were touched.
    pub fn restore(&mut self, snapshot: Vec<RestingOrder>) {
        for resting in snapshot.into_iter().rev() {
            let order_id = resting.order.order_id.clone();
            if let Some((side, key)) = self.index.get(&order_id).copied() {
                if let Some(current) = self.side_map_mut(side).get_mut(&key) {
                    current.remaining = resting.remaining;
                }
                continue;
            }
            let side = resting.order.side;
            let key = BookKey::new(side, resting.order.subticks, resting.sequence);
            self.index.insert(order_id, (side, key));
            self.side_map_mut(side).insert(key, resting);
        }
    }

    pub fn best(&self, side: Side) -> Option<&RestingOrder> {
        self.side_map(side).values().next()
    }

    pub fn best_bid(&self) -> Option<u64> {
        self.best(Side::Buy).map(|r| r.order.subticks)
    }

    pub fn best_ask(&self) -> Option<u64> {
        self.best(Side::Sell).map(|r| r.order.subticks)
    }

    /// Resting orders of one side, best first.
    pub fn iter_side(&self, side: Side) -> impl Iterator<Item = &RestingOrder> {
        self.side_map(side).values()
    }

    /// Whether an order at `subticks` on `side` would take liquidity right now.
    pub fn would_cross(&self, side: Side, subticks: u64) -> bool {
        self.best(side.opposite())
            .map(|maker| crosses(side, subticks, maker.order.subticks))
            .unwrap_or(false)
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Aggregated depth, best level first.
    pub fn levels(&self, side: Side, max_levels: usize) -> Vec<PriceLevel> {
        let mut levels: Vec<PriceLevel> = Vec::new();
        for resting in self.iter_side(side) {
            let subticks = resting.order.subticks;
            if levels.last().map(|l| l.subticks) != Some(subticks) {
                if levels.len() >= max_levels {
                    break;
                }
                levels.push(PriceLevel {
                    subticks,
                    total_quantums: 0,
                    order_count: 0,
                });
            }
            if let Some(level) = levels.last_mut() {
                level.total_quantums += resting.remaining;
                level.order_count += 1;
            }
        }
        levels
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self.index.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// 2.6: all books of a node. the keeper keeps this behind a RwLock.
#[derive(Debug, Clone, Default)]
pub struct MemClob {
    books: BTreeMap<ClobPairId, OrderBook>,
    pairs: BTreeMap<ClobPairId, ClobPair>,
    perpetual_to_clob_pair: BTreeMap<PerpetualId, ClobPairId>,
}

impl MemClob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_orderbook(&mut self, pair: &ClobPair) -> Result<(), BookError> {
        if self.books.contains_key(&pair.id) {
            return Err(BookError::OrderbookExists(pair.id));
        }
        self.books.insert(pair.id, OrderBook::new(pair.id));
        self.pairs.insert(pair.id, pair.clone());
        self.perpetual_to_clob_pair.insert(pair.perpetual_id, pair.id);
        Ok(())
    }

    pub fn remove_orderbook(&mut self, clob_pair_id: ClobPairId) -> Option<OrderBook> {
        let pair = self.pairs.remove(&clob_pair_id)?;
        self.perpetual_to_clob_pair.remove(&pair.perpetual_id);
        self.books.remove(&clob_pair_id)
    }

    pub fn book(&self, clob_pair_id: ClobPairId) -> Option<&OrderBook> {
        self.books.get(&clob_pair_id)
    }

    pub fn book_mut(&mut self, clob_pair_id: ClobPairId) -> Result<&mut OrderBook, BookError> {
        self.books
            .get_mut(&clob_pair_id)
            .ok_or(BookError::OrderbookMissing(clob_pair_id))
    }

    pub fn clob_pair(&self, clob_pair_id: ClobPairId) -> Option<&ClobPair> {
        self.pairs.get(&clob_pair_id)
    }

    pub fn clob_pair_for_perpetual(&self, perpetual_id: PerpetualId) -> Option<ClobPairId> {
        self.perpetual_to_clob_pair.get(&perpetual_id).copied()
    }

    pub fn has_orderbook(&self, clob_pair_id: ClobPairId) -> bool {
        self.books.contains_key(&clob_pair_id)
    }

    pub fn clob_pair_ids(&self) -> Vec<ClobPairId> {
        self.books.keys().copied().collect()
    }

    /// Finds a resting order on whichever book it lives on.
    pub fn find_order(&self, order_id: &OrderId) -> Option<&RestingOrder> {
        self.books.get(&order_id.clob_pair_id)?.get(order_id)
    }

    pub fn remove_order(&mut self, order_id: &OrderId) -> Option<RestingOrder> {
        self.books.get_mut(&order_id.clob_pair_id)?.remove(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{GoodTil, OrderFlags, TimeInForce};
    use crate::types::SubaccountId;

    fn order(owner: &str, client_id: u32, side: Side, quantums: u64, subticks: u64) -> Order {
        Order {
            order_id: OrderId::new(
                SubaccountId::new(owner, 0),
                client_id,
                OrderFlags::ShortTerm,
                ClobPairId(0),
            ),
            side,
            quantums,
            subticks,
            good_til: GoodTil::Block(10),
            time_in_force: TimeInForce::Unspecified,
            reduce_only: false,
            condition: None,
        }
    }

    #[test]
    fn best_prices_and_priority() {
        let mut book = OrderBook::new(ClobPairId(0));
        book.insert(order("a", 1, Side::Buy, 10, 100), 10).unwrap();
        book.insert(order("b", 2, Side::Buy, 10, 105), 10).unwrap();
        book.insert(order("c", 3, Side::Buy, 10, 105), 10).unwrap();
        book.insert(order("d", 4, Side::Sell, 10, 110), 10).unwrap();
        book.insert(order("e", 5, Side::Sell, 10, 108), 10).unwrap();

        assert_eq!(book.best_bid(), Some(105));
        assert_eq!(book.best_ask(), Some(108));

        // same price: first in, first out
        let bids: Vec<u32> = book
            .iter_side(Side::Buy)
            .map(|r| r.order.order_id.client_id)
            .collect();
        assert_eq!(bids, vec![2, 3, 1]);
        assert!(!book.is_crossed());
    }

    #[test]
    fn duplicate_and_wrong_pair_rejected() {
        let mut book = OrderBook::new(ClobPairId(0));
        let o = order("a", 1, Side::Buy, 10, 100);
        book.insert(o.clone(), 10).unwrap();
        assert!(matches!(book.insert(o, 10), Err(BookError::DuplicateOrder(_))));

        let mut other = order("a", 2, Side::Buy, 10, 100);
        other.order_id.clob_pair_id = ClobPairId(1);
        assert!(matches!(book.insert(other, 10), Err(BookError::WrongClobPair { .. })));
    }

    #[test]
    fn reduce_removes_when_exhausted() {
        let mut book = OrderBook::new(ClobPairId(0));
        let o = order("a", 1, Side::Sell, 10, 100);
        let id = o.order_id.clone();
        book.insert(o, 10).unwrap();
        assert_eq!(book.reduce(&id, 4).unwrap(), 6);
        assert!(matches!(book.reduce(&id, 7), Err(BookError::Overfill { .. })));
        assert_eq!(book.reduce(&id, 6).unwrap(), 0);
        assert!(book.is_empty());
    }

    #[test]
    fn levels_aggregate() {
        let mut book = OrderBook::new(ClobPairId(0));
        book.insert(order("a", 1, Side::Sell, 10, 100), 10).unwrap();
        book.insert(order("b", 2, Side::Sell, 5, 100), 5).unwrap();
        book.insert(order("c", 3, Side::Sell, 7, 101), 7).unwrap();
        let levels = book.levels(Side::Sell, 1);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].total_quantums, 15);
        assert_eq!(levels[0].order_count, 2);
        assert!(book.would_cross(Side::Buy, 100));
        assert!(!book.would_cross(Side::Buy, 99));
    }

    #[test]
    fn memclob_tracks_perpetuals() {
        let mut memclob = MemClob::new();
        let pair = ClobPair::btc_usd(ClobPairId(0));
        memclob.create_orderbook(&pair).unwrap();
        assert_eq!(memclob.clob_pair_for_perpetual(PerpetualId(0)), Some(ClobPairId(0)));
        assert!(matches!(
            memclob.create_orderbook(&pair),
            Err(BookError::OrderbookExists(_))
        ));
        memclob.remove_orderbook(ClobPairId(0));
        assert_eq!(memclob.clob_pair_for_perpetual(PerpetualId(0)), None);
    }
}
