// Price cache
//
// The price-feed side of the node keeps the latest price per market per
// exchange here. Writers are exchange query tasks, the reader builds the
// price-update transaction for the next proposal. Nothing here is on the
// consensus path: the update transaction is validated by every node anyway.

use crate::registry::MarketPriceUpdate;
use crate::types::MarketId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Exchange name, e.g. "binance".
pub type ExchangeId = String;

/// One observed price with the time the exchange reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPriceTimestamp {
    pub market_id: MarketId,
    pub price: u64,
    pub last_updated_at: DateTime<Utc>,
}

/// Latest price per market for a single exchange.
#[derive(Debug, Default)]
pub struct MarketToPrice {
    prices: RwLock<BTreeMap<MarketId, (u64, DateTime<Utc>)>>,
}

impl MarketToPrice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied only if strictly newer than what is cached. returns whether it was.
    pub fn update_price(&self, update: MarketPriceTimestamp) -> bool {
        let mut prices = self.prices.write().unwrap_or_else(|e| e.into_inner());
        match prices.get(&update.market_id) {
            Some((_, at)) if *at >= update.last_updated_at => false,
            _ => {
                prices.insert(update.market_id, (update.price, update.last_updated_at));
                true
            }
        }
    }

    /// Every cached price, ordered by market id.
    pub fn get_all_prices(&self) -> Vec<MarketPriceTimestamp> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        prices
            .iter()
            .map(|(market_id, (price, at))| MarketPriceTimestamp {
                market_id: *market_id,
                price: *price,
                last_updated_at: *at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-exchange caches plus median aggregation across them.
#[derive(Debug, Default)]
pub struct ExchangeToMarketPrices {
    exchanges: RwLock<BTreeMap<ExchangeId, MarketToPrice>>,
}

impl ExchangeToMarketPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_prices(&self, exchange: &str, updates: &[MarketPriceTimestamp]) {
        {
            let exchanges = self.exchanges.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cache) = exchanges.get(exchange) {
                for update in updates {
                    cache.update_price(*update);
                }
                return;
            }
        }
        let mut exchanges = self.exchanges.write().unwrap_or_else(|e| e.into_inner());
        let cache = exchanges.entry(exchange.to_string()).or_default();
        for update in updates {
            cache.update_price(*update);
        }
    }

    /// Median of the fresh prices of every market, ordered by market id.
    /// a price older than `max_age` at `now` is ignored.
    pub fn median_prices(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<MarketPriceUpdate> {
        let exchanges = self.exchanges.read().unwrap_or_else(|e| e.into_inner());
        let mut by_market: BTreeMap<MarketId, Vec<u64>> = BTreeMap::new();
        for cache in exchanges.values() {
            for observed in cache.get_all_prices() {
                if now - observed.last_updated_at > max_age {
                    continue;
                }
                by_market.entry(observed.market_id).or_default().push(observed.price);
            }
        }
        by_market
            .into_iter()
            .filter_map(|(market_id, prices)| {
                median(prices).map(|price| MarketPriceUpdate { market_id, price })
            })
            .collect()
    }
}

// even counts take the floor of the two middle values
fn median(mut prices: Vec<u64>) -> Option<u64> {
    if prices.is_empty() {
        return None;
    }
    prices.sort_unstable();
    let len = prices.len();
    if len % 2 == 0 {
        let sum = prices[len / 2 - 1] as u128 + prices[len / 2] as u128;
        Some((sum / 2) as u64)
    } else {
        Some(prices[len / 2])
    }
}

/// Builds the entries of a price-update transaction from the cached medians,
/// skipping zero prices.
pub fn to_market_price_updates(prices: Vec<MarketPriceUpdate>) -> Vec<MarketPriceUpdate> {
    prices.into_iter().filter(|p| p.price > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::thread;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn observed(market: u32, price: u64, secs: i64) -> MarketPriceTimestamp {
        MarketPriceTimestamp {
            market_id: MarketId(market),
            price,
            last_updated_at: at(secs),
        }
    }

    #[test]
    fn older_updates_are_ignored() {
        let cache = MarketToPrice::new();
        assert!(cache.update_price(observed(0, 100, 10)));
        assert!(!cache.update_price(observed(0, 90, 5)));
        assert!(!cache.update_price(observed(0, 95, 10)));
        assert!(cache.update_price(observed(0, 110, 11)));
        assert_eq!(cache.get_all_prices()[0].price, 110);
    }

    #[test]
    fn prices_sorted_by_market() {
        let cache = MarketToPrice::new();
        cache.update_price(observed(2, 1, 1));
        cache.update_price(observed(0, 1, 1));
        cache.update_price(observed(1, 1, 1));
        let ids: Vec<u32> = cache.get_all_prices().iter().map(|p| p.market_id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn median_across_exchanges_skips_stale() {
        let prices = ExchangeToMarketPrices::new();
        prices.update_prices("a", &[observed(0, 100, 100), observed(1, 7, 100)]);
        prices.update_prices("b", &[observed(0, 104, 100)]);
        prices.update_prices("c", &[observed(0, 1_000, 10)]);

        let medians = prices.median_prices(at(105), Duration::seconds(30));
        assert_eq!(
            medians,
            vec![
                MarketPriceUpdate {
                    market_id: MarketId(0),
                    price: 102
                },
                MarketPriceUpdate {
                    market_id: MarketId(1),
                    price: 7
                },
            ]
        );
    }

    #[test]
    fn concurrent_writers() {
        let cache = Arc::new(MarketToPrice::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for t in 0..100 {
                        cache.update_price(observed(i, t as u64 + 1, t));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 4);
        assert!(cache.get_all_prices().iter().all(|p| p.price == 100));
    }

    #[test]
    fn zero_prices_dropped_from_updates() {
        let updates = to_market_price_updates(vec![
            MarketPriceUpdate {
                market_id: MarketId(0),
                price: 0,
            },
            MarketPriceUpdate {
                market_id: MarketId(1),
                price: 5,
            },
        ]);
        assert_eq!(updates.len(), 1);
    }
}
