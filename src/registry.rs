//! Price & perpetual registry.
//!
//! The CLOB reads oracle prices and perpetual parameters through
//! [`PerpetualsRegistry`]. Funding and parameter governance live elsewhere; the
//! store-backed [`PerpetualsKeeper`] only offers what tests, genesis-style setup and
//! the price-update transaction need.

use crate::clob_pair::ClobPair;
use crate::margin::{base_to_quote_quantums, price_to_subticks, LiquidityTier};
use crate::store::{
    get_all_values, get_value, set_value, u32_key, KvStore, StoreError, LIQUIDITY_TIER_PREFIX,
    MARKET_PRICE_PREFIX, PERPETUAL_PREFIX,
};
use crate::types::{LiquidityTierId, MarketId, PerpetualId};
use serde::{Deserialize, Serialize};

/// Oracle price: `price * 10^exponent` USD per whole base unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPrice {
    pub id: MarketId,
    pub exponent: i32,
    pub price: u64,
}

/// One entry of a price-update transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPriceUpdate {
    pub market_id: MarketId,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perpetual {
    pub id: PerpetualId,
    pub ticker: String,
    pub market_id: MarketId,
    /// One base quantum is `10^atomic_resolution` whole units.
    pub atomic_resolution: i32,
    pub default_funding_ppm: i32,
    pub liquidity_tier: LiquidityTierId,
    pub funding_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("perpetual {0} does not exist")]
    PerpetualNotFound(PerpetualId),

    #[error("market price {0} does not exist")]
    MarketPriceNotFound(MarketId),

    #[error("liquidity tier {0:?} does not exist")]
    LiquidityTierNotFound(LiquidityTierId),

    #[error("price cannot be 0 for market id ({0})")]
    ZeroPrice(MarketId),

    #[error("invalid liquidity tier: {0}")]
    InvalidLiquidityTier(String),

    #[error("invalid perpetual: {0}")]
    InvalidPerpetual(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("arithmetic overflow computing notional for perpetual {0}")]
    Overflow(PerpetualId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read interface over perpetuals and prices. the provided methods derive the
/// margin quantities the ledger and liquidation logic need.
pub trait PerpetualsRegistry: Send + Sync {
    fn get_perpetual(&self, store: &dyn KvStore, id: PerpetualId) -> Result<Perpetual, RegistryError>;

    fn get_market_price(&self, store: &dyn KvStore, id: MarketId) -> Result<MarketPrice, RegistryError>;

    fn get_liquidity_tier(
        &self,
        store: &dyn KvStore,
        id: LiquidityTierId,
    ) -> Result<LiquidityTier, RegistryError>;

    fn get_perpetual_and_market_price(
        &self,
        store: &dyn KvStore,
        id: PerpetualId,
    ) -> Result<(Perpetual, MarketPrice), RegistryError> {
        let perpetual = self.get_perpetual(store, id)?;
        let price = self.get_market_price(store, perpetual.market_id)?;
        Ok((perpetual, price))
    }

    /// Signed notional of a position (longs positive).
    fn get_net_notional(
        &self,
        store: &dyn KvStore,
        id: PerpetualId,
        quantums: i128,
    ) -> Result<i128, RegistryError> {
        let (perpetual, price) = self.get_perpetual_and_market_price(store, id)?;
        base_to_quote_quantums(quantums, perpetual.atomic_resolution, price.price, price.exponent)
            .ok_or(RegistryError::Overflow(id))
    }

    /// (initial, maintenance) margin requirement of a position of `quantums`.
    fn get_margin_requirements(
        &self,
        store: &dyn KvStore,
        id: PerpetualId,
        quantums: i128,
    ) -> Result<(i128, i128), RegistryError> {
        let (perpetual, price) = self.get_perpetual_and_market_price(store, id)?;
        let tier = self.get_liquidity_tier(store, perpetual.liquidity_tier)?;
        let notional = base_to_quote_quantums(
            quantums.abs(),
            perpetual.atomic_resolution,
            price.price,
            price.exponent,
        )
        .ok_or(RegistryError::Overflow(id))?;
        let (initial, maintenance) = tier.margin_requirements(notional.unsigned_abs());
        let initial = i128::try_from(initial).map_err(|_| RegistryError::Overflow(id))?;
        let maintenance = i128::try_from(maintenance).map_err(|_| RegistryError::Overflow(id))?;
        Ok((initial, maintenance))
    }

    /// Oracle price of a pair's perpetual in that pair's subticks.
    fn get_oracle_subticks(&self, store: &dyn KvStore, pair: &ClobPair) -> Result<u64, RegistryError> {
        let (perpetual, price) = self.get_perpetual_and_market_price(store, pair.perpetual_id)?;
        price_to_subticks(
            price.price,
            price.exponent,
            perpetual.atomic_resolution,
            pair.quantum_conversion_exponent,
        )
        .ok_or(RegistryError::Overflow(pair.perpetual_id))
    }
}

// 9.3: store-backed registry.
#[derive(Debug, Clone, Default)]
pub struct PerpetualsKeeper;

impl PerpetualsKeeper {
    pub fn new() -> Self {
        Self
    }

    pub fn create_market(&self, store: &mut dyn KvStore, market: MarketPrice) -> Result<(), RegistryError> {
        if market.price == 0 {
            return Err(RegistryError::ZeroPrice(market.id));
        }
        let key = u32_key(MARKET_PRICE_PREFIX, market.id.0);
        if store.has(&key) {
            return Err(RegistryError::AlreadyExists(format!("market {}", market.id)));
        }
        set_value(store, &key, &market)?;
        Ok(())
    }

    /// Applies a price-update transaction. every market must exist and be non-zero.
    pub fn update_market_prices(
        &self,
        store: &mut dyn KvStore,
        updates: &[MarketPriceUpdate],
    ) -> Result<(), RegistryError> {
        for update in updates {
            if update.price == 0 {
                return Err(RegistryError::ZeroPrice(update.market_id));
            }
            let mut market = self.get_market_price(store, update.market_id)?;
            market.price = update.price;
            set_value(store, &u32_key(MARKET_PRICE_PREFIX, market.id.0), &market)?;
        }
        Ok(())
    }

    pub fn create_liquidity_tier(
        &self,
        store: &mut dyn KvStore,
        tier: LiquidityTier,
    ) -> Result<(), RegistryError> {
        tier.validate().map_err(RegistryError::InvalidLiquidityTier)?;
        set_value(store, &u32_key(LIQUIDITY_TIER_PREFIX, tier.id.0), &tier)?;
        Ok(())
    }

    pub fn create_perpetual(&self, store: &mut dyn KvStore, perpetual: Perpetual) -> Result<(), RegistryError> {
        if perpetual.ticker.is_empty() {
            return Err(RegistryError::InvalidPerpetual("ticker must be non-empty".to_string()));
        }
        let key = u32_key(PERPETUAL_PREFIX, perpetual.id.0);
        if store.has(&key) {
            return Err(RegistryError::AlreadyExists(format!("perpetual {}", perpetual.id)));
        }
        self.get_market_price(store, perpetual.market_id)?;
        self.get_liquidity_tier(store, perpetual.liquidity_tier)?;
        set_value(store, &key, &perpetual)?;
        Ok(())
    }

    pub fn set_funding_index(
        &self,
        store: &mut dyn KvStore,
        id: PerpetualId,
        funding_index: i64,
    ) -> Result<(), RegistryError> {
        let mut perpetual = self.get_perpetual(store, id)?;
        perpetual.funding_index = funding_index;
        set_value(store, &u32_key(PERPETUAL_PREFIX, id.0), &perpetual)?;
        Ok(())
    }

    pub fn get_all_perpetuals(&self, store: &dyn KvStore) -> Result<Vec<Perpetual>, RegistryError> {
        Ok(get_all_values(store, PERPETUAL_PREFIX)?)
    }

    pub fn get_all_market_prices(&self, store: &dyn KvStore) -> Result<Vec<MarketPrice>, RegistryError> {
        Ok(get_all_values(store, MARKET_PRICE_PREFIX)?)
    }
}

impl PerpetualsRegistry for PerpetualsKeeper {
    fn get_perpetual(&self, store: &dyn KvStore, id: PerpetualId) -> Result<Perpetual, RegistryError> {
        get_value(store, &u32_key(PERPETUAL_PREFIX, id.0))?.ok_or(RegistryError::PerpetualNotFound(id))
    }

    fn get_market_price(&self, store: &dyn KvStore, id: MarketId) -> Result<MarketPrice, RegistryError> {
        get_value(store, &u32_key(MARKET_PRICE_PREFIX, id.0))?.ok_or(RegistryError::MarketPriceNotFound(id))
    }

    fn get_liquidity_tier(
        &self,
        store: &dyn KvStore,
        id: LiquidityTierId,
    ) -> Result<LiquidityTier, RegistryError> {
        get_value(store, &u32_key(LIQUIDITY_TIER_PREFIX, id.0))?
            .ok_or(RegistryError::LiquidityTierNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn setup() -> (MemStore, PerpetualsKeeper) {
        let mut store = MemStore::new();
        let keeper = PerpetualsKeeper::new();
        keeper
            .create_market(
                &mut store,
                MarketPrice {
                    id: MarketId(0),
                    exponent: -5,
                    price: 5_000_000_000,
                },
            )
            .unwrap();
        keeper
            .create_liquidity_tier(&mut store, LiquidityTier::twenty_percent_initial(LiquidityTierId(0)))
            .unwrap();
        keeper
            .create_perpetual(
                &mut store,
                Perpetual {
                    id: PerpetualId(0),
                    ticker: "BTC-USD".to_string(),
                    market_id: MarketId(0),
                    atomic_resolution: -8,
                    default_funding_ppm: 0,
                    liquidity_tier: LiquidityTierId(0),
                    funding_index: 0,
                },
            )
            .unwrap();
        (store, keeper)
    }

    #[test]
    fn margin_for_short_position() {
        let (store, keeper) = setup();
        let nnv = keeper.get_net_notional(&store, PerpetualId(0), -100_000_000).unwrap();
        assert_eq!(nnv, -50_000_000_000);
        let (imr, mmr) = keeper
            .get_margin_requirements(&store, PerpetualId(0), -100_000_000)
            .unwrap();
        assert_eq!((imr, mmr), (10_000_000_000, 5_000_000_000));
    }

    #[test]
    fn perpetual_requires_market_and_tier() {
        let (mut store, keeper) = setup();
        let perpetual = Perpetual {
            id: PerpetualId(1),
            ticker: "ETH-USD".to_string(),
            market_id: MarketId(7),
            atomic_resolution: -9,
            default_funding_ppm: 0,
            liquidity_tier: LiquidityTierId(0),
            funding_index: 0,
        };
        assert_eq!(
            keeper.create_perpetual(&mut store, perpetual),
            Err(RegistryError::MarketPriceNotFound(MarketId(7)))
        );
        assert!(matches!(
            keeper.get_perpetual(&store, PerpetualId(1)),
            Err(RegistryError::PerpetualNotFound(_))
        ));
    }

    #[test]
    fn price_updates_reject_zero() {
        let (mut store, keeper) = setup();
        let err = keeper
            .update_market_prices(
                &mut store,
                &[MarketPriceUpdate {
                    market_id: MarketId(0),
                    price: 0,
                }],
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "price cannot be 0 for market id (0)");

        keeper
            .update_market_prices(
                &mut store,
                &[MarketPriceUpdate {
                    market_id: MarketId(0),
                    price: 4_000_000_000,
                }],
            )
            .unwrap();
        assert_eq!(keeper.get_market_price(&store, MarketId(0)).unwrap().price, 4_000_000_000);
    }

    #[test]
    fn oracle_subticks_for_pair() {
        let (store, keeper) = setup();
        let pair = ClobPair::btc_usd(crate::types::ClobPairId(0));
        assert_eq!(keeper.get_oracle_subticks(&store, &pair).unwrap(), 50_000_000_000);
    }
}
