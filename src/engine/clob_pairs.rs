// 8.3 engine/clob_pairs.rs: persisted ClobPairs and the books built from them.
// creating a pair only writes state; `init_memclob_orderbooks` builds the books.

use super::core::ClobKeeper;
use super::results::ClobError;
use crate::clob_pair::{ClobPair, ClobPairError, ClobPairStatus};
use crate::indexer::{BlockEventKind, PendingEvents, PerpetualMarketCreateEventV1, SUBTYPE_PERPETUAL_MARKET};
use crate::order::Order;
use crate::registry::RegistryError;
use crate::store::{get_all_values, get_value, set_value, u32_key, KvStore, CLOB_PAIR_PREFIX, NUM_CLOB_PAIRS_KEY};
use crate::types::{ClobPairId, PerpetualId};
use tracing::{debug, info};

impl ClobKeeper {
    /// Validates, persists and counts a new pair. adds a perpetual market event to `events`.
    pub fn create_perpetual_clob_pair(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        pair: ClobPair,
    ) -> Result<ClobPair, ClobError> {
        pair.validate(self.config.max_fee_ppm)?;
        let perpetual = match self.perpetuals.get_perpetual(store, pair.perpetual_id) {
            Ok(perpetual) => perpetual,
            Err(RegistryError::PerpetualNotFound(perpetual_id)) => {
                return Err(ClobPairError::InvalidPerpetual {
                    clob_pair_id: pair.id,
                    perpetual_id,
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };

        let key = u32_key(CLOB_PAIR_PREFIX, pair.id.0);
        if store.has(&key) {
            return Err(ClobError::ClobPairAlreadyExists(pair.id));
        }
        set_value(store, &key, &pair)?;
        let count = self.get_num_clob_pairs(store)?;
        set_value(store, NUM_CLOB_PAIRS_KEY.as_bytes(), &(count + 1))?;

        events.add_block(
            SUBTYPE_PERPETUAL_MARKET,
            &PerpetualMarketCreateEventV1 {
                clob_pair_id: pair.id,
                perpetual_id: perpetual.id,
                ticker: perpetual.ticker.clone(),
                market_id: perpetual.market_id,
                atomic_resolution: perpetual.atomic_resolution,
                subticks_per_tick: pair.subticks_per_tick,
                step_base_quantums: pair.step_base_quantums,
                quantum_conversion_exponent: pair.quantum_conversion_exponent,
            },
            BlockEventKind::EndBlock,
        )?;

        info!(clob_pair = %pair.id, ticker = %perpetual.ticker, "created clob pair");
        Ok(pair)
    }

    pub fn get_clob_pair(&self, store: &dyn KvStore, id: ClobPairId) -> Result<ClobPair, ClobError> {
        get_value(store, &u32_key(CLOB_PAIR_PREFIX, id.0))?.ok_or(ClobError::ClobPairNotFound(id))
    }

    /// Ordered by id.
    pub fn get_all_clob_pairs(&self, store: &dyn KvStore) -> Result<Vec<ClobPair>, ClobError> {
        Ok(get_all_values(store, CLOB_PAIR_PREFIX)?)
    }

    pub fn get_num_clob_pairs(&self, store: &dyn KvStore) -> Result<u32, ClobError> {
        Ok(get_value(store, NUM_CLOB_PAIRS_KEY.as_bytes())?.unwrap_or(0))
    }

    pub fn remove_clob_pair(&self, store: &mut dyn KvStore, id: ClobPairId) -> Result<(), ClobError> {
        let key = u32_key(CLOB_PAIR_PREFIX, id.0);
        if !store.has(&key) {
            return Err(ClobError::ClobPairNotFound(id));
        }
        store.delete(&key);
        let count = self.get_num_clob_pairs(store)?;
        set_value(store, NUM_CLOB_PAIRS_KEY.as_bytes(), &count.saturating_sub(1))?;
        self.write_memclob()?.remove_orderbook(id);
        Ok(())
    }

    pub fn set_clob_pair_status(
        &self,
        store: &mut dyn KvStore,
        id: ClobPairId,
        status: ClobPairStatus,
    ) -> Result<(), ClobError> {
        let mut pair = self.get_clob_pair(store, id)?;
        pair.status = Some(status);
        set_value(store, &u32_key(CLOB_PAIR_PREFIX, id.0), &pair)?;
        debug!(clob_pair = %id, ?status, "clob pair status changed");
        Ok(())
    }

    /// Creates a book for every persisted pair that has none yet.
    pub fn init_memclob_orderbooks(&self, store: &dyn KvStore) -> Result<(), ClobError> {
        let pairs = self.get_all_clob_pairs(store)?;
        let mut memclob = self.write_memclob()?;
        for pair in pairs {
            if !memclob.has_orderbook(pair.id) {
                memclob.create_orderbook(&pair)?;
            }
        }
        Ok(())
    }

    pub fn get_clob_pair_for_perpetual(&self, perpetual_id: PerpetualId) -> Result<ClobPairId, ClobError> {
        self.read_memclob()?
            .clob_pair_for_perpetual(perpetual_id)
            .ok_or(ClobError::NoClobPairForPerpetual(perpetual_id))
    }

    /// The pair an order trades on, if it currently accepts that order.
    pub(super) fn clob_pair_accepting(&self, store: &dyn KvStore, order: &Order) -> Result<ClobPair, ClobError> {
        let pair = self.get_clob_pair(store, order.order_id.clob_pair_id)?;
        let status = pair.status();
        let accepted = match status {
            ClobPairStatus::PostOnly => order.is_post_only(),
            other => other.accepts_orders(),
        };
        if !accepted {
            return Err(ClobError::ClobPairNotActive {
                clob_pair_id: pair.id,
                status,
            });
        }
        Ok(pair)
    }

    pub(super) fn clob_pair_matching(&self, store: &dyn KvStore, id: ClobPairId) -> Result<ClobPair, ClobError> {
        let pair = self.get_clob_pair(store, id)?;
        if !pair.status().allows_matching() {
            return Err(ClobError::ClobPairNotActive {
                clob_pair_id: id,
                status: pair.status(),
            });
        }
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use crate::app::App;
    use crate::clob_pair::{ClobPair, ClobPairStatus};
    use crate::config::ClobConfig;
    use crate::engine::ClobError;
    use crate::indexer::PendingEvents;
    use crate::types::{ClobPairId, PerpetualId};

    #[test]
    fn create_counts_and_rejects_duplicates() {
        let mut app = App::new(ClobConfig::default()).unwrap();
        app.create_btc_market().unwrap();
        let store = app.committed();
        assert_eq!(app.clob().get_num_clob_pairs(store).unwrap(), 1);
        assert_eq!(app.clob().get_all_clob_pairs(store).unwrap().len(), 1);

        let mut store = store.clone();
        let err = app
            .clob()
            .create_perpetual_clob_pair(&mut store, &mut PendingEvents::new(), ClobPair::btc_usd(ClobPairId(0)))
            .unwrap_err();
        assert_eq!(err, ClobError::ClobPairAlreadyExists(ClobPairId(0)));
        assert_eq!(app.clob().get_num_clob_pairs(&store).unwrap(), 1);
    }

    #[test]
    fn created_pair_reads_back_unchanged() {
        let mut app = App::new(ClobConfig::default()).unwrap();
        app.create_btc_market().unwrap();
        let mut store = app.committed().clone();
        let mut events = PendingEvents::new();
        let pair = ClobPair {
            step_base_quantums: 10,
            subticks_per_tick: 100,
            min_order_base_quantums: 30,
            status: Some(ClobPairStatus::PostOnly),
            maker_fee_ppm: -50,
            taker_fee_ppm: 300,
            ..ClobPair::btc_usd(ClobPairId(1))
        };

        let created = app
            .clob()
            .create_perpetual_clob_pair(&mut store, &mut events, pair.clone())
            .unwrap();
        assert_eq!(created, pair);
        assert_eq!(app.clob().get_clob_pair(&store, ClobPairId(1)).unwrap(), pair);
        assert_eq!(app.clob().get_num_clob_pairs(&store).unwrap(), 2);
        assert_eq!(events.len(), 1);
        assert_eq!(app.clob().get_clob_pair(app.committed(), ClobPairId(0)).unwrap(), ClobPair::btc_usd(ClobPairId(0)));
    }

    #[test]
    fn missing_perpetual_is_reported() {
        let app = App::new(ClobConfig::default()).unwrap();
        let mut store = app.committed().clone();
        let mut pair = ClobPair::btc_usd(ClobPairId(3));
        pair.perpetual_id = PerpetualId(9);
        let err = app.clob().create_perpetual_clob_pair(&mut store, &mut PendingEvents::new(), pair).unwrap_err();
        assert!(err.to_string().contains("has invalid perpetual."));
        assert_eq!(app.clob().get_num_clob_pairs(&store).unwrap(), 0);
    }

    #[test]
    fn books_exist_only_after_init() {
        let mut app = App::new(ClobConfig::default()).unwrap();
        app.create_btc_market_without_book().unwrap();
        assert_eq!(
            app.clob().get_clob_pair_for_perpetual(PerpetualId(0)),
            Err(ClobError::NoClobPairForPerpetual(PerpetualId(0)))
        );
        app.clob().init_memclob_orderbooks(app.committed()).unwrap();
        assert_eq!(app.clob().get_clob_pair_for_perpetual(PerpetualId(0)), Ok(ClobPairId(0)));
    }

    #[test]
    fn paused_pair_rejects_orders() {
        let mut app = App::new(ClobConfig::default()).unwrap();
        app.create_btc_market().unwrap();
        let mut store = app.committed().clone();
        app.clob()
            .set_clob_pair_status(&mut store, ClobPairId(0), ClobPairStatus::Paused)
            .unwrap();
        assert!(matches!(
            app.clob().clob_pair_matching(&store, ClobPairId(0)),
            Err(ClobError::ClobPairNotActive { .. })
        ));
    }
}
