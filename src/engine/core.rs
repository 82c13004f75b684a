// 8.0 engine/core.rs: the clob keeper. owns the local books and the operations
// queue; every consensus write goes through the store handle passed per call.

use super::results::ClobError;
use crate::bank::BankKeeper;
use crate::config::ClobConfig;
use crate::indexer::{IndexerEventManager, PendingEvents};
use crate::operations::OperationsToPropose;
use crate::order::OrderId;
use crate::orderbook::{MemClob, PriceLevel};
use crate::registry::PerpetualsRegistry;
use crate::stats::StatsKeeper;
use crate::subaccount::SubaccountLedger;
use crate::types::{ClobPairId, Side};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Index of the operations tx within a block. replay events are tagged with it.
pub const OPERATIONS_TX_INDEX: u32 = 0;

/** 8.1: keeper struct. collaborators are injected, books and queue are local */
pub struct ClobKeeper {
    pub(super) config: ClobConfig,
    pub(super) subaccounts: Arc<dyn SubaccountLedger>,
    pub(super) perpetuals: Arc<dyn PerpetualsRegistry>,
    pub(super) bank: Arc<dyn BankKeeper>,
    pub(super) indexer: Arc<dyn IndexerEventManager>,
    pub(super) stats: StatsKeeper,
    memclob: RwLock<MemClob>,
    operations: Mutex<OperationsToPropose>,
}

impl ClobKeeper {
    pub fn new(
        config: ClobConfig,
        subaccounts: Arc<dyn SubaccountLedger>,
        perpetuals: Arc<dyn PerpetualsRegistry>,
        bank: Arc<dyn BankKeeper>,
        indexer: Arc<dyn IndexerEventManager>,
    ) -> Result<Self, ClobError> {
        config.validate()?;
        let stats = StatsKeeper::new(config.stats_window_secs);
        Ok(Self {
            config,
            subaccounts,
            perpetuals,
            bank,
            indexer,
            stats,
            memclob: RwLock::new(MemClob::new()),
            operations: Mutex::new(OperationsToPropose::new()),
        })
    }

    pub fn config(&self) -> &ClobConfig {
        &self.config
    }

    pub fn stats(&self) -> &StatsKeeper {
        &self.stats
    }

    pub fn subaccounts(&self) -> &Arc<dyn SubaccountLedger> {
        &self.subaccounts
    }

    /// Hands a committed block's events to the indexer. keeper operations only
    /// buffer; nothing else reaches the indexer.
    pub fn emit_events(&self, events: PendingEvents) {
        events.flush(self.indexer.as_ref());
    }

    pub(super) fn read_memclob(&self) -> Result<RwLockReadGuard<'_, MemClob>, ClobError> {
        self.memclob.read().map_err(|_| ClobError::LockPoisoned("memclob"))
    }

    pub(super) fn write_memclob(&self) -> Result<RwLockWriteGuard<'_, MemClob>, ClobError> {
        self.memclob.write().map_err(|_| ClobError::LockPoisoned("memclob"))
    }

    pub(super) fn operations_queue(&self) -> Result<MutexGuard<'_, OperationsToPropose>, ClobError> {
        self.operations
            .lock()
            .map_err(|_| ClobError::LockPoisoned("operations queue"))
    }

    /// Aggregated price levels, best first.
    pub fn depth(
        &self,
        clob_pair_id: ClobPairId,
        max_levels: usize,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>), ClobError> {
        let memclob = self.read_memclob()?;
        let book = memclob
            .book(clob_pair_id)
            .ok_or(ClobError::ClobPairNotFound(clob_pair_id))?;
        Ok((book.levels(Side::Buy, max_levels), book.levels(Side::Sell, max_levels)))
    }

    pub fn best_bid_ask(&self, clob_pair_id: ClobPairId) -> Result<(Option<u64>, Option<u64>), ClobError> {
        let memclob = self.read_memclob()?;
        let book = memclob
            .book(clob_pair_id)
            .ok_or(ClobError::ClobPairNotFound(clob_pair_id))?;
        Ok((book.best_bid(), book.best_ask()))
    }

    /// Remaining size of a resting order, if it rests.
    pub fn resting_quantums(&self, order_id: &OrderId) -> Result<Option<u64>, ClobError> {
        Ok(self.read_memclob()?.find_order(order_id).map(|r| r.remaining))
    }

    pub fn pending_operations(&self) -> Result<usize, ClobError> {
        Ok(self.operations_queue()?.len())
    }
}

impl std::fmt::Debug for ClobKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobKeeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
