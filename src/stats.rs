//! Trading statistics.
//!
//! Fills are recorded per block in transient storage, folded into the current
//! epoch and per-user totals at end block, and subtracted again once their
//! epoch falls out of the trailing window. Epoch user lists are kept sorted by
//! address so that the persisted bytes do not depend on map iteration order.

use crate::store::{
    get_value, key_with_suffix, set_value, u32_key, KvStore, StoreError, BLOCK_STATS_KEY,
    EPOCH_STATS_PREFIX, GLOBAL_STATS_KEY, STATS_METADATA_KEY, USER_STATS_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Epoch schedule derived from block time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochInfo {
    pub current_epoch: u32,
    /// Unix seconds at which the current epoch ends.
    pub next_tick: i64,
}

impl EpochInfo {
    /// Epochs of `duration_secs` counted from unix time zero.
    pub fn at(block_time_secs: i64, duration_secs: i64) -> Self {
        let duration = duration_secs.max(1);
        let epoch = block_time_secs.max(0) / duration;
        Self {
            current_epoch: u32::try_from(epoch).unwrap_or(u32::MAX),
            next_tick: (epoch + 1) * duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFill {
    pub taker: String,
    pub maker: String,
    pub notional: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub fills: Vec<BlockFill>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub taker_notional: u64,
    pub maker_notional: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserWithStats {
    pub user: String,
    pub stats: UserStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch_end_time: i64,
    /// Sorted by user.
    pub stats: Vec<UserWithStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub notional_traded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsMetadata {
    /// Oldest epoch that may still hold stats.
    pub trailing_epoch: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsKeeper {
    window_secs: i64,
}

impl StatsKeeper {
    pub fn new(window_secs: i64) -> Self {
        Self { window_secs }
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    pub fn get_block_stats(&self, store: &dyn KvStore) -> Result<BlockStats, StoreError> {
        Ok(get_value(store, BLOCK_STATS_KEY.as_bytes())?.unwrap_or_default())
    }

    /// Notes one fill for this block. `notional` is in quote quantums.
    pub fn record_fill(
        &self,
        store: &mut dyn KvStore,
        taker: &str,
        maker: &str,
        notional: u64,
    ) -> Result<(), StoreError> {
        let mut block = self.get_block_stats(store)?;
        block.fills.push(BlockFill {
            taker: taker.to_string(),
            maker: maker.to_string(),
            notional,
        });
        set_value(store, BLOCK_STATS_KEY.as_bytes(), &block)
    }

    pub fn get_stats_metadata(&self, store: &dyn KvStore) -> Result<StatsMetadata, StoreError> {
        Ok(get_value(store, STATS_METADATA_KEY.as_bytes())?.unwrap_or_default())
    }

    pub fn get_epoch_stats(&self, store: &dyn KvStore, epoch: u32) -> Result<Option<EpochStats>, StoreError> {
        get_value(store, &u32_key(EPOCH_STATS_PREFIX, epoch))
    }

    pub fn get_user_stats(&self, store: &dyn KvStore, user: &str) -> Result<UserStats, StoreError> {
        Ok(get_value(store, &key_with_suffix(USER_STATS_PREFIX, user.as_bytes()))?.unwrap_or_default())
    }

    fn set_user_stats(&self, store: &mut dyn KvStore, user: &str, stats: &UserStats) -> Result<(), StoreError> {
        set_value(store, &key_with_suffix(USER_STATS_PREFIX, user.as_bytes()), stats)
    }

    pub fn get_global_stats(&self, store: &dyn KvStore) -> Result<GlobalStats, StoreError> {
        Ok(get_value(store, GLOBAL_STATS_KEY.as_bytes())?.unwrap_or_default())
    }

    // 12.1: fold this block's fills into the epoch, user and global totals.
    pub fn process_block_stats(&self, store: &mut dyn KvStore, epoch: &EpochInfo) -> Result<(), StoreError> {
        let block = self.get_block_stats(store)?;
        if block.fills.is_empty() {
            return Ok(());
        }

        let existing = self.get_epoch_stats(store, epoch.current_epoch)?.unwrap_or_default();
        let mut by_user: BTreeMap<String, UserStats> = existing
            .stats
            .into_iter()
            .map(|entry| (entry.user, entry.stats))
            .collect();
        let mut global = self.get_global_stats(store)?;

        for fill in &block.fills {
            let mut taker = self.get_user_stats(store, &fill.taker)?;
            taker.taker_notional = taker.taker_notional.saturating_add(fill.notional);
            self.set_user_stats(store, &fill.taker, &taker)?;

            let mut maker = self.get_user_stats(store, &fill.maker)?;
            maker.maker_notional = maker.maker_notional.saturating_add(fill.notional);
            self.set_user_stats(store, &fill.maker, &maker)?;

            let entry = by_user.entry(fill.taker.clone()).or_default();
            entry.taker_notional = entry.taker_notional.saturating_add(fill.notional);
            let entry = by_user.entry(fill.maker.clone()).or_default();
            entry.maker_notional = entry.maker_notional.saturating_add(fill.notional);

            global.notional_traded = global.notional_traded.saturating_add(fill.notional);
        }

        let stats = EpochStats {
            epoch_end_time: epoch.next_tick,
            stats: by_user
                .into_iter()
                .map(|(user, stats)| UserWithStats { user, stats })
                .collect(),
        };
        set_value(store, GLOBAL_STATS_KEY.as_bytes(), &global)?;
        set_value(store, &u32_key(EPOCH_STATS_PREFIX, epoch.current_epoch), &stats)?;
        debug!(epoch = epoch.current_epoch, fills = block.fills.len(), "processed block stats");
        Ok(())
    }

    // 12.2: expire at most one trailing epoch per block.
    pub fn expire_old_stats(
        &self,
        store: &mut dyn KvStore,
        epoch: &EpochInfo,
        block_time_secs: i64,
    ) -> Result<(), StoreError> {
        let mut metadata = self.get_stats_metadata(store)?;
        if metadata.trailing_epoch >= epoch.current_epoch {
            return Ok(());
        }

        let Some(expired) = self.get_epoch_stats(store, metadata.trailing_epoch)? else {
            metadata.trailing_epoch += 1;
            return set_value(store, STATS_METADATA_KEY.as_bytes(), &metadata);
        };

        if expired.epoch_end_time >= block_time_secs - self.window_secs {
            return Ok(());
        }

        let mut global = self.get_global_stats(store)?;
        for removed in &expired.stats {
            let mut stats = self.get_user_stats(store, &removed.user)?;
            stats.taker_notional = stats.taker_notional.saturating_sub(removed.stats.taker_notional);
            stats.maker_notional = stats.maker_notional.saturating_sub(removed.stats.maker_notional);
            self.set_user_stats(store, &removed.user, &stats)?;
            // taker side only, every fill has exactly one taker
            global.notional_traded = global.notional_traded.saturating_sub(removed.stats.taker_notional);
        }
        set_value(store, GLOBAL_STATS_KEY.as_bytes(), &global)?;
        store.delete(&u32_key(EPOCH_STATS_PREFIX, metadata.trailing_epoch));
        debug!(epoch = metadata.trailing_epoch, "expired epoch stats");
        metadata.trailing_epoch += 1;
        set_value(store, STATS_METADATA_KEY.as_bytes(), &metadata)
    }
}
