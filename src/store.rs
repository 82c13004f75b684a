// 14.0: key-value state handle. every consensus write goes through a `KvStore`.
// 14.1 CacheStore buffers writes over a parent and commits them in one step, which
// is how block replay gets all-or-nothing semantics.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

// 14.2: key prefixes. numeric suffixes are big-endian so prefix scans come back in id order.
pub const CLOB_PAIR_PREFIX: &str = "ClobPair/value/";
pub const NUM_CLOB_PAIRS_KEY: &str = "NumClobPairs/value";
pub const ORDER_AMOUNT_PREFIX: &str = "OrderAmount/value/";
pub const PRUNABLE_ORDERS_PREFIX: &str = "BlockHeightToPotentiallyPrunableOrders/value/";
pub const STATEFUL_ORDER_PREFIX: &str = "StatefulOrderPlacement/value/";
pub const PROCESS_PROPOSER_MATCHES_EVENTS_KEY: &str = "ProcessProposerMatchesEvents/value";
pub const SUBACCOUNT_PREFIX: &str = "Subaccount/value/";
pub const PERPETUAL_PREFIX: &str = "Perpetual/value/";
pub const MARKET_PRICE_PREFIX: &str = "MarketPrice/value/";
pub const LIQUIDITY_TIER_PREFIX: &str = "LiquidityTier/value/";
pub const MODULE_BALANCE_PREFIX: &str = "ModuleBalance/value/";
pub const STATS_METADATA_KEY: &str = "StatsMetadata/value";
pub const EPOCH_STATS_PREFIX: &str = "EpochStats/value/";
pub const USER_STATS_PREFIX: &str = "UserStats/value/";
pub const GLOBAL_STATS_KEY: &str = "GlobalStats/value";

/// Everything under this prefix only lives for one block.
pub const TRANSIENT_PREFIX: &str = "Transient/";
pub const BLOCK_STATS_KEY: &str = "Transient/BlockStats/value";
pub const SUBACCOUNT_LIQUIDATION_INFO_PREFIX: &str = "Transient/SubaccountLiquidationInfo/value/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode value for key {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("failed to decode value for key {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Byte-oriented state handle.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&mut self, key: &[u8], value: Vec<u8>);
    fn delete(&mut self, key: &[u8]);
    /// All entries whose key starts with `prefix`, in ascending key order.
    fn prefix_entries(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// Plain in-memory store. the committed state of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.entries.insert(key.to_vec(), value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.entries.remove(key);
    }

    fn prefix_entries(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Write buffer over a parent store. dropping it discards every buffered write.
pub struct CacheStore<'a> {
    parent: &'a mut dyn KvStore,
    // None marks a delete
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> CacheStore<'a> {
    pub fn new(parent: &'a mut dyn KvStore) -> Self {
        Self {
            parent,
            writes: BTreeMap::new(),
        }
    }

    /// Number of keys touched since the branch was opened.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn commit(self) {
        let CacheStore { parent, writes } = self;
        for (key, value) in writes {
            match value {
                Some(v) => parent.set(&key, v),
                None => parent.delete(&key),
            }
        }
    }
}

impl KvStore for CacheStore<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(buffered) => buffered.clone(),
            None => self.parent.get(key),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn prefix_entries(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.parent.prefix_entries(prefix).into_iter().collect();
        for (key, value) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

// 14.3: typed helpers. values are bincode, which is deterministic for our types.

pub fn key_with_suffix(prefix: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(suffix);
    key
}

pub fn u32_key(prefix: &str, id: u32) -> Vec<u8> {
    key_with_suffix(prefix, &id.to_be_bytes())
}

/// Key for a serializable id (OrderId, SubaccountId).
pub fn encoded_key<K: Serialize>(prefix: &str, id: &K) -> Result<Vec<u8>, StoreError> {
    let suffix = bincode::serialize(id).map_err(|e| StoreError::Encode {
        key: prefix.to_string(),
        reason: e.to_string(),
    })?;
    Ok(key_with_suffix(prefix, &suffix))
}

pub fn get_value<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    match store.get(key) {
        None => Ok(None),
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Decode {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            }),
    }
}

pub fn set_value<T: Serialize>(
    store: &mut dyn KvStore,
    key: &[u8],
    value: &T,
) -> Result<(), StoreError> {
    let bytes = bincode::serialize(value).map_err(|e| StoreError::Encode {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })?;
    store.set(key, bytes);
    Ok(())
}

/// Decodes every value under `prefix`, in key order.
pub fn get_all_values<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &str,
) -> Result<Vec<T>, StoreError> {
    store
        .prefix_entries(prefix.as_bytes())
        .into_iter()
        .map(|(key, bytes)| {
            bincode::deserialize(&bytes).map_err(|e| StoreError::Decode {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            })
        })
        .collect()
}

pub fn clear_prefix(store: &mut dyn KvStore, prefix: &str) -> usize {
    let keys: Vec<Vec<u8>> = store
        .prefix_entries(prefix.as_bytes())
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    for key in &keys {
        store.delete(key);
    }
    keys.len()
}
