// perps-clob: central limit order book for perpetual futures.
// consensus-first: every node replays the proposer's operations against the
// same state and must land on the same bytes. nothing here reads a clock.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: ids, sides, block context, ppm and quantum math
//   2.x  order.rs: orders, ids, time in force, conditions, removal reasons
//   2.5  orderbook.rs: price-time books and the per-node MemClob
//   2.7  matching.rs: matching loop, fees, self-trade policy
//   3.x  margin.rs: liquidity tiers, notional, risk summaries
//   4.x  subaccount.rs: ledger trait, collateral rule, store-backed ledger
//   5.x  operations.rs: operations queue, raw decoding, validation
//   6.x  liquidation.rs: fillable price, bankruptcy, insurance fund math
//   6.2  deleveraging.rs: offsetting candidate ranking and allocation
//   7.x  config.rs: fees, windows, liquidation params, env presets
//   8.x  engine/: the clob keeper
//   9.x  registry.rs: perpetuals, markets, tiers, oracle subticks
//   9.4  price_cache.rs: local oracle price caches
//   10.x bank.rs: module accounts and transfers
//   11.x indexer.rs: event sink and block assembly
//   12.x clob_pair.rs, stats.rs: pairs and trading stats
//   13.x proposal.rs: proposal txs, decoding, validation
//   14.x store.rs: kv store, cache branches, key layout
//   15.x app.rs: in-process node driving blocks end to end

// clob core
pub mod clob_pair;
pub mod engine;
pub mod matching;
pub mod order;
pub mod orderbook;
pub mod types;

// risk
pub mod deleveraging;
pub mod liquidation;
pub mod margin;

// consensus plumbing
pub mod operations;
pub mod proposal;
pub mod store;

// collaborators
pub mod bank;
pub mod indexer;
pub mod price_cache;
pub mod registry;
pub mod stats;
pub mod subaccount;

// settings and the node
pub mod app;
pub mod config;

// re exports for convenience
pub use app::{App, AppError, DeliveredBlock};
pub use clob_pair::{ClobPair, ClobPairError, ClobPairStatus};
pub use config::{ClobConfig, ConfigError, Environment, FeeTierParams};
pub use engine::*;
pub use matching::{MatchWithOrders, SelfTradePolicy};
pub use operations::{ClobMatch, InternalOperation, OperationRaw, OperationsError, OperationsToPropose};
pub use order::*;
pub use proposal::{ProcessError, ProcessProposalTxs};
pub use store::{CacheStore, KvStore, MemStore};
pub use types::*;
