// 8.0.2: result types and errors for keeper operations.

use crate::bank::BankError;
use crate::clob_pair::{ClobPairError, ClobPairStatus};
use crate::config::ConfigError;
use crate::indexer::IndexerError;
use crate::matching::MatchWithOrders;
use crate::operations::OperationsError;
use crate::order::{OrderError, OrderId, OrderRemovalReason};
use crate::orderbook::BookError;
use crate::proposal::ProcessError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::subaccount::SubaccountError;
use crate::types::{ClobPairId, PerpetualId, SubaccountId};
use serde::{Deserialize, Serialize};

/// What happened to an order placed through the local path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Success,
    /// Matching stopped because the taker failed its collateral check.
    Undercollateralized,
    /// Matching stopped at a maker of the same subaccount.
    SelfTradeStopped,
    /// An IOC remainder was dropped instead of resting.
    RemainderCanceled,
    /// Matching stopped because the taker is reduce-only and the next fill would flip it.
    ReduceOnlyStopped,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderResult {
    pub order_id: OrderId,
    pub filled_quantums: u64,
    pub remaining_quantums: u64,
    pub is_resting: bool,
    pub status: OrderStatus,
    pub matches: Vec<MatchWithOrders>,
    pub removed_makers: Vec<(OrderId, OrderRemovalReason)>,
}

#[derive(Debug, Clone, Default)]
pub struct LiquidationResult {
    pub subaccount_id: Option<SubaccountId>,
    pub perpetual_id: Option<PerpetualId>,
    pub liquidated_quantums: u64,
    pub deleveraged_quantums: u64,
    /// Summed over every liquidation fill. negative when the fund paid out.
    pub insurance_fund_delta: i128,
    pub matches: Vec<MatchWithOrders>,
}

/// Per-block summary of what the replay and the block phases did to orders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessProposerMatchesEvents {
    pub placed_stateful_order_ids: Vec<OrderId>,
    pub expired_stateful_order_ids: Vec<OrderId>,
    /// Fill order: each taker before its makers. duplicates are kept.
    pub order_ids_filled_in_last_block: Vec<OrderId>,
    pub placed_stateful_cancellation_order_ids: Vec<OrderId>,
    /// Sorted, without duplicates.
    pub removed_stateful_order_ids: Vec<OrderId>,
    pub conditional_order_ids_triggered_in_last_block: Vec<OrderId>,
    pub block_height: u32,
}

impl ProcessProposerMatchesEvents {
    pub fn new(block_height: u32) -> Self {
        Self {
            block_height,
            ..Self::default()
        }
    }

    pub(super) fn add_removed(&mut self, order_id: OrderId) {
        if let Err(pos) = self.removed_stateful_order_ids.binary_search(&order_id) {
            self.removed_stateful_order_ids.insert(pos, order_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClobError {
    #[error("ClobPair {0} not found")]
    ClobPairNotFound(ClobPairId),

    #[error("ClobPair {0} already exists")]
    ClobPairAlreadyExists(ClobPairId),

    #[error("NoClobPairForPerpetual: perpetual {0} has no initialized clob pair")]
    NoClobPairForPerpetual(PerpetualId),

    #[error("ClobPair {clob_pair_id} is {status:?}")]
    ClobPairNotActive {
        clob_pair_id: ClobPairId,
        status: ClobPairStatus,
    },

    #[error("stateful order {0} not found")]
    StatefulOrderNotFound(OrderId),

    #[error("stateful order {0} already exists")]
    StatefulOrderAlreadyExists(OrderId),

    #[error("conditional order {0} has not been triggered")]
    ConditionalOrderUntriggered(OrderId),

    #[error("order {0} is not resting on the book")]
    OrderNotFound(OrderId),

    #[error("order {order_id}: good til block {good_til_block} outside [{height}, {max}]")]
    GoodTilBlockOutOfRange {
        order_id: OrderId,
        good_til_block: u32,
        height: u32,
        max: u32,
    },

    #[error("order {order_id}: good til block time {good_til_block_time} outside ({block_time}, {max}]")]
    GoodTilBlockTimeOutOfRange {
        order_id: OrderId,
        good_til_block_time: u32,
        block_time: i64,
        max: i64,
    },

    #[error("order {0} is already fully filled")]
    OrderFullyFilled(OrderId),

    #[error("post-only order {0} would cross a maker order")]
    PostOnlyWouldCrossMakerOrder(OrderId),

    #[error("fill-or-kill order {0} could not be fully filled")]
    FokOrderCouldNotBeFullyFilled(OrderId),

    #[error("invalid match: {0}")]
    InvalidMatch(String),

    #[error("taker {taker} and maker {maker} share a subaccount")]
    SelfTrade { taker: OrderId, maker: OrderId },

    #[error("order {order_id} would be filled {total} of {quantums}")]
    OrderOverfilled {
        order_id: OrderId,
        total: u64,
        quantums: u64,
    },

    #[error("fill amount {fill_amount} is not a multiple of step {step}")]
    FillNotMultipleOfStep { fill_amount: u64, step: u64 },

    #[error("reduce-only order {0} would increase or flip its position")]
    InvalidReduceOnly(OrderId),

    #[error("subaccount {0} is not liquidatable")]
    SubaccountNotLiquidatable(SubaccountId),

    #[error("subaccount {subaccount_id} was already liquidated for perpetual {perpetual_id} this block")]
    SubaccountAlreadyLiquidated {
        subaccount_id: SubaccountId,
        perpetual_id: PerpetualId,
    },

    #[error("invalid liquidation of {subaccount_id}: {reason}")]
    InvalidLiquidation {
        subaccount_id: SubaccountId,
        reason: String,
    },

    #[error("liquidation of {subaccount_id} exceeds block limit: {reason}")]
    LiquidationExceedsBlockLimits {
        subaccount_id: SubaccountId,
        reason: String,
    },

    #[error("InsufficientInsuranceFunds: need {required}, fund holds {available}")]
    InsufficientInsuranceFunds { required: u64, available: u64 },

    #[error("DeleveragedSubaccountNotLiquidatable: subaccount {0} is not liquidatable")]
    DeleveragedSubaccountNotLiquidatable(SubaccountId),

    #[error("invalid deleveraging fill: {0}")]
    InvalidDeleveragingFill(String),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    ClobPair(#[from] ClobPairError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Operations(#[from] OperationsError),

    #[error(transparent)]
    Proposal(#[from] ProcessError),

    #[error(transparent)]
    Subaccount(#[from] SubaccountError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Bank(#[from] BankError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Book(#[from] BookError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
