//! Orders and order identity.
//!
//! An order is identified by `(subaccount, client id, flags, clob pair)`. Short-term
//! orders live only in memory and expire by block height; long-term and conditional
//! orders are stateful, persisted on placement and expired by block time.

use crate::clob_pair::ClobPair;
use crate::types::{ClobPairId, PerpetualId, Side, SubaccountId};
use serde::{Deserialize, Serialize};
use std::fmt;

// 2.0: order flags. declaration order is part of the OrderId sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrderFlags {
    ShortTerm,
    Conditional,
    LongTerm,
}

impl OrderFlags {
    pub fn is_stateful(&self) -> bool {
        !matches!(self, OrderFlags::ShortTerm)
    }
}

/// Sorted field by field: subaccount, client id, flags, clob pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId {
    pub subaccount_id: SubaccountId,
    pub client_id: u32,
    pub order_flags: OrderFlags,
    pub clob_pair_id: ClobPairId,
}

impl OrderId {
    pub fn new(
        subaccount_id: SubaccountId,
        client_id: u32,
        order_flags: OrderFlags,
        clob_pair_id: ClobPairId,
    ) -> Self {
        Self {
            subaccount_id,
            client_id,
            order_flags,
            clob_pair_id,
        }
    }

    pub fn is_short_term(&self) -> bool {
        !self.order_flags.is_stateful()
    }

    pub fn is_stateful(&self) -> bool {
        self.order_flags.is_stateful()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}({:?})@{}",
            self.subaccount_id, self.client_id, self.order_flags, self.clob_pair_id
        )
    }
}

// 2.1: expiry. short-term orders use a block height, stateful orders a unix time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoodTil {
    Block(u32),
    BlockTime(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    #[default]
    Unspecified,
    PostOnly,
    ImmediateOrCancel,
    FillOrKill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCondition {
    pub condition_type: ConditionType,
    pub trigger_subticks: u64,
}

impl OrderCondition {
    /// Whether an oracle price (in subticks) triggers this condition for an order on `side`.
    /// stop-loss buys trigger as price rises, take-profit buys as price falls.
    pub fn is_triggered(&self, side: Side, oracle_subticks: u64) -> bool {
        match (self.condition_type, side) {
            (ConditionType::StopLoss, Side::Buy) | (ConditionType::TakeProfit, Side::Sell) => {
                oracle_subticks >= self.trigger_subticks
            }
            (ConditionType::StopLoss, Side::Sell) | (ConditionType::TakeProfit, Side::Buy) => {
                oracle_subticks <= self.trigger_subticks
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("order {0} has zero quantums")]
    ZeroQuantums(OrderId),

    #[error("order {0} has zero subticks")]
    ZeroSubticks(OrderId),

    #[error("order {0}: short-term orders require GoodTilBlock")]
    ShortTermRequiresGoodTilBlock(OrderId),

    #[error("order {0}: stateful orders require GoodTilBlockTime")]
    StatefulRequiresGoodTilBlockTime(OrderId),

    #[error("order {0}: conditional orders require a trigger condition")]
    MissingCondition(OrderId),

    #[error("order {0}: only conditional orders may carry a trigger condition")]
    UnexpectedCondition(OrderId),

    #[error("order {0}: post-only orders cannot be IOC or FOK")]
    PostOnlyWithImmediateExecution(OrderId),

    #[error("order {order_id}: quantums {quantums} must be a multiple of step {step}")]
    QuantumsNotMultipleOfStep {
        order_id: OrderId,
        quantums: u64,
        step: u64,
    },

    #[error("order {order_id}: quantums {quantums} below minimum {min}")]
    QuantumsBelowMinimum {
        order_id: OrderId,
        quantums: u64,
        min: u64,
    },

    #[error("order {order_id}: subticks {subticks} must be a multiple of {subticks_per_tick}")]
    SubticksNotMultipleOfTick {
        order_id: OrderId,
        subticks: u64,
        subticks_per_tick: u64,
    },

    #[error("order {order_id} references clob pair {order_pair} but was checked against {pair}")]
    WrongClobPair {
        order_id: OrderId,
        order_pair: ClobPairId,
        pair: ClobPairId,
    },
}

// 2.2: the order itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub side: Side,
    pub quantums: u64,
    pub subticks: u64,
    pub good_til: GoodTil,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub condition: Option<OrderCondition>,
}

impl Order {
    pub fn is_buy(&self) -> bool {
        self.side.is_buy()
    }

    pub fn is_stateful(&self) -> bool {
        self.order_id.is_stateful()
    }

    pub fn is_post_only(&self) -> bool {
        self.time_in_force == TimeInForce::PostOnly
    }

    pub fn is_ioc(&self) -> bool {
        self.time_in_force == TimeInForce::ImmediateOrCancel
    }

    pub fn is_fok(&self) -> bool {
        self.time_in_force == TimeInForce::FillOrKill
    }

    pub fn good_til_block(&self) -> Option<u32> {
        match self.good_til {
            GoodTil::Block(h) => Some(h),
            GoodTil::BlockTime(_) => None,
        }
    }

    pub fn good_til_block_time(&self) -> Option<u32> {
        match self.good_til {
            GoodTil::BlockTime(t) => Some(t),
            GoodTil::Block(_) => None,
        }
    }

    pub fn crosses(&self, resting: &Order) -> bool {
        crosses(self.side, self.subticks, resting.subticks)
    }

    /// Checks that need no state.
    pub fn validate_basic(&self) -> Result<(), OrderError> {
        let id = &self.order_id;
        if self.quantums == 0 {
            return Err(OrderError::ZeroQuantums(id.clone()));
        }
        if self.subticks == 0 {
            return Err(OrderError::ZeroSubticks(id.clone()));
        }
        match (id.order_flags, self.good_til) {
            (OrderFlags::ShortTerm, GoodTil::BlockTime(_)) => {
                return Err(OrderError::ShortTermRequiresGoodTilBlock(id.clone()))
            }
            (OrderFlags::LongTerm | OrderFlags::Conditional, GoodTil::Block(_)) => {
                return Err(OrderError::StatefulRequiresGoodTilBlockTime(id.clone()))
            }
            _ => {}
        }
        match (id.order_flags, &self.condition) {
            (OrderFlags::Conditional, None) => return Err(OrderError::MissingCondition(id.clone())),
            (OrderFlags::Conditional, Some(c)) if c.trigger_subticks == 0 => {
                return Err(OrderError::MissingCondition(id.clone()))
            }
            (OrderFlags::ShortTerm | OrderFlags::LongTerm, Some(_)) => {
                return Err(OrderError::UnexpectedCondition(id.clone()))
            }
            _ => {}
        }
        if self.is_post_only() && (self.is_ioc() || self.is_fok()) {
            return Err(OrderError::PostOnlyWithImmediateExecution(id.clone()));
        }
        Ok(())
    }

    /// Size and price granularity of the pair the order trades on.
    pub fn validate_against(&self, pair: &ClobPair) -> Result<(), OrderError> {
        let id = &self.order_id;
        if id.clob_pair_id != pair.id {
            return Err(OrderError::WrongClobPair {
                order_id: id.clone(),
                order_pair: id.clob_pair_id,
                pair: pair.id,
            });
        }
        if pair.step_base_quantums > 0 && self.quantums % pair.step_base_quantums != 0 {
            return Err(OrderError::QuantumsNotMultipleOfStep {
                order_id: id.clone(),
                quantums: self.quantums,
                step: pair.step_base_quantums,
            });
        }
        if self.quantums < pair.min_order_base_quantums {
            return Err(OrderError::QuantumsBelowMinimum {
                order_id: id.clone(),
                quantums: self.quantums,
                min: pair.min_order_base_quantums,
            });
        }
        if pair.subticks_per_tick > 0 && self.subticks % pair.subticks_per_tick as u64 != 0 {
            return Err(OrderError::SubticksNotMultipleOfTick {
                order_id: id.clone(),
                subticks: self.subticks,
                subticks_per_tick: pair.subticks_per_tick as u64,
            });
        }
        Ok(())
    }
}

/// Buy crosses a resting sell iff buy >= sell; sell crosses a resting buy iff sell <= buy.
pub fn crosses(taker_side: Side, taker_subticks: u64, maker_subticks: u64) -> bool {
    match taker_side {
        Side::Buy => taker_subticks >= maker_subticks,
        Side::Sell => taker_subticks <= maker_subticks,
    }
}

// 2.3: synthetic taker built from a liquidatable subaccount's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOrder {
    pub subaccount_id: SubaccountId,
    pub clob_pair_id: ClobPairId,
    pub perpetual_id: PerpetualId,
    pub total_size: u64,
    pub is_buy: bool,
    /// Fillable price: makers priced beyond it do not cross.
    pub subticks: u64,
}

impl LiquidationOrder {
    pub fn side(&self) -> Side {
        Side::from_is_buy(self.is_buy)
    }
}

/// Anything that can take liquidity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchableOrder {
    Order(Order),
    Liquidation(LiquidationOrder),
}

impl MatchableOrder {
    pub fn subaccount_id(&self) -> &SubaccountId {
        match self {
            MatchableOrder::Order(o) => &o.order_id.subaccount_id,
            MatchableOrder::Liquidation(l) => &l.subaccount_id,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            MatchableOrder::Order(o) => o.side,
            MatchableOrder::Liquidation(l) => l.side(),
        }
    }

    pub fn subticks(&self) -> u64 {
        match self {
            MatchableOrder::Order(o) => o.subticks,
            MatchableOrder::Liquidation(l) => l.subticks,
        }
    }

    pub fn clob_pair_id(&self) -> ClobPairId {
        match self {
            MatchableOrder::Order(o) => o.order_id.clob_pair_id,
            MatchableOrder::Liquidation(l) => l.clob_pair_id,
        }
    }

    pub fn is_liquidation(&self) -> bool {
        matches!(self, MatchableOrder::Liquidation(_))
    }

    pub fn order_id(&self) -> Option<&OrderId> {
        match self {
            MatchableOrder::Order(o) => Some(&o.order_id),
            MatchableOrder::Liquidation(_) => None,
        }
    }
}

/// Why a stateful order left the book without being canceled by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRemovalReason {
    Undercollateralized,
    InvalidReduceOnly,
    PostOnlyWouldCrossMakerOrder,
    InvalidSelfTrade,
    ConditionalFokCouldNotBeFullyFilled,
    ConditionalIocWouldRestOnBook,
    FullyFilled,
}
