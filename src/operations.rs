//! Operations queue.
//!
//! The proposer records everything its local matching did as an ordered list of
//! raw operations. Every validator turns that list back into
//! [`InternalOperation`]s with [`validate_and_transform_raw_operations`] before
//! replaying it. Short-term placements travel as the original `MsgPlaceOrder`
//! transaction bytes since short-term orders exist nowhere else.

use crate::matching::MakerFill;
use crate::order::{LiquidationOrder, Order, OrderError, OrderId, OrderRemovalReason};
use crate::proposal::{decode_tx, encode_tx, Msg, MsgPlaceOrder, ProcessError, Tx};
use crate::types::{ClobPairId, PerpetualId, SubaccountId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedFill {
    pub maker_order_id: OrderId,
    pub fill_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOrders {
    pub taker_order_id: OrderId,
    pub fills: Vec<ProposedFill>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPerpetualLiquidation {
    pub liquidated: SubaccountId,
    pub clob_pair_id: ClobPairId,
    pub perpetual_id: PerpetualId,
    pub total_size: u64,
    pub is_buy: bool,
    pub fills: Vec<ProposedFill>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleveragingFill {
    pub offsetting_subaccount_id: SubaccountId,
    pub fill_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPerpetualDeleveraging {
    pub liquidated: SubaccountId,
    pub perpetual_id: PerpetualId,
    pub fills: Vec<DeleveragingFill>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClobMatch {
    Orders(MatchOrders),
    PerpetualLiquidation(MatchPerpetualLiquidation),
    PerpetualDeleveraging(MatchPerpetualDeleveraging),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRemoval {
    pub order_id: OrderId,
    pub removal_reason: OrderRemovalReason,
}

/// As carried in `MsgProposedOperations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationRaw {
    Match(ClobMatch),
    /// Bytes of a tx holding exactly one `MsgPlaceOrder`.
    ShortTermOrderPlacement(Vec<u8>),
    PreexistingStatefulOrder(OrderId),
    OrderRemoval(OrderRemoval),
}

/// Decoded and statelessly validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalOperation {
    Match(ClobMatch),
    ShortTermOrderPlacement(Order),
    PreexistingStatefulOrder(OrderId),
    OrderRemoval(OrderRemoval),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationsError {
    #[error("operation {index}: placement tx could not be decoded: {reason}")]
    InvalidPlacementTx { index: usize, reason: String },

    #[error("operation {index}: placement tx must hold exactly one MsgPlaceOrder")]
    NotSinglePlaceOrder { index: usize },

    #[error("order {0} is not a short-term order")]
    NotShortTerm(OrderId),

    #[error("order {0} is not a stateful order")]
    NotStateful(OrderId),

    #[error(transparent)]
    InvalidOrder(#[from] OrderError),

    #[error("match has no fills")]
    EmptyFills,

    #[error("fill of maker {0} has zero fill amount")]
    ZeroFillAmount(OrderId),

    #[error("maker {0} appears more than once in a match")]
    DuplicateMaker(OrderId),

    #[error("order {0} cannot fill against itself")]
    SelfReference(OrderId),

    #[error("short-term order {0} is referenced before it is placed")]
    OrderNotPlaced(OrderId),

    #[error("liquidation of {0} has zero total size")]
    ZeroLiquidationSize(SubaccountId),

    #[error("liquidation of {liquidated}: fills {filled} exceed total size {total_size}")]
    LiquidationOverfilled {
        liquidated: SubaccountId,
        filled: u64,
        total_size: u64,
    },

    #[error("deleveraging of {liquidated}: offsetting subaccount {offsetting} is invalid")]
    InvalidOffsetting {
        liquidated: SubaccountId,
        offsetting: SubaccountId,
    },

    #[error("deleveraging of {0}: zero fill amount")]
    ZeroDeleveragingFill(SubaccountId),

    #[error("no tx bytes stored for short-term order {0}")]
    MissingTxBytes(OrderId),

    #[error("tx bytes for short-term order {0} already stored")]
    DuplicateTxBytes(OrderId),

    #[error("order {0} is already in the operations queue")]
    AlreadyQueued(OrderId),
}

/// Tx bytes a short-term placement travels as.
pub fn place_order_tx_bytes(order: &Order) -> Result<Vec<u8>, ProcessError> {
    encode_tx(&Tx::single(Msg::PlaceOrder(MsgPlaceOrder { order: order.clone() })))
}

fn decode_placement(index: usize, bytes: &[u8]) -> Result<Order, OperationsError> {
    let tx = decode_tx(bytes).map_err(|e| OperationsError::InvalidPlacementTx {
        index,
        reason: e.to_string(),
    })?;
    match <[Msg; 1]>::try_from(tx.msgs) {
        Ok([Msg::PlaceOrder(msg)]) => Ok(msg.order),
        _ => Err(OperationsError::NotSinglePlaceOrder { index }),
    }
}

// 6.1: stateless checks of the whole queue.
pub fn validate_and_transform_raw_operations(
    raw: &[OperationRaw],
) -> Result<Vec<InternalOperation>, OperationsError> {
    let mut placed_short_term: BTreeSet<OrderId> = BTreeSet::new();
    let mut operations = Vec::with_capacity(raw.len());

    for (index, operation) in raw.iter().enumerate() {
        let internal = match operation {
            OperationRaw::ShortTermOrderPlacement(bytes) => {
                let order = decode_placement(index, bytes)?;
                if !order.order_id.is_short_term() {
                    return Err(OperationsError::NotShortTerm(order.order_id));
                }
                order.validate_basic()?;
                placed_short_term.insert(order.order_id.clone());
                InternalOperation::ShortTermOrderPlacement(order)
            }
            OperationRaw::PreexistingStatefulOrder(order_id) => {
                if !order_id.is_stateful() {
                    return Err(OperationsError::NotStateful(order_id.clone()));
                }
                InternalOperation::PreexistingStatefulOrder(order_id.clone())
            }
            OperationRaw::OrderRemoval(removal) => {
                if !removal.order_id.is_stateful() {
                    return Err(OperationsError::NotStateful(removal.order_id.clone()));
                }
                InternalOperation::OrderRemoval(removal.clone())
            }
            OperationRaw::Match(clob_match) => {
                validate_match(clob_match, &placed_short_term)?;
                InternalOperation::Match(clob_match.clone())
            }
        };
        operations.push(internal);
    }

    Ok(operations)
}

fn require_placed(order_id: &OrderId, placed: &BTreeSet<OrderId>) -> Result<(), OperationsError> {
    if order_id.is_short_term() && !placed.contains(order_id) {
        return Err(OperationsError::OrderNotPlaced(order_id.clone()));
    }
    Ok(())
}

fn validate_maker_fills(
    fills: &[ProposedFill],
    taker: Option<&OrderId>,
    placed: &BTreeSet<OrderId>,
) -> Result<u64, OperationsError> {
    if fills.is_empty() {
        return Err(OperationsError::EmptyFills);
    }
    let mut seen = BTreeSet::new();
    let mut total: u64 = 0;
    for fill in fills {
        let maker = &fill.maker_order_id;
        if fill.fill_amount == 0 {
            return Err(OperationsError::ZeroFillAmount(maker.clone()));
        }
        if Some(maker) == taker {
            return Err(OperationsError::SelfReference(maker.clone()));
        }
        if !seen.insert(maker) {
            return Err(OperationsError::DuplicateMaker(maker.clone()));
        }
        require_placed(maker, placed)?;
        total = total.saturating_add(fill.fill_amount);
    }
    Ok(total)
}

fn validate_match(clob_match: &ClobMatch, placed: &BTreeSet<OrderId>) -> Result<(), OperationsError> {
    match clob_match {
        ClobMatch::Orders(m) => {
            require_placed(&m.taker_order_id, placed)?;
            validate_maker_fills(&m.fills, Some(&m.taker_order_id), placed)?;
        }
        ClobMatch::PerpetualLiquidation(m) => {
            if m.total_size == 0 {
                return Err(OperationsError::ZeroLiquidationSize(m.liquidated.clone()));
            }
            let filled = validate_maker_fills(&m.fills, None, placed)?;
            if filled > m.total_size {
                return Err(OperationsError::LiquidationOverfilled {
                    liquidated: m.liquidated.clone(),
                    filled,
                    total_size: m.total_size,
                });
            }
        }
        ClobMatch::PerpetualDeleveraging(m) => {
            if m.fills.is_empty() {
                return Err(OperationsError::EmptyFills);
            }
            let mut seen = BTreeSet::new();
            for fill in &m.fills {
                if fill.fill_amount == 0 {
                    return Err(OperationsError::ZeroDeleveragingFill(m.liquidated.clone()));
                }
                let offsetting = &fill.offsetting_subaccount_id;
                if offsetting == &m.liquidated || !seen.insert(offsetting) {
                    return Err(OperationsError::InvalidOffsetting {
                        liquidated: m.liquidated.clone(),
                        offsetting: offsetting.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

// 6.2: proposer side. builds the queue while local matching runs.
#[derive(Debug, Clone, Default)]
pub struct OperationsToPropose {
    queue: Vec<OperationRaw>,
    short_term_tx_bytes: BTreeMap<OrderId, Vec<u8>>,
    queued_orders: BTreeSet<OrderId>,
}

impl OperationsToPropose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Keeps a short-term order's placement bytes until a match references it.
    pub fn add_short_term_order_tx_bytes(&mut self, order: &Order, tx_bytes: Vec<u8>) -> Result<(), OperationsError> {
        let order_id = &order.order_id;
        if !order_id.is_short_term() {
            return Err(OperationsError::NotShortTerm(order_id.clone()));
        }
        if self.short_term_tx_bytes.contains_key(order_id) {
            return Err(OperationsError::DuplicateTxBytes(order_id.clone()));
        }
        self.short_term_tx_bytes.insert(order_id.clone(), tx_bytes);
        Ok(())
    }

    /// Forgets the bytes of a canceled order. an order that already took part in
    /// a queued match stays in the queue.
    pub fn remove_short_term_order_tx_bytes(&mut self, order_id: &OrderId) -> Result<(), OperationsError> {
        if self.queued_orders.contains(order_id) {
            return Err(OperationsError::AlreadyQueued(order_id.clone()));
        }
        self.short_term_tx_bytes.remove(order_id);
        Ok(())
    }

    pub fn has_short_term_order_tx_bytes(&self, order_id: &OrderId) -> bool {
        self.short_term_tx_bytes.contains_key(order_id)
    }

    // queues a placement the first time an order is referenced
    fn ensure_placed(&mut self, order: &Order) -> Result<(), OperationsError> {
        let order_id = &order.order_id;
        if self.queued_orders.contains(order_id) {
            return Ok(());
        }
        let operation = if order_id.is_short_term() {
            let bytes = self
                .short_term_tx_bytes
                .get(order_id)
                .ok_or_else(|| OperationsError::MissingTxBytes(order_id.clone()))?;
            OperationRaw::ShortTermOrderPlacement(bytes.clone())
        } else {
            OperationRaw::PreexistingStatefulOrder(order_id.clone())
        };
        self.queue.push(operation);
        self.queued_orders.insert(order_id.clone());
        Ok(())
    }

    pub fn add_order_match(&mut self, taker: &Order, fills: &[MakerFill]) -> Result<(), OperationsError> {
        if fills.is_empty() {
            return Err(OperationsError::EmptyFills);
        }
        for fill in fills {
            self.ensure_placed(&fill.maker_order)?;
        }
        self.ensure_placed(taker)?;
        self.queue.push(OperationRaw::Match(ClobMatch::Orders(MatchOrders {
            taker_order_id: taker.order_id.clone(),
            fills: proposed_fills(fills),
        })));
        Ok(())
    }

    pub fn add_liquidation_match(
        &mut self,
        liquidation: &LiquidationOrder,
        fills: &[MakerFill],
    ) -> Result<(), OperationsError> {
        if fills.is_empty() {
            return Err(OperationsError::EmptyFills);
        }
        for fill in fills {
            self.ensure_placed(&fill.maker_order)?;
        }
        self.queue
            .push(OperationRaw::Match(ClobMatch::PerpetualLiquidation(MatchPerpetualLiquidation {
                liquidated: liquidation.subaccount_id.clone(),
                clob_pair_id: liquidation.clob_pair_id,
                perpetual_id: liquidation.perpetual_id,
                total_size: liquidation.total_size,
                is_buy: liquidation.is_buy,
                fills: proposed_fills(fills),
            })));
        Ok(())
    }

    pub fn add_deleveraging_match(&mut self, deleveraging: MatchPerpetualDeleveraging) -> Result<(), OperationsError> {
        if deleveraging.fills.is_empty() {
            return Err(OperationsError::EmptyFills);
        }
        self.queue
            .push(OperationRaw::Match(ClobMatch::PerpetualDeleveraging(deleveraging)));
        Ok(())
    }

    pub fn add_order_removal(&mut self, order_id: OrderId, reason: OrderRemovalReason) -> Result<(), OperationsError> {
        if !order_id.is_stateful() {
            return Err(OperationsError::NotStateful(order_id));
        }
        self.queue.push(OperationRaw::OrderRemoval(OrderRemoval {
            order_id,
            removal_reason: reason,
        }));
        Ok(())
    }

    pub fn get_operations_to_propose(&self) -> Vec<OperationRaw> {
        self.queue.clone()
    }

    /// Empties the queue once a block commits. stored tx bytes of orders that
    /// never matched are kept.
    pub fn clear(&mut self) {
        for order_id in std::mem::take(&mut self.queued_orders) {
            self.short_term_tx_bytes.remove(&order_id);
        }
        self.queue.clear();
    }
}

fn proposed_fills(fills: &[MakerFill]) -> Vec<ProposedFill> {
    fills
        .iter()
        .map(|f| ProposedFill {
            maker_order_id: f.maker_order.order_id.clone(),
            fill_amount: f.fill_amount,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{GoodTil, OrderFlags, TimeInForce};
    use crate::types::Side;

    fn order(owner: &str, client_id: u32, flags: OrderFlags, side: Side) -> Order {
        Order {
            order_id: OrderId::new(SubaccountId::new(owner, 0), client_id, flags, ClobPairId(0)),
            side,
            quantums: 10,
            subticks: 100,
            good_til: match flags {
                OrderFlags::ShortTerm => GoodTil::Block(10),
                _ => GoodTil::BlockTime(100),
            },
            time_in_force: TimeInForce::Unspecified,
            reduce_only: false,
            condition: None,
        }
    }

    fn placement(order: &Order) -> OperationRaw {
        OperationRaw::ShortTermOrderPlacement(place_order_tx_bytes(order).unwrap())
    }

    fn fill(maker: &Order, amount: u64) -> ProposedFill {
        ProposedFill {
            maker_order_id: maker.order_id.clone(),
            fill_amount: amount,
        }
    }

    fn orders_match(taker: &Order, fills: Vec<ProposedFill>) -> OperationRaw {
        OperationRaw::Match(ClobMatch::Orders(MatchOrders {
            taker_order_id: taker.order_id.clone(),
            fills,
        }))
    }

    #[test]
    fn valid_queue_transforms_in_order() {
        let maker = order("alice", 1, OrderFlags::LongTerm, Side::Sell);
        let taker = order("bob", 1, OrderFlags::ShortTerm, Side::Buy);
        let raw = vec![
            OperationRaw::PreexistingStatefulOrder(maker.order_id.clone()),
            placement(&taker),
            orders_match(&taker, vec![fill(&maker, 5)]),
        ];
        let ops = validate_and_transform_raw_operations(&raw).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[1], InternalOperation::ShortTermOrderPlacement(taker));
    }

    #[test]
    fn short_term_must_be_placed_first() {
        let maker = order("alice", 1, OrderFlags::ShortTerm, Side::Sell);
        let taker = order("bob", 1, OrderFlags::ShortTerm, Side::Buy);
        let raw = vec![placement(&taker), orders_match(&taker, vec![fill(&maker, 5)])];
        assert_eq!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::OrderNotPlaced(maker.order_id))
        );
    }

    #[test]
    fn fill_shape_checks() {
        let maker = order("alice", 1, OrderFlags::LongTerm, Side::Sell);
        let taker = order("bob", 1, OrderFlags::LongTerm, Side::Buy);

        let raw = vec![orders_match(&taker, vec![])];
        assert_eq!(validate_and_transform_raw_operations(&raw), Err(OperationsError::EmptyFills));

        let raw = vec![orders_match(&taker, vec![fill(&maker, 0)])];
        assert!(matches!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::ZeroFillAmount(_))
        ));

        let raw = vec![orders_match(&taker, vec![fill(&maker, 1), fill(&maker, 1)])];
        assert!(matches!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::DuplicateMaker(_))
        ));

        let raw = vec![orders_match(&taker, vec![fill(&taker, 1)])];
        assert!(matches!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::SelfReference(_))
        ));
    }

    #[test]
    fn placement_bytes_must_be_a_single_short_term_order() {
        let stateful = order("alice", 1, OrderFlags::LongTerm, Side::Sell);
        let raw = vec![placement(&stateful)];
        assert!(matches!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::NotShortTerm(_))
        ));

        let two = encode_tx(&Tx {
            msgs: vec![Msg::IsDelayedBlock, Msg::IsDelayedBlock],
        })
        .unwrap();
        let raw = vec![OperationRaw::ShortTermOrderPlacement(two)];
        assert_eq!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::NotSinglePlaceOrder { index: 0 })
        );

        let raw = vec![OperationRaw::ShortTermOrderPlacement(vec![0xff; 3])];
        assert!(matches!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::InvalidPlacementTx { index: 0, .. })
        ));
    }

    #[test]
    fn liquidation_and_deleveraging_shapes() {
        let maker = order("alice", 1, OrderFlags::LongTerm, Side::Sell);
        let carl = SubaccountId::new("carl", 0);
        let liquidation = |total_size| {
            OperationRaw::Match(ClobMatch::PerpetualLiquidation(MatchPerpetualLiquidation {
                liquidated: carl.clone(),
                clob_pair_id: ClobPairId(0),
                perpetual_id: PerpetualId(0),
                total_size,
                is_buy: true,
                fills: vec![fill(&maker, 10)],
            }))
        };
        assert!(validate_and_transform_raw_operations(&[liquidation(10)]).is_ok());
        assert!(matches!(
            validate_and_transform_raw_operations(&[liquidation(5)]),
            Err(OperationsError::LiquidationOverfilled { filled: 10, .. })
        ));

        let deleveraging = OperationRaw::Match(ClobMatch::PerpetualDeleveraging(MatchPerpetualDeleveraging {
            liquidated: carl.clone(),
            perpetual_id: PerpetualId(0),
            fills: vec![DeleveragingFill {
                offsetting_subaccount_id: carl.clone(),
                fill_amount: 5,
            }],
        }));
        assert!(matches!(
            validate_and_transform_raw_operations(&[deleveraging]),
            Err(OperationsError::InvalidOffsetting { .. })
        ));
    }

    #[test]
    fn removals_only_for_stateful_orders() {
        let short = order("alice", 1, OrderFlags::ShortTerm, Side::Sell);
        let raw = vec![OperationRaw::OrderRemoval(OrderRemoval {
            order_id: short.order_id.clone(),
            removal_reason: OrderRemovalReason::Undercollateralized,
        })];
        assert!(matches!(
            validate_and_transform_raw_operations(&raw),
            Err(OperationsError::NotStateful(_))
        ));
    }

    #[test]
    fn queue_places_orders_once() {
        let maker = order("alice", 1, OrderFlags::ShortTerm, Side::Sell);
        let stateful_maker = order("carl", 1, OrderFlags::LongTerm, Side::Sell);
        let taker = order("bob", 1, OrderFlags::ShortTerm, Side::Buy);
        let mut queue = OperationsToPropose::new();
        for o in [&maker, &taker] {
            queue
                .add_short_term_order_tx_bytes(o, place_order_tx_bytes(o).unwrap())
                .unwrap();
        }
        let fills = vec![
            MakerFill {
                maker_order: maker.clone(),
                fill_amount: 3,
            },
            MakerFill {
                maker_order: stateful_maker.clone(),
                fill_amount: 2,
            },
        ];
        queue.add_order_match(&taker, &fills[..1]).unwrap();
        queue.add_order_match(&taker, &fills).unwrap();

        let ops = queue.get_operations_to_propose();
        // maker, taker, match, stateful maker, match
        assert_eq!(ops.len(), 5);
        assert!(matches!(ops[3], OperationRaw::PreexistingStatefulOrder(_)));
        assert!(validate_and_transform_raw_operations(&ops).is_ok());

        assert_eq!(
            queue.remove_short_term_order_tx_bytes(&maker.order_id),
            Err(OperationsError::AlreadyQueued(maker.order_id.clone()))
        );
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.has_short_term_order_tx_bytes(&maker.order_id));
    }

    #[test]
    fn match_needs_stored_bytes() {
        let maker = order("alice", 1, OrderFlags::ShortTerm, Side::Sell);
        let taker = order("bob", 1, OrderFlags::LongTerm, Side::Buy);
        let mut queue = OperationsToPropose::new();
        let fills = vec![MakerFill {
            maker_order: maker.clone(),
            fill_amount: 3,
        }];
        assert_eq!(
            queue.add_order_match(&taker, &fills),
            Err(OperationsError::MissingTxBytes(maker.order_id))
        );
    }
}
