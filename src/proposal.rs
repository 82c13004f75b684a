//! Proposal transactions.
//!
//! A block proposal is an ordered list of opaque transaction byte strings:
//!
//! ```text
//! [proposed operations, other*, add premium votes, update market prices]
//! ```
//!
//! The first and the last two are injected by the proposer and must each hold
//! exactly one message of the expected kind. The "other" transactions come from
//! users and must not contain any proposer-injected message. Transactions are
//! bincode-encoded [`Tx`] values.

use crate::operations::OperationRaw;
use crate::order::{GoodTil, Order, OrderId};
use crate::registry::MarketPriceUpdate;
use crate::types::{PerpetualId, SubaccountId};
use serde::{Deserialize, Serialize};

/// The three proposer-injected transactions.
pub const MIN_TXS_IN_BLOCK: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("UnexpectedNumMsgs: {0}")]
    UnexpectedNumMsgs(String),

    #[error("DecodingTxBytes: {0}")]
    DecodingTxBytes(String),

    #[error("UnexpectedMsgType: {0}")]
    UnexpectedMsgType(String),

    #[error("MsgValidateBasic: {0}")]
    MsgValidateBasic(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgProposedOperations {
    pub operations_queue: Vec<OperationRaw>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingPremium {
    pub perpetual_id: PerpetualId,
    pub premium_ppm: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgAddPremiumVotes {
    pub votes: Vec<FundingPremium>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgUpdateMarketPrices {
    pub market_price_updates: Vec<MarketPriceUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPlaceOrder {
    pub order: Order,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCancelOrder {
    pub order_id: OrderId,
    pub good_til: GoodTil,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSend {
    pub from_address: String,
    pub to_address: String,
    pub amount: Vec<Coin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgTransfer {
    pub sender: SubaccountId,
    pub recipient: SubaccountId,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    ProposedOperations(MsgProposedOperations),
    AddPremiumVotes(MsgAddPremiumVotes),
    UpdateMarketPrices(MsgUpdateMarketPrices),
    AcknowledgeBridge { event_ids: Vec<u32> },
    IsDelayedBlock,
    PlaceOrder(MsgPlaceOrder),
    CancelOrder(MsgCancelOrder),
    Send(MsgSend),
    Transfer(MsgTransfer),
}

impl Msg {
    pub fn type_name(&self) -> &'static str {
        match self {
            Msg::ProposedOperations(_) => "MsgProposedOperations",
            Msg::AddPremiumVotes(_) => "MsgAddPremiumVotes",
            Msg::UpdateMarketPrices(_) => "MsgUpdateMarketPrices",
            Msg::AcknowledgeBridge { .. } => "MsgAcknowledgeBridge",
            Msg::IsDelayedBlock => "MsgIsDelayedBlock",
            Msg::PlaceOrder(_) => "MsgPlaceOrder",
            Msg::CancelOrder(_) => "MsgCancelOrder",
            Msg::Send(_) => "MsgSend",
            Msg::Transfer(_) => "MsgTransfer",
        }
    }

    /// Messages only the block proposer may include.
    pub fn is_app_injected(&self) -> bool {
        matches!(
            self,
            Msg::ProposedOperations(_)
                | Msg::AddPremiumVotes(_)
                | Msg::UpdateMarketPrices(_)
                | Msg::AcknowledgeBridge { .. }
                | Msg::IsDelayedBlock
        )
    }

    pub fn validate_basic(&self) -> Result<(), String> {
        match self {
            Msg::ProposedOperations(_) | Msg::IsDelayedBlock => Ok(()),
            Msg::AddPremiumVotes(msg) => validate_premium_votes(&msg.votes),
            Msg::UpdateMarketPrices(msg) => validate_price_updates(&msg.market_price_updates),
            Msg::AcknowledgeBridge { event_ids } => {
                if event_ids.windows(2).any(|w| w[1] != w[0] + 1) {
                    return Err("bridge event ids must be consecutive".to_string());
                }
                Ok(())
            }
            Msg::PlaceOrder(msg) => msg.order.validate_basic().map_err(|e| e.to_string()),
            Msg::CancelOrder(msg) => validate_cancel(msg),
            Msg::Send(msg) => validate_send(msg),
            Msg::Transfer(msg) => {
                if msg.sender == msg.recipient {
                    return Err(format!("sender {} and recipient must differ", msg.sender));
                }
                if msg.amount == 0 {
                    return Err("transfer amount must be positive".to_string());
                }
                Ok(())
            }
        }
    }
}

fn validate_premium_votes(votes: &[FundingPremium]) -> Result<(), String> {
    for pair in votes.windows(2) {
        if pair[0].perpetual_id >= pair[1].perpetual_id {
            return Err(format!(
                "premium votes must be sorted by perpetual id in ascending order without duplicates: {} then {}",
                pair[0].perpetual_id, pair[1].perpetual_id
            ));
        }
    }
    Ok(())
}

fn validate_price_updates(updates: &[MarketPriceUpdate]) -> Result<(), String> {
    for update in updates {
        if update.price == 0 {
            return Err(format!("price cannot be 0 for market id ({})", update.market_id));
        }
    }
    for pair in updates.windows(2) {
        if pair[0].market_id >= pair[1].market_id {
            return Err(format!(
                "price updates must be sorted by market id in ascending order without duplicates: {} then {}",
                pair[0].market_id, pair[1].market_id
            ));
        }
    }
    Ok(())
}

fn validate_cancel(msg: &MsgCancelOrder) -> Result<(), String> {
    match (msg.order_id.is_stateful(), msg.good_til) {
        (false, GoodTil::Block(0)) => Err(format!("cancel of {} needs a good til block", msg.order_id)),
        (false, GoodTil::Block(_)) => Ok(()),
        (true, GoodTil::BlockTime(0)) => {
            Err(format!("cancel of {} needs a good til block time", msg.order_id))
        }
        (true, GoodTil::BlockTime(_)) => Ok(()),
        (false, GoodTil::BlockTime(_)) => {
            Err(format!("short-term cancel of {} must use good til block", msg.order_id))
        }
        (true, GoodTil::Block(_)) => {
            Err(format!("stateful cancel of {} must use good til block time", msg.order_id))
        }
    }
}

// letter first, then 2..=127 of [a-zA-Z0-9/:._-]
fn is_valid_denom(denom: &str) -> bool {
    let mut chars = denom.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphabetic()
        && (3..=128).contains(&denom.len())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '_' | '-'))
}

fn validate_send(msg: &MsgSend) -> Result<(), String> {
    if msg.from_address.is_empty() || msg.to_address.is_empty() {
        return Err("send addresses must be non-empty".to_string());
    }
    if msg.amount.is_empty() {
        return Err("send amount must be non-empty".to_string());
    }
    for coin in &msg.amount {
        if !is_valid_denom(&coin.denom) {
            return Err(format!("invalid denom: {}", coin.denom));
        }
        if coin.amount == 0 {
            return Err(format!("send amount of {} must be positive", coin.denom));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub msgs: Vec<Msg>,
}

impl Tx {
    pub fn single(msg: Msg) -> Self {
        Self { msgs: vec![msg] }
    }
}

pub fn encode_tx(tx: &Tx) -> Result<Vec<u8>, ProcessError> {
    bincode::serialize(tx).map_err(|e| ProcessError::DecodingTxBytes(format!("encoding tx: {e}")))
}

pub fn decode_tx(bytes: &[u8]) -> Result<Tx, ProcessError> {
    bincode::deserialize(bytes).map_err(|e| ProcessError::DecodingTxBytes(e.to_string()))
}

// 8.2: designated transactions hold exactly one message of the expected kind.
fn decode_single_msg(bytes: &[u8], expected: &'static str) -> Result<Msg, ProcessError> {
    let tx = decode_tx(bytes)?;
    match <[Msg; 1]>::try_from(tx.msgs) {
        Ok([msg]) if msg.type_name() == expected => Ok(msg),
        Ok([msg]) => Err(ProcessError::UnexpectedMsgType(format!(
            "expected {expected}, got {}",
            msg.type_name()
        ))),
        Err(msgs) => Err(ProcessError::UnexpectedMsgType(format!(
            "expected exactly one {expected}, got {} msgs",
            msgs.len()
        ))),
    }
}

/// Decoded proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessProposalTxs {
    pub proposed_operations: MsgProposedOperations,
    pub add_premium_votes: MsgAddPremiumVotes,
    pub update_market_prices: MsgUpdateMarketPrices,
    pub other_txs: Vec<Vec<Msg>>,
}

impl ProcessProposalTxs {
    pub fn decode(txs: &[Vec<u8>]) -> Result<Self, ProcessError> {
        let num_txs = txs.len();
        if num_txs < MIN_TXS_IN_BLOCK {
            return Err(ProcessError::UnexpectedNumMsgs(format!(
                "Expected the proposal to contain at least {MIN_TXS_IN_BLOCK} txs, but got {num_txs}"
            )));
        }

        let proposed_operations = match decode_single_msg(&txs[0], "MsgProposedOperations")? {
            Msg::ProposedOperations(msg) => msg,
            other => return Err(unexpected(&other)),
        };
        let add_premium_votes = match decode_single_msg(&txs[num_txs - 2], "MsgAddPremiumVotes")? {
            Msg::AddPremiumVotes(msg) => msg,
            other => return Err(unexpected(&other)),
        };
        let update_market_prices = match decode_single_msg(&txs[num_txs - 1], "MsgUpdateMarketPrices")? {
            Msg::UpdateMarketPrices(msg) => msg,
            other => return Err(unexpected(&other)),
        };

        let mut other_txs = Vec::with_capacity(num_txs - MIN_TXS_IN_BLOCK);
        for bytes in &txs[1..num_txs - 2] {
            let tx = decode_tx(bytes)?;
            if let Some(msg) = tx.msgs.iter().find(|m| m.is_app_injected()) {
                return Err(ProcessError::UnexpectedMsgType(format!(
                    "Invalid msg type or content in OtherTxs {}",
                    msg.type_name()
                )));
            }
            other_txs.push(tx.msgs);
        }

        Ok(Self {
            proposed_operations,
            add_premium_votes,
            update_market_prices,
            other_txs,
        })
    }

    /// Premium votes, then prices, then every other message in order. the
    /// operations queue is validated when it is replayed.
    pub fn validate(&self) -> Result<(), ProcessError> {
        validate_premium_votes(&self.add_premium_votes.votes).map_err(ProcessError::MsgValidateBasic)?;
        validate_price_updates(&self.update_market_prices.market_price_updates)
            .map_err(ProcessError::MsgValidateBasic)?;
        for msgs in &self.other_txs {
            for msg in msgs {
                msg.validate_basic().map_err(ProcessError::MsgValidateBasic)?;
            }
        }
        Ok(())
    }
}

fn unexpected(msg: &Msg) -> ProcessError {
    ProcessError::UnexpectedMsgType(format!("unexpected {}", msg.type_name()))
}

/// Encodes a proposal in block order.
pub fn build_proposal(
    operations: Vec<OperationRaw>,
    premium_votes: Vec<FundingPremium>,
    price_updates: Vec<MarketPriceUpdate>,
    other_txs: &[Tx],
) -> Result<Vec<Vec<u8>>, ProcessError> {
    let mut txs = Vec::with_capacity(other_txs.len() + MIN_TXS_IN_BLOCK);
    txs.push(encode_tx(&Tx::single(Msg::ProposedOperations(MsgProposedOperations {
        operations_queue: operations,
    })))?);
    for tx in other_txs {
        txs.push(encode_tx(tx)?);
    }
    txs.push(encode_tx(&Tx::single(Msg::AddPremiumVotes(MsgAddPremiumVotes {
        votes: premium_votes,
    })))?);
    txs.push(encode_tx(&Tx::single(Msg::UpdateMarketPrices(MsgUpdateMarketPrices {
        market_price_updates: price_updates,
    })))?);
    Ok(txs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketId;

    fn votes(ids: &[u32]) -> Vec<FundingPremium> {
        ids.iter()
            .map(|id| FundingPremium {
                perpetual_id: PerpetualId(*id),
                premium_ppm: 10,
            })
            .collect()
    }

    fn prices(entries: &[(u32, u64)]) -> Vec<MarketPriceUpdate> {
        entries
            .iter()
            .map(|(id, price)| MarketPriceUpdate {
                market_id: MarketId(*id),
                price: *price,
            })
            .collect()
    }

    fn send(denom: &str, amount: u64) -> Tx {
        Tx::single(Msg::Send(MsgSend {
            from_address: "alice".to_string(),
            to_address: "bob".to_string(),
            amount: vec![Coin {
                denom: denom.to_string(),
                amount,
            }],
        }))
    }

    #[test]
    fn valid_proposal_round_trips() {
        let txs = build_proposal(vec![], votes(&[0, 1]), prices(&[(0, 5), (1, 7)]), &[send("usdc", 1)]).unwrap();
        assert_eq!(txs.len(), 4);
        let decoded = ProcessProposalTxs::decode(&txs).unwrap();
        assert_eq!(decoded.other_txs.len(), 1);
        decoded.validate().unwrap();
    }

    #[test]
    fn two_txs_is_too_few() {
        let txs = build_proposal(vec![], vec![], vec![], &[]).unwrap();
        let err = ProcessProposalTxs::decode(&txs[..2]).unwrap_err();
        assert_eq!(
            err,
            ProcessError::UnexpectedNumMsgs(
                "Expected the proposal to contain at least 3 txs, but got 2".to_string()
            )
        );
    }

    #[test]
    fn garbage_bytes_fail_decoding() {
        let mut txs = build_proposal(vec![], vec![], vec![], &[]).unwrap();
        txs[0] = vec![0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            ProcessProposalTxs::decode(&txs),
            Err(ProcessError::DecodingTxBytes(_))
        ));
    }

    #[test]
    fn designated_slots_check_msg_type() {
        let mut txs = build_proposal(vec![], vec![], vec![], &[]).unwrap();
        txs.swap(1, 2);
        assert!(matches!(
            ProcessProposalTxs::decode(&txs),
            Err(ProcessError::UnexpectedMsgType(_))
        ));
    }

    #[test]
    fn other_txs_reject_app_injected_msgs() {
        let injected = Tx::single(Msg::IsDelayedBlock);
        let txs = build_proposal(vec![], vec![], vec![], &[injected]).unwrap();
        let err = ProcessProposalTxs::decode(&txs).unwrap_err();
        assert!(err.to_string().contains("MsgIsDelayedBlock"));
    }

    #[test]
    fn validate_checks_votes_before_prices() {
        let txs = build_proposal(vec![], votes(&[1, 1]), prices(&[(0, 0)]), &[]).unwrap();
        let err = ProcessProposalTxs::decode(&txs).unwrap().validate().unwrap_err();
        assert!(matches!(err, ProcessError::MsgValidateBasic(ref m) if m.contains("premium votes")));
    }

    #[test]
    fn zero_price_rejected() {
        let txs = build_proposal(vec![], votes(&[0]), prices(&[(0, 0)]), &[]).unwrap();
        let err = ProcessProposalTxs::decode(&txs).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("price cannot be 0"));
    }

    #[test]
    fn other_tx_validation() {
        let txs = build_proposal(vec![], vec![], vec![], &[send("1usdc", 5)]).unwrap();
        let err = ProcessProposalTxs::decode(&txs).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("invalid denom"));

        let transfer = Tx::single(Msg::Transfer(MsgTransfer {
            sender: SubaccountId::new("alice", 0),
            recipient: SubaccountId::new("alice", 0),
            amount: 1,
        }));
        let txs = build_proposal(vec![], vec![], vec![], &[transfer]).unwrap();
        assert!(ProcessProposalTxs::decode(&txs).unwrap().validate().is_err());
    }
}
