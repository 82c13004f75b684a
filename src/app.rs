//! In-process node.
//!
//! Wires the store-backed collaborators to a [`ClobKeeper`] and drives blocks the
//! way a validator would: local orders go to check state, a proposal is built
//! from the operations queue, and delivering a block replays it against a copy of
//! committed state that replaces the original only if the whole block succeeds.

use crate::bank::{BankError, ModuleAccount, ModuleBank};
use crate::clob_pair::ClobPair;
use crate::config::ClobConfig;
use crate::engine::{ClobError, ClobKeeper, LiquidationResult, PlaceOrderResult, ProcessProposerMatchesEvents};
use crate::indexer::{IndexerBlock, IndexerError, IndexerEventCollector, MarketPriceUpdateEventV1, PendingEvents, SUBTYPE_MARKET};
use crate::margin::LiquidityTier;
use crate::order::{GoodTil, Order, OrderId};
use crate::proposal::{build_proposal, Msg, MsgCancelOrder, MsgPlaceOrder, MsgTransfer, ProcessError, ProcessProposalTxs, Tx};
use crate::registry::{MarketPrice, MarketPriceUpdate, Perpetual, PerpetualsKeeper, PerpetualsRegistry, RegistryError};
use crate::store::{CacheStore, KvStore, MemStore};
use crate::subaccount::{Subaccount, SubaccountError, SubaccountLedger, SubaccountUpdate, SubaccountsKeeper, UpdateKind};
use crate::types::{BlockContext, ClobPairId, LiquidityTierId, MarketId, PerpetualId, SubaccountId};
use std::sync::Arc;
use tracing::{info, warn};

/// Quote quantums per USDC.
pub const USDC: i64 = 1_000_000;
/// Base quantums per BTC.
pub const BTC: i64 = 100_000_000;
/// Unix time of height 1.
pub const GENESIS_TIME: i64 = 1_700_000_000;
/// $50,000 at exponent -5.
pub const BTC_ORACLE_PRICE: u64 = 5_000_000_000;
pub const INSURANCE_FUND_SEED: u64 = 1_000_000 * USDC as u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    #[error("{0} cannot be delivered in a transaction")]
    UnsupportedMsg(&'static str),

    #[error(transparent)]
    Clob(#[from] ClobError),

    #[error(transparent)]
    Proposal(#[from] ProcessError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Subaccount(#[from] SubaccountError),

    #[error(transparent)]
    Bank(#[from] BankError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),
}

/// What a committed block did.
#[derive(Debug, Clone)]
pub struct DeliveredBlock {
    pub block: BlockContext,
    pub summary: ProcessProposerMatchesEvents,
    pub indexer_block: IndexerBlock,
    /// One entry per user transaction. a failed transaction leaves no writes.
    pub tx_results: Vec<Result<(), AppError>>,
}

pub struct App {
    committed: MemStore,
    check_state: MemStore,
    block: BlockContext,
    perpetuals: Arc<PerpetualsKeeper>,
    subaccounts: Arc<SubaccountsKeeper>,
    bank: Arc<ModuleBank>,
    indexer: Arc<IndexerEventCollector>,
    clob: ClobKeeper,
}

impl App {
    pub fn new(config: ClobConfig) -> Result<Self, AppError> {
        let perpetuals = Arc::new(PerpetualsKeeper::new());
        let subaccounts = Arc::new(SubaccountsKeeper::new(perpetuals.clone()));
        let bank = Arc::new(ModuleBank::new());
        let indexer = Arc::new(IndexerEventCollector::new(config.indexer_enabled));
        let clob = ClobKeeper::new(
            config,
            subaccounts.clone(),
            perpetuals.clone(),
            bank.clone(),
            indexer.clone(),
        )?;
        Ok(Self {
            committed: MemStore::new(),
            check_state: MemStore::new(),
            block: BlockContext::at(1, GENESIS_TIME),
            perpetuals,
            subaccounts,
            bank,
            indexer,
            clob,
        })
    }

    /// BTC-USD market with an order book and a seeded insurance fund.
    pub fn with_btc_market(config: ClobConfig) -> Result<Self, AppError> {
        let mut app = Self::new(config)?;
        app.create_btc_market()?;
        app.bank
            .mint(&mut app.committed, ModuleAccount::InsuranceFund, INSURANCE_FUND_SEED)?;
        app.check_state = app.committed.clone();
        Ok(app)
    }

    pub fn create_btc_market(&mut self) -> Result<ClobPair, AppError> {
        let pair = self.create_btc_market_without_book()?;
        self.clob.init_memclob_orderbooks(&self.committed)?;
        Ok(pair)
    }

    /// Persists market, tier, perpetual and pair without touching the local books.
    pub fn create_btc_market_without_book(&mut self) -> Result<ClobPair, AppError> {
        let store = &mut self.committed;
        self.perpetuals.create_market(
            store,
            MarketPrice {
                id: MarketId(0),
                exponent: -5,
                price: BTC_ORACLE_PRICE,
            },
        )?;
        self.perpetuals
            .create_liquidity_tier(store, LiquidityTier::twenty_percent_initial(LiquidityTierId(0)))?;
        self.perpetuals.create_perpetual(
            store,
            Perpetual {
                id: PerpetualId(0),
                ticker: "BTC-USD".to_string(),
                market_id: MarketId(0),
                atomic_resolution: -8,
                default_funding_ppm: 0,
                liquidity_tier: LiquidityTierId(0),
                funding_index: 0,
            },
        )?;
        let mut events = PendingEvents::new();
        let pair = self
            .clob
            .create_perpetual_clob_pair(
                store,
                &mut events,
                ClobPair::btc_usd(ClobPairId(0)).with_fees(self.clob.config().fees),
            )?;
        self.clob.emit_events(events);
        self.check_state = self.committed.clone();
        Ok(pair)
    }

    /// Sets a subaccount outright in committed and check state and backs its
    /// quote with the subaccounts module account.
    pub fn fund_subaccount(&mut self, id: SubaccountId, quote: i64, btc_quantums: i64) -> Result<(), AppError> {
        let mut subaccount = Subaccount::with_quote(id, quote);
        if btc_quantums != 0 {
            subaccount.set_position(PerpetualId(0), btc_quantums, 0);
        }
        for store in [&mut self.committed, &mut self.check_state] {
            self.subaccounts.set_subaccount(store, &subaccount)?;
            if quote > 0 {
                self.bank.mint(store, ModuleAccount::Subaccounts, quote.unsigned_abs())?;
            }
        }
        Ok(())
    }

    pub fn committed(&self) -> &MemStore {
        &self.committed
    }

    pub fn check_state(&self) -> &MemStore {
        &self.check_state
    }

    pub fn clob(&self) -> &ClobKeeper {
        &self.clob
    }

    pub fn into_clob(self) -> ClobKeeper {
        self.clob
    }

    pub fn perpetuals(&self) -> &PerpetualsKeeper {
        &self.perpetuals
    }

    pub fn bank(&self) -> &ModuleBank {
        &self.bank
    }

    pub fn indexer(&self) -> &IndexerEventCollector {
        &self.indexer
    }

    /// Last committed block.
    pub fn block(&self) -> BlockContext {
        self.block
    }

    /// One block and one second after the last commit.
    pub fn next_block(&self) -> BlockContext {
        BlockContext::at(self.block.height + 1, self.block.unix_seconds() + 1)
    }

    pub fn place_short_term_order(&mut self, order: Order) -> Result<PlaceOrderResult, ClobError> {
        let block = self.next_block();
        self.clob.place_short_term_order(&mut self.check_state, &block, order)
    }

    pub fn cancel_short_term_order(&self, order_id: &OrderId) -> Result<(), ClobError> {
        self.clob.cancel_short_term_order(order_id)
    }

    pub fn liquidate_subaccount(&mut self, subaccount_id: &SubaccountId) -> Result<LiquidationResult, ClobError> {
        self.clob.liquidate_subaccount(&mut self.check_state, subaccount_id)
    }

    /// Liquidates every liquidatable subaccount once. failures are logged and skipped.
    pub fn liquidate_all(&mut self) -> Result<Vec<LiquidationResult>, ClobError> {
        let ids = self.clob.get_liquidatable_subaccount_ids(&self.check_state)?;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.clob.liquidate_subaccount(&mut self.check_state, &id) {
                Ok(result) => results.push(result),
                Err(err) => warn!(subaccount_id = %id, error = %err, "liquidation skipped"),
            }
        }
        Ok(results)
    }

    /// Proposal bytes for the next block from the current operations queue.
    pub fn propose(&self, price_updates: Vec<MarketPriceUpdate>, other_txs: &[Tx]) -> Result<Vec<Vec<u8>>, AppError> {
        let operations = self.clob.take_operations_to_propose()?;
        Ok(build_proposal(operations, Vec::new(), price_updates, other_txs)?)
    }

    // decode, replay, user txs, prices, end block, commit. events are buffered
    // per tx and reach the indexer only with the committed block.
    pub fn deliver_block(&mut self, txs: &[Vec<u8>]) -> Result<DeliveredBlock, AppError> {
        let block = self.next_block();
        let proposal = ProcessProposalTxs::decode(txs)?;
        proposal.validate()?;
        let price_updates = &proposal.update_market_prices.market_price_updates;
        for update in price_updates {
            self.perpetuals.get_market_price(&self.committed, update.market_id)?;
        }

        let mut store = self.committed.clone();
        let mut block_events = PendingEvents::new();
        self.clob.begin_block(&mut store, &block);
        self.clob.process_proposer_operations(
            &mut store,
            &mut block_events,
            &block,
            &proposal.proposed_operations.operations_queue,
        )?;

        let mut tx_results = Vec::with_capacity(proposal.other_txs.len());
        for (i, msgs) in proposal.other_txs.iter().enumerate() {
            let tx_index = i as u32 + 1;
            let mut tx_store = CacheStore::new(&mut store);
            let mut tx_events = PendingEvents::new();
            let result = msgs
                .iter()
                .try_for_each(|msg| self.deliver_msg(&mut tx_store, &mut tx_events, &block, tx_index, msg));
            match &result {
                Ok(()) => {
                    tx_store.commit();
                    block_events.append(tx_events);
                }
                Err(err) => warn!(height = block.height, tx_index, error = %err, "tx failed"),
            }
            tx_results.push(result);
        }

        let prices_tx_index = proposal.other_txs.len() as u32 + 2;
        self.perpetuals.update_market_prices(&mut store, price_updates)?;
        for update in price_updates {
            block_events.add_txn(
                prices_tx_index,
                SUBTYPE_MARKET,
                &MarketPriceUpdateEventV1 {
                    market_id: update.market_id,
                    price: update.price,
                },
            )?;
        }

        let summary = self.clob.end_block(&mut store, &mut block_events, &block)?;

        self.clob.emit_events(block_events);
        self.committed = store;
        self.block = block;
        self.check_state = self.committed.clone();
        let indexer_block = self.indexer.produce_block(block.height, block.time);
        let next = self.next_block();
        self.clob.prepare_check_state(&mut self.check_state, &next)?;
        info!(
            height = block.height,
            txs = txs.len(),
            events = indexer_block.events.len(),
            "committed block"
        );
        Ok(DeliveredBlock {
            block,
            summary,
            indexer_block,
            tx_results,
        })
    }

    fn deliver_msg(
        &self,
        store: &mut dyn KvStore,
        events: &mut PendingEvents,
        block: &BlockContext,
        tx_index: u32,
        msg: &Msg,
    ) -> Result<(), AppError> {
        match msg {
            Msg::PlaceOrder(MsgPlaceOrder { order }) if order.is_stateful() => {
                self.clob.place_stateful_order(store, events, block, tx_index, order)?;
            }
            Msg::CancelOrder(MsgCancelOrder {
                order_id,
                good_til: GoodTil::BlockTime(good_til_block_time),
            }) if order_id.is_stateful() => {
                self.clob
                    .cancel_stateful_order(store, events, block, tx_index, order_id, *good_til_block_time)?;
            }
            Msg::Transfer(MsgTransfer {
                sender,
                recipient,
                amount,
            }) => {
                let amount = i128::from(*amount);
                self.subaccounts.update_subaccounts(
                    store,
                    &[
                        SubaccountUpdate::quote_only(sender.clone(), -amount),
                        SubaccountUpdate::quote_only(recipient.clone(), amount),
                    ],
                    UpdateKind::Transfer,
                )?;
            }
            other => return Err(AppError::UnsupportedMsg(other.type_name())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> SubaccountId {
        SubaccountId::new("alice", 0)
    }

    #[test]
    fn empty_block_commits() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        let txs = app.propose(Vec::new(), &[]).unwrap();
        let delivered = app.deliver_block(&txs).unwrap();
        assert_eq!(delivered.block.height, 2);
        assert_eq!(app.block().height, 2);
        assert_eq!(delivered.summary.block_height, 2);
    }

    #[test]
    fn price_update_reaches_state_and_indexer() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        let update = MarketPriceUpdate {
            market_id: MarketId(0),
            price: 5_100_000_000,
        };
        let txs = app.propose(vec![update], &[]).unwrap();
        let delivered = app.deliver_block(&txs).unwrap();
        let market = app.perpetuals().get_market_price(app.committed(), MarketId(0)).unwrap();
        assert_eq!(market.price, 5_100_000_000);
        assert!(delivered.indexer_block.events.iter().any(|e| e.subtype == SUBTYPE_MARKET));
    }

    #[test]
    fn unknown_market_rejects_block() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        let update = MarketPriceUpdate {
            market_id: MarketId(7),
            price: 1,
        };
        let txs = app.propose(vec![update], &[]).unwrap();
        assert!(matches!(app.deliver_block(&txs), Err(AppError::Registry(_))));
        assert_eq!(app.block().height, 1);
    }

    #[test]
    fn transfer_moves_quote_and_failed_tx_is_isolated() {
        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        app.fund_subaccount(alice(), 100 * USDC, 0).unwrap();
        let bob = SubaccountId::new("bob", 0);
        let transfer = |amount: u64| {
            Tx::single(Msg::Transfer(MsgTransfer {
                sender: alice(),
                recipient: bob.clone(),
                amount: amount * USDC as u64,
            }))
        };
        let txs = app.propose(Vec::new(), &[transfer(40), transfer(500)]).unwrap();
        let delivered = app.deliver_block(&txs).unwrap();
        assert!(delivered.tx_results[0].is_ok());
        assert!(delivered.tx_results[1].is_err());

        let ledger = app.clob().subaccounts();
        assert_eq!(ledger.get_subaccount(app.committed(), &alice()).unwrap().quote_balance, 60 * USDC);
        assert_eq!(ledger.get_subaccount(app.committed(), &bob).unwrap().quote_balance, 40 * USDC);
    }

    #[test]
    fn failed_tx_leaves_no_events() {
        use crate::indexer::SUBTYPE_STATEFUL_ORDER;
        use crate::order::{OrderFlags, TimeInForce};
        use crate::types::Side;

        let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
        app.fund_subaccount(alice(), 100 * USDC, 0).unwrap();
        let order = Order {
            order_id: OrderId::new(alice(), 7, OrderFlags::LongTerm, ClobPairId(0)),
            side: Side::Buy,
            quantums: 10,
            subticks: 50_000_000_000,
            good_til: GoodTil::BlockTime((GENESIS_TIME + 600) as u32),
            time_in_force: TimeInForce::Unspecified,
            reduce_only: false,
            condition: None,
        };
        let tx = Tx {
            msgs: vec![
                Msg::PlaceOrder(MsgPlaceOrder { order: order.clone() }),
                Msg::Transfer(MsgTransfer {
                    sender: alice(),
                    recipient: SubaccountId::new("bob", 0),
                    amount: 1_000_000 * USDC as u64,
                }),
            ],
        };
        let txs = app.propose(Vec::new(), &[tx]).unwrap();
        let delivered = app.deliver_block(&txs).unwrap();

        assert!(delivered.tx_results[0].is_err());
        assert_eq!(app.clob().get_stateful_order_placement(app.committed(), &order.order_id).unwrap(), None);
        assert!(delivered.indexer_block.events.iter().all(|e| e.subtype != SUBTYPE_STATEFUL_ORDER));
    }
}
