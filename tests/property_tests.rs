//! Property-based tests for the clob math and the matching engine.
//!
//! These tests check invariants under random inputs.

use perps_clob::app::{App, BTC, USDC};
use perps_clob::bank::{BankKeeper, ModuleAccount};
use perps_clob::indexer::{EventOrdering, SUBTYPE_STATEFUL_ORDER};
use perps_clob::liquidation::{bankruptcy_quote_quantums, fillable_price_subticks, insurance_fund_delta, FillablePriceConfig, PositionRisk};
use perps_clob::matching::fee_for_quote;
use perps_clob::proposal::{Msg, MsgPlaceOrder, MsgTransfer, Tx};
use perps_clob::subaccount::SubaccountLedger;
use perps_clob::*;
use proptest::prelude::*;

const TICK_DOLLARS: u64 = 1_000_000;

// Strategies for generating test data
fn quote_strategy() -> impl Strategy<Value = u64> {
    1u64..1_000_000_000_000u64 // up to $1M
}

fn fee_ppm_strategy() -> impl Strategy<Value = i32> {
    -1_000i32..=10_000i32
}

/// Whole-dollar prices around $50,000 in subticks.
fn subticks_strategy() -> impl Strategy<Value = u64> {
    (49_900u64..=50_100u64).prop_map(|dollars| dollars * TICK_DOLLARS)
}

/// Multiples of the pair's step, up to 0.05 BTC.
fn quantums_strategy() -> impl Strategy<Value = u64> {
    (1u64..=1_000_000u64).prop_map(|steps| steps * 5)
}

#[derive(Debug, Clone)]
struct RandomOrder {
    trader: usize,
    side: Side,
    quantums: u64,
    subticks: u64,
}

fn order_strategy() -> impl Strategy<Value = RandomOrder> {
    (0usize..4, any::<bool>(), quantums_strategy(), subticks_strategy()).prop_map(|(trader, is_buy, quantums, subticks)| {
        RandomOrder {
            trader,
            side: Side::from_is_buy(is_buy),
            quantums,
            subticks,
        }
    })
}

const TRADERS: [&str; 4] = ["alice", "bob", "carol", "dave"];

fn funded_app() -> App {
    let mut app = App::with_btc_market(ClobConfig::default()).unwrap();
    for trader in TRADERS {
        app.fund_subaccount(SubaccountId::new(trader, 0), 1_000_000 * USDC, 0).unwrap();
    }
    app
}

fn place(app: &mut App, client_id: u32, order: &RandomOrder) -> Result<PlaceOrderResult, ClobError> {
    let good_til_block = app.next_block().height + 5;
    app.place_short_term_order(Order {
        order_id: OrderId::new(
            SubaccountId::new(TRADERS[order.trader], 0),
            client_id,
            OrderFlags::ShortTerm,
            ClobPairId(0),
        ),
        side: order.side,
        quantums: order.quantums,
        subticks: order.subticks,
        good_til: GoodTil::Block(good_til_block),
        time_in_force: TimeInForce::Unspecified,
        reduce_only: false,
        condition: None,
    })
}

fn subaccounts(app: &App, store: &MemStore) -> Vec<perps_clob::subaccount::Subaccount> {
    app.clob().subaccounts().get_all_subaccounts(store).unwrap()
}

proptest! {
    /// Fees round half away from zero: never more than half a quantum off.
    #[test]
    fn fee_rounding_is_within_half_quantum(
        quote in quote_strategy(),
        ppm in fee_ppm_strategy(),
    ) {
        let fee = fee_for_quote(quote, ppm).unwrap() as i128;
        let exact_times_million = quote as i128 * ppm as i128;
        let error = (fee * 1_000_000 - exact_times_million).abs();
        prop_assert!(error <= 500_000, "fee {} off by {} / 1e6", fee, error);
        prop_assert_eq!(fee.signum() * ppm.signum() as i128 >= 0, true);
    }

    /// Ceil and floor division bracket the exact quotient.
    #[test]
    fn div_ceil_and_floor_bracket(
        numerator in -1_000_000_000i128..1_000_000_000i128,
        denominator in 1i128..1_000_000i128,
    ) {
        let floor = div_floor(numerator, denominator);
        let ceil = div_ceil(numerator, denominator);
        prop_assert!(floor * denominator <= numerator);
        prop_assert!(ceil * denominator >= numerator);
        prop_assert!(ceil - floor <= 1);
    }

    /// The fund never collects more than the capped liquidation fee.
    #[test]
    fn insurance_delta_respects_cap(
        fill_quote in 1u64..1_000_000_000_000u64,
        surplus in -1_000_000_000i128..1_000_000_000i128,
        max_fee_ppm in 1u32..=1_000_000u32,
    ) {
        let liquidated_quote = -(fill_quote as i128);
        let bankruptcy = liquidated_quote - surplus;
        let delta = insurance_fund_delta(liquidated_quote, bankruptcy, fill_quote, max_fee_ppm);
        let cap = fill_quote as i128 * max_fee_ppm as i128 / 1_000_000;
        prop_assert!(delta <= cap);
        if surplus <= 0 {
            prop_assert_eq!(delta, surplus);
        } else {
            prop_assert_eq!(delta, surplus.min(cap));
        }
    }

    /// Closing a whole position at the bankruptcy price leaves zero collateral.
    #[test]
    fn bankruptcy_closes_at_zero_collateral(
        collateral_dollars in -10_000i128..10_000i128,
        position_btc_tenths in 1i128..=20i128,
        is_short in any::<bool>(),
    ) {
        let quantums = position_btc_tenths * 10_000_000 * if is_short { -1 } else { 1 };
        // $50,000 per BTC: 500 quote quantums per base quantum
        let notional = quantums * 500;
        let mmr = notional.abs() / 10;
        let tnc = collateral_dollars * USDC as i128;
        let bankruptcy = bankruptcy_quote_quantums(tnc, mmr, -notional, mmr);
        // what is left after giving up the position for `bankruptcy`
        prop_assert_eq!(tnc - notional + bankruptcy, 0);
    }

    /// A short's fillable price is at or above the oracle price and only grows as collateral shrinks.
    #[test]
    fn fillable_price_moves_against_the_liquidated(
        collateral_a in 0i128..5_000i128,
        collateral_b in 0i128..5_000i128,
    ) {
        let pair = ClobPair::btc_usd(ClobPairId(0));
        let risk = |collateral: i128| PositionRisk {
            total_net_collateral: collateral * USDC as i128,
            total_maintenance_margin: 5_000 * USDC as i128,
            position_net_notional: -50_000 * USDC as i128,
            position_maintenance_margin: 5_000 * USDC as i128,
            position_quantums: -(BTC as i128),
        };
        let config = FillablePriceConfig::default();
        let price_a = fillable_price_subticks(&config, &risk(collateral_a), &pair).unwrap();
        let price_b = fillable_price_subticks(&config, &risk(collateral_b), &pair).unwrap();
        prop_assert!(price_a >= 50_000 * TICK_DOLLARS);
        prop_assert_eq!(price_a % pair.subticks_per_tick as u64, 0);
        if collateral_a < collateral_b {
            prop_assert!(price_a >= price_b);
        }
    }

    /// Pair validation accepts exactly the step-aligned minimum sizes.
    #[test]
    fn clob_pair_min_order_must_align_to_step(
        step in 1u64..1_000u64,
        min_order in 1u64..10_000u64,
    ) {
        let mut pair = ClobPair::btc_usd(ClobPairId(0));
        pair.step_base_quantums = step;
        pair.min_order_base_quantums = min_order;
        let result = pair.validate(ClobConfig::default().max_fee_ppm);
        prop_assert_eq!(result.is_ok(), min_order % step == 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever arrives, the book never stays crossed and fills never exceed an order.
    #[test]
    fn book_never_crossed(
        orders in proptest::collection::vec(order_strategy(), 1..30),
    ) {
        let mut app = funded_app();
        for (i, order) in orders.iter().enumerate() {
            if let Ok(result) = place(&mut app, i as u32, order) {
                prop_assert!(result.filled_quantums <= order.quantums);
            }
            if let (Some(bid), Some(ask)) = app.clob().best_bid_ask(ClobPairId(0)).unwrap() {
                prop_assert!(bid < ask, "crossed book: bid {} ask {}", bid, ask);
            }
        }
    }

    /// Matching moves quote between subaccounts and the fee collector, never creates it.
    #[test]
    fn matching_conserves_quote_and_open_interest(
        orders in proptest::collection::vec(order_strategy(), 1..30),
    ) {
        let mut app = funded_app();
        let before = app.bank().balance(app.check_state(), ModuleAccount::Subaccounts).unwrap();
        for (i, order) in orders.iter().enumerate() {
            let _ = place(&mut app, i as u32, order);
        }
        let store = app.check_state();
        let accounts = subaccounts(&app, store);
        let quote: i64 = accounts.iter().map(|s| s.quote_balance).sum();
        let open_interest: i128 = accounts.iter().map(|s| s.position_quantums(PerpetualId(0))).sum();
        let in_module = app.bank().balance(store, ModuleAccount::Subaccounts).unwrap();
        let fees = app.bank().balance(store, ModuleAccount::FeeCollector).unwrap();
        prop_assert_eq!(quote as u64, in_module);
        prop_assert_eq!(in_module + fees, before);
        prop_assert_eq!(open_interest, 0);
    }

    /// Replaying the proposed operations lands committed state where local matching left check state.
    #[test]
    fn replay_matches_local_matching(
        orders in proptest::collection::vec(order_strategy(), 1..20),
    ) {
        let mut app = funded_app();
        for (i, order) in orders.iter().enumerate() {
            let _ = place(&mut app, i as u32, order);
        }
        let local = subaccounts(&app, app.check_state());
        let proposal = app.propose(Vec::new(), &[]).unwrap();
        app.deliver_block(&proposal).unwrap();
        prop_assert_eq!(subaccounts(&app, app.committed()), local);
    }
}

/// A long-term bid from `trader`, optionally followed in the same tx by a
/// transfer far beyond its collateral.
fn placement_tx(app: &App, trader: usize, client_id: u32, doomed: bool) -> Tx {
    let owner = SubaccountId::new(TRADERS[trader], 0);
    let order = Order {
        order_id: OrderId::new(owner.clone(), client_id, OrderFlags::LongTerm, ClobPairId(0)),
        side: Side::Buy,
        quantums: 5,
        subticks: 40_000 * TICK_DOLLARS,
        good_til: GoodTil::BlockTime((app.block().unix_seconds() + 600) as u32),
        time_in_force: TimeInForce::Unspecified,
        reduce_only: false,
        condition: None,
    };
    let mut msgs = vec![Msg::PlaceOrder(MsgPlaceOrder { order })];
    if doomed {
        msgs.push(Msg::Transfer(MsgTransfer {
            sender: owner,
            recipient: SubaccountId::new("nobody", 0),
            amount: 10_000_000 * USDC as u64,
        }));
    }
    Tx { msgs }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Indexer events come only from transactions whose writes were committed.
    #[test]
    fn failed_txs_emit_no_events(
        txs in proptest::collection::vec((0usize..4, any::<bool>()), 1..8),
    ) {
        let mut app = funded_app();
        let built: Vec<Tx> = txs
            .iter()
            .enumerate()
            .map(|(i, (trader, doomed))| placement_tx(&app, *trader, i as u32, *doomed))
            .collect();
        let proposal = app.propose(Vec::new(), &built).unwrap();
        let delivered = app.deliver_block(&proposal).unwrap();

        let mut emitted: Vec<u32> = delivered
            .indexer_block
            .events
            .iter()
            .filter(|e| e.subtype == SUBTYPE_STATEFUL_ORDER)
            .filter_map(|e| match e.ordering {
                EventOrdering::Transaction(tx_index) => Some(tx_index),
                EventOrdering::Block(_) => None,
            })
            .collect();
        emitted.sort_unstable();
        let committed: Vec<u32> = txs
            .iter()
            .enumerate()
            .filter(|(_, (_, doomed))| !doomed)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        prop_assert_eq!(emitted, committed);
        for (result, (_, doomed)) in delivered.tx_results.iter().zip(&txs) {
            prop_assert_eq!(result.is_err(), *doomed);
        }
        let placements = app.clob().get_all_stateful_orders(app.committed()).unwrap();
        prop_assert_eq!(placements.len(), txs.iter().filter(|(_, doomed)| !doomed).count());
    }
}

proptest! {
    /// A fill state is pruned at its prunable height and no other.
    #[test]
    fn pruning_removes_only_expired_fill_states(
        heights in proptest::collection::vec(2u32..20u32, 1..12),
        prune_at in 2u32..20u32,
    ) {
        let app = App::with_btc_market(ClobConfig::default()).unwrap();
        let clob = app.clob();
        let mut store = app.committed().clone();
        let ids: Vec<OrderId> = heights
            .iter()
            .enumerate()
            .map(|(i, _)| OrderId::new(SubaccountId::new("alice", 0), i as u32, OrderFlags::ShortTerm, ClobPairId(0)))
            .collect();
        for (order_id, height) in ids.iter().zip(&heights) {
            clob.set_order_fill_amount(&mut store, order_id, 10, *height).unwrap();
            clob.add_orders_for_pruning(&mut store, std::slice::from_ref(order_id), *height).unwrap();
        }

        let pruned = clob.prune_orders_for_block_height(&mut store, prune_at).unwrap();
        for (order_id, height) in ids.iter().zip(&heights) {
            let (exists, _, _) = clob.get_order_fill_amount(&store, order_id).unwrap();
            prop_assert_eq!(exists, *height != prune_at);
            prop_assert_eq!(pruned.contains(order_id), *height == prune_at);
        }
        prop_assert!(clob.get_prunable_orders(&store, prune_at).unwrap().order_ids.is_empty());
    }
}
