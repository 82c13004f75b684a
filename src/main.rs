//! CLOB node simulation.
//!
//! Drives an in-process node through full blocks: local matching, proposal
//! building, replay, stateful orders, conditional triggers and liquidations.

use perps_clob::app::{App, AppError, BTC, USDC};
use perps_clob::proposal::{Msg, MsgCancelOrder, MsgPlaceOrder, Tx};
use perps_clob::registry::MarketPriceUpdate;
use perps_clob::subaccount::SubaccountLedger;
use perps_clob::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    println!("Perpetual CLOB Node Simulation");
    println!("BTC-USD, oracle $50,000, 20% initial margin\n");

    let scenarios: [(&str, fn() -> Result<(), AppError>); 4] = [
        ("Scenario 1: Matching and Replay", scenario_1_matching_and_replay),
        ("Scenario 2: Stateful Orders", scenario_2_stateful_orders),
        ("Scenario 3: Conditional Trigger", scenario_3_conditional_trigger),
        ("Scenario 4: Liquidation and Deleveraging", scenario_4_liquidation),
    ];
    for (name, scenario) in scenarios {
        println!("{name}\n");
        if let Err(err) = scenario() {
            println!("  failed: {err}\n");
        }
    }

    println!("All simulations completed.");
}

fn usd(quote_quantums: i64) -> Decimal {
    Decimal::new(quote_quantums, 6)
}

fn btc(base_quantums: i128) -> Decimal {
    Decimal::from_i128_with_scale(base_quantums, 8)
}

/// Subticks for a whole-dollar price on the BTC pair.
fn subticks(price: Decimal) -> u64 {
    (price * dec!(1_000_000)).trunc().to_u64().unwrap_or(0)
}

fn subaccount(owner: &str) -> SubaccountId {
    SubaccountId::new(owner, 0)
}

fn short_term(app: &App, owner: &str, client_id: u32, side: Side, quantums: i64, price: Decimal) -> Order {
    Order {
        order_id: OrderId::new(subaccount(owner), client_id, OrderFlags::ShortTerm, ClobPairId(0)),
        side,
        quantums: quantums.unsigned_abs(),
        subticks: subticks(price),
        good_til: GoodTil::Block(app.next_block().height + 5),
        time_in_force: TimeInForce::Unspecified,
        reduce_only: false,
        condition: None,
    }
}

fn long_term(app: &App, owner: &str, client_id: u32, side: Side, quantums: i64, price: Decimal) -> Order {
    Order {
        order_id: OrderId::new(subaccount(owner), client_id, OrderFlags::LongTerm, ClobPairId(0)),
        side,
        quantums: quantums.unsigned_abs(),
        subticks: subticks(price),
        good_til: GoodTil::BlockTime((app.block().unix_seconds() + 3_600) as u32),
        time_in_force: TimeInForce::Unspecified,
        reduce_only: false,
        condition: None,
    }
}

fn print_subaccount(app: &App, owner: &str) -> Result<(), AppError> {
    let sub = app.clob().subaccounts().get_subaccount(app.committed(), &subaccount(owner))?;
    println!(
        "    {owner}: quote ${}, position {} BTC",
        usd(sub.quote_balance),
        btc(sub.position_quantums(PerpetualId(0)))
    );
    Ok(())
}

fn commit(app: &mut App, prices: Vec<MarketPriceUpdate>, txs: &[Tx]) -> Result<DeliveredBlock, AppError> {
    let proposal = app.propose(prices, txs)?;
    let delivered = app.deliver_block(&proposal)?;
    println!(
        "  Block {} committed: {} filled order ids, {} indexer events",
        delivered.block.height,
        delivered.summary.order_ids_filled_in_last_block.len(),
        delivered.indexer_block.events.len()
    );
    Ok(delivered)
}

/// Local match, proposal, replay on committed state.
fn scenario_1_matching_and_replay() -> Result<(), AppError> {
    let mut app = App::with_btc_market(ClobConfig::default())?;
    app.fund_subaccount(subaccount("alice"), 50_000 * USDC, 0)?;
    app.fund_subaccount(subaccount("bob"), 50_000 * USDC, 0)?;

    app.place_short_term_order(short_term(&app, "bob", 0, Side::Sell, BTC, dec!(50000)))?;
    println!("  Bob rests SELL 1 BTC @ $50,000");
    let result = app.place_short_term_order(short_term(&app, "alice", 0, Side::Buy, BTC / 2, dec!(50000)))?;
    println!(
        "  Alice buys 0.5 BTC: filled {} BTC, taker fee ${}",
        btc(result.filled_quantums as i128),
        usd(result.matches.iter().map(|m| m.taker_fee).sum())
    );

    let (bid, ask) = app.clob().best_bid_ask(ClobPairId(0))?;
    println!("  Book after match: bid {bid:?}, ask {ask:?}");

    commit(&mut app, Vec::new(), &[])?;
    print_subaccount(&app, "alice")?;
    print_subaccount(&app, "bob")?;
    println!();
    Ok(())
}

/// Long-term orders arrive as transactions and reach the book after commit.
fn scenario_2_stateful_orders() -> Result<(), AppError> {
    let mut app = App::with_btc_market(ClobConfig::default())?;
    app.fund_subaccount(subaccount("carol"), 100_000 * USDC, 0)?;

    let order = long_term(&app, "carol", 7, Side::Buy, BTC, dec!(49500));
    let place = Tx::single(Msg::PlaceOrder(MsgPlaceOrder { order: order.clone() }));
    let delivered = commit(&mut app, Vec::new(), &[place])?;
    println!("  Placed stateful order: {:?}", delivered.summary.placed_stateful_order_ids);
    println!(
        "  Resting on local book: {:?}",
        app.clob().resting_quantums(&order.order_id)?
    );

    let cancel = Tx::single(Msg::CancelOrder(MsgCancelOrder {
        order_id: order.order_id.clone(),
        good_til: order.good_til,
    }));
    commit(&mut app, Vec::new(), &[cancel])?;
    println!(
        "  After cancel, resting: {:?}\n",
        app.clob().resting_quantums(&order.order_id)?
    );
    Ok(())
}

/// A take-profit buy triggers once the oracle drops below its trigger.
fn scenario_3_conditional_trigger() -> Result<(), AppError> {
    let mut app = App::with_btc_market(ClobConfig::default())?;
    app.fund_subaccount(subaccount("dan"), 100_000 * USDC, 0)?;

    let mut order = long_term(&app, "dan", 1, Side::Buy, BTC / 10, dec!(48000));
    order.order_id.order_flags = OrderFlags::Conditional;
    order.condition = Some(OrderCondition {
        condition_type: ConditionType::TakeProfit,
        trigger_subticks: subticks(dec!(48000)),
    });
    let place = Tx::single(Msg::PlaceOrder(MsgPlaceOrder { order: order.clone() }));
    commit(&mut app, Vec::new(), &[place])?;
    println!("  Conditional placed, resting: {:?}", app.clob().resting_quantums(&order.order_id)?);

    let drop = MarketPriceUpdate {
        market_id: MarketId(0),
        price: 4_700_000_000,
    };
    let delivered = commit(&mut app, vec![drop], &[])?;
    println!(
        "  Oracle to $47,000, triggered: {:?}",
        delivered.summary.conditional_order_ids_triggered_in_last_block
    );
    println!("  Resting now: {:?}\n", app.clob().resting_quantums(&order.order_id)?);
    Ok(())
}

/// Carl is short 1 BTC with too little collateral. the book absorbs a quarter,
/// the rest is deleveraged against Dave.
fn scenario_4_liquidation() -> Result<(), AppError> {
    let mut app = App::with_btc_market(ClobConfig::default())?;
    app.fund_subaccount(subaccount("carl"), 50_499 * USDC, -BTC)?;
    app.fund_subaccount(subaccount("dave"), 50_000 * USDC, BTC)?;
    app.fund_subaccount(subaccount("erin"), 100_000 * USDC, 0)?;

    app.place_short_term_order(short_term(&app, "erin", 0, Side::Sell, BTC / 4, dec!(50000)))?;
    println!("  Erin offers 0.25 BTC @ $50,000");
    println!(
        "  Liquidatable: {:?}",
        app.clob().get_liquidatable_subaccount_ids(app.check_state())?
    );

    for result in app.liquidate_all()? {
        println!(
            "  Liquidated {} BTC, deleveraged {} BTC, insurance fund delta ${}",
            btc(result.liquidated_quantums as i128),
            btc(result.deleveraged_quantums as i128),
            usd(result.insurance_fund_delta as i64)
        );
    }

    commit(&mut app, Vec::new(), &[])?;
    for owner in ["carl", "dave", "erin"] {
        print_subaccount(&app, owner)?;
    }
    println!();
    Ok(())
}
