// 1.0: primitive ids and integer units shared by every module.
// sizes are base quantums (u64), prices are subticks (u64), balances are quote quantums.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One million. fees and margin fractions are expressed in parts per million.
pub const ONE_MILLION: u32 = 1_000_000;

/// Quote asset (USDC) atomic resolution: 1 quote quantum = 10^-6 USDC.
pub const QUOTE_ATOMIC_RESOLUTION: i32 = -6;

// 1.1: subaccount. owner address plus a sub-number so one owner can isolate margin.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubaccountId {
    pub owner: String,
    pub number: u32,
}

impl SubaccountId {
    pub fn new(owner: impl Into<String>, number: u32) -> Self {
        Self {
            owner: owner.into(),
            number,
        }
    }
}

impl fmt::Display for SubaccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClobPairId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PerpetualId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LiquidityTierId(pub u32);

impl fmt::Display for ClobPairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PerpetualId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.2: order side. buy takes asks, sell takes bids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buy, -1 for sell. position deltas are `sign * quantums`.
    pub fn sign(&self) -> i128 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }

    pub fn from_is_buy(is_buy: bool) -> Self {
        if is_buy {
            Side::Buy
        } else {
            Side::Sell
        }
    }
}

// 1.3: block height + time. the only clock the consensus path is allowed to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub height: u32,
    pub time: DateTime<Utc>,
}

impl BlockContext {
    pub fn new(height: u32, time: DateTime<Utc>) -> Self {
        Self { height, time }
    }

    /// Convenience for tests and the simulator.
    pub fn at(height: u32, unix_seconds: i64) -> Self {
        let time = Utc
            .timestamp_opt(unix_seconds, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self { height, time }
    }

    pub fn unix_seconds(&self) -> i64 {
        self.time.timestamp()
    }
}

// 1.4: ppm math. fees round half away from zero, margin rounds up.

/// `round_half_away_from_zero(value * ppm / 1_000_000)`.
pub fn mul_ppm_round_half_away(value: i128, ppm: i32) -> Option<i128> {
    let value = Decimal::try_from_i128_with_scale(value, 0).ok()?;
    let scaled = value.checked_mul(Decimal::from(ppm))? / Decimal::from(ONE_MILLION);
    scaled
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i128()
}

/// `ceil(value * ppm / 1_000_000)` for non-negative values.
pub fn mul_ppm_round_up(value: u128, ppm: u32) -> u128 {
    let numerator = value * ppm as u128;
    numerator.div_ceil(ONE_MILLION as u128)
}

/// `floor(value * ppm / 1_000_000)` for non-negative values.
pub fn mul_ppm_round_down(value: u128, ppm: u32) -> u128 {
    value * ppm as u128 / ONE_MILLION as u128
}

/// Floor division that rounds toward negative infinity for signed operands.
pub fn div_floor(numerator: i128, denominator: i128) -> i128 {
    let q = numerator / denominator;
    if (numerator % denominator != 0) && ((numerator < 0) != (denominator < 0)) {
        q - 1
    } else {
        q
    }
}

/// Ceiling division for signed operands.
pub fn div_ceil(numerator: i128, denominator: i128) -> i128 {
    -div_floor(-numerator, denominator)
}

/// `floor(value * 10^exponent)`, exact for any sign of exponent.
pub fn mul_pow10_floor(value: i128, exponent: i32) -> Option<i128> {
    if exponent >= 0 {
        let factor = 10i128.checked_pow(exponent as u32)?;
        value.checked_mul(factor)
    } else {
        let factor = 10i128.checked_pow(exponent.unsigned_abs())?;
        Some(div_floor(value, factor))
    }
}

/// Quote quantums exchanged when `base_quantums` fill at `subticks`:
/// `floor(base_quantums * subticks * 10^quantum_conversion_exponent)`.
pub fn fill_amount_to_quote_quantums(
    subticks: u64,
    base_quantums: u64,
    quantum_conversion_exponent: i32,
) -> Option<u64> {
    let product = (subticks as i128).checked_mul(base_quantums as i128)?;
    let quote = mul_pow10_floor(product, quantum_conversion_exponent)?;
    u64::try_from(quote).ok()
}
