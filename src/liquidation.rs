//! Liquidation math.
//!
//! A subaccount is liquidatable once its net collateral falls below its
//! maintenance margin. Closing a position of a liquidatable subaccount happens
//! at or better than the fillable price; the difference between what the fill
//! pays and what the bankruptcy price would have paid goes to (or comes out of)
//! the insurance fund.
//!
//! Everything here is pure integer/decimal math. Store reads and the per-block
//! bookkeeping live in the keeper.

use crate::clob_pair::ClobPair;
use crate::types::{div_ceil, mul_ppm_round_down, PerpetualId, ONE_MILLION};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillablePriceConfig {
    /// Scales how far past the bankruptcy price a fill may go.
    pub bankruptcy_adjustment_ppm: u32,
    pub spread_to_maintenance_margin_ratio_ppm: u32,
}

impl Default for FillablePriceConfig {
    fn default() -> Self {
        Self {
            bankruptcy_adjustment_ppm: ONE_MILLION,
            spread_to_maintenance_margin_ratio_ppm: 100_000,
        }
    }
}

/// Caps on how much one subaccount can be liquidated within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountBlockLimits {
    pub max_notional_liquidated: u64,
    pub max_quantums_insurance_lost: u64,
}

impl Default for SubaccountBlockLimits {
    fn default() -> Self {
        Self {
            max_notional_liquidated: 100_000_000_000_000,
            max_quantums_insurance_lost: 100_000_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationsConfig {
    /// Upper bound on what the insurance fund may collect from a fill, in ppm of
    /// the fill's quote quantums.
    pub max_liquidation_fee_ppm: u32,
    pub fillable_price_config: FillablePriceConfig,
    pub subaccount_block_limits: SubaccountBlockLimits,
}

impl Default for LiquidationsConfig {
    fn default() -> Self {
        Self {
            max_liquidation_fee_ppm: 5_000,
            fillable_price_config: FillablePriceConfig::default(),
            subaccount_block_limits: SubaccountBlockLimits::default(),
        }
    }
}

impl LiquidationsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_liquidation_fee_ppm == 0 || self.max_liquidation_fee_ppm > ONE_MILLION {
            return Err(format!(
                "max liquidation fee ppm {} must be in (0, {}]",
                self.max_liquidation_fee_ppm, ONE_MILLION
            ));
        }
        let fpc = &self.fillable_price_config;
        if fpc.bankruptcy_adjustment_ppm < ONE_MILLION {
            return Err(format!(
                "bankruptcy adjustment ppm {} must be >= {}",
                fpc.bankruptcy_adjustment_ppm, ONE_MILLION
            ));
        }
        if fpc.spread_to_maintenance_margin_ratio_ppm == 0 {
            return Err("spread to maintenance margin ratio ppm must be > 0".to_string());
        }
        let limits = &self.subaccount_block_limits;
        if limits.max_notional_liquidated == 0 || limits.max_quantums_insurance_lost == 0 {
            return Err("subaccount block limits must be > 0".to_string());
        }
        Ok(())
    }
}

/// What a subaccount has been liquidated for so far this block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountLiquidationInfo {
    pub perpetuals_liquidated: Vec<PerpetualId>,
    pub notional_liquidated: u64,
    pub quantums_insurance_lost: u64,
}

impl SubaccountLiquidationInfo {
    pub fn has_liquidated(&self, perpetual_id: PerpetualId) -> bool {
        self.perpetuals_liquidated.contains(&perpetual_id)
    }
}

/// Risk of one position relative to its whole subaccount, in quote quantums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionRisk {
    pub total_net_collateral: i128,
    pub total_maintenance_margin: i128,
    pub position_net_notional: i128,
    pub position_maintenance_margin: i128,
    pub position_quantums: i128,
}

// 5.1: bankruptcy price.
//
// quote quantums the liquidated subaccount would pay (negative) or receive for
// `delta` that leaves it with exactly zero collateral in proportion to the
// maintenance margin released. rounds up.
pub fn bankruptcy_quote_quantums(
    total_net_collateral: i128,
    total_maintenance_margin: i128,
    delta_net_notional: i128,
    delta_maintenance_margin: i128,
) -> i128 {
    if total_maintenance_margin == 0 {
        return -delta_net_notional;
    }
    let released = total_net_collateral * delta_maintenance_margin;
    div_ceil(-delta_net_notional * total_maintenance_margin - released, total_maintenance_margin)
}

// 5.2: fillable price.
//
// (PNNV - ABR * SMMR * PMMR) / PS where ABR = BA * (1 - TNC / TMMR) clamped to
// [0, 1]. returns the price in subticks of `pair`, rounded towards the
// liquidated subaccount: buys round down to a tick, sells round up.
pub fn fillable_price_subticks(
    config: &FillablePriceConfig,
    risk: &PositionRisk,
    pair: &ClobPair,
) -> Option<u64> {
    if risk.position_quantums == 0 || risk.total_maintenance_margin <= 0 {
        return None;
    }
    let ppm = Decimal::from(ONE_MILLION);
    let tnc = Decimal::try_from_i128_with_scale(risk.total_net_collateral, 0).ok()?;
    let tmmr = Decimal::try_from_i128_with_scale(risk.total_maintenance_margin, 0).ok()?;
    let pnnv = Decimal::try_from_i128_with_scale(risk.position_net_notional, 0).ok()?;
    let pmmr = Decimal::try_from_i128_with_scale(risk.position_maintenance_margin, 0).ok()?;
    let ps = Decimal::try_from_i128_with_scale(risk.position_quantums, 0).ok()?;

    let ba = Decimal::from(config.bankruptcy_adjustment_ppm) / ppm;
    let smmr = Decimal::from(config.spread_to_maintenance_margin_ratio_ppm) / ppm;
    let abr = (ba * (Decimal::ONE - tnc / tmmr)).max(Decimal::ZERO).min(Decimal::ONE);

    // quote quantums per base quantum
    let price = (pnnv.checked_sub(abr * smmr * pmmr)?).checked_div(ps)?;
    let scale = pow10(-pair.quantum_conversion_exponent)?;
    let subticks = price.checked_mul(scale)?;

    let is_buy = risk.position_quantums < 0;
    let tick = pair.subticks_per_tick.max(1) as u64;
    if is_buy {
        let raw = subticks
            .round_dp_with_strategy(0, RoundingStrategy::ToNegativeInfinity)
            .to_u64()
            .unwrap_or(if subticks.is_sign_negative() { 0 } else { u64::MAX });
        Some(pair.round_down_to_tick(raw).max(tick))
    } else {
        let raw = subticks
            .round_dp_with_strategy(0, RoundingStrategy::ToPositiveInfinity)
            .to_u64()
            .unwrap_or(if subticks.is_sign_negative() { 0 } else { u64::MAX });
        Some(pair.round_up_to_tick(raw).max(tick))
    }
}

fn pow10(exponent: i32) -> Option<Decimal> {
    let mut value = Decimal::ONE;
    let ten = Decimal::from(10);
    if exponent >= 0 {
        for _ in 0..exponent {
            value = value.checked_mul(ten)?;
        }
    } else {
        for _ in 0..exponent.unsigned_abs() {
            value = value.checked_div(ten)?;
        }
    }
    Some(value)
}

// 5.3: insurance fund delta of one liquidation fill.
//
// positive: the fund collects, capped at max_liquidation_fee_ppm of the fill.
// negative: the fund pays the shortfall.
pub fn insurance_fund_delta(
    liquidated_quote_delta: i128,
    bankruptcy_quote: i128,
    fill_quote_quantums: u64,
    max_liquidation_fee_ppm: u32,
) -> i128 {
    let delta = liquidated_quote_delta - bankruptcy_quote;
    if delta <= 0 {
        return delta;
    }
    let cap = mul_ppm_round_down(fill_quote_quantums as u128, max_liquidation_fee_ppm) as i128;
    delta.min(cap)
}
