//! Margin calculation for initial and maintenance requirements.
//!
//! Initial margin (IMR) is the notional value times the liquidity tier's initial
//! margin ppm, scaled up for positions larger than the tier's base position
//! notional and capped at 100%. Maintenance margin (MMR) is a fixed fraction of IMR.
//!
//! All amounts are quote quantums. A position is liquidatable once its subaccount's
//! net collateral falls below the summed MMR.

use crate::types::{
    div_floor, mul_pow10_floor, mul_ppm_round_down, LiquidityTierId, ONE_MILLION,
    QUOTE_ATOMIC_RESOLUTION,
};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use serde::{Deserialize, Serialize};

// 3.0: liquidity tier. shared margin parameters for a group of perpetuals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityTier {
    pub id: LiquidityTierId,
    pub name: String,
    pub initial_margin_ppm: u32,
    pub maintenance_fraction_ppm: u32,
    /// Notional above which initial margin scales with sqrt(notional / base).
    /// zero disables the scaling.
    pub base_position_notional: u64,
}

impl LiquidityTier {
    /// 20% initial, maintenance at half of initial (10%).
    pub fn twenty_percent_initial(id: LiquidityTierId) -> Self {
        Self {
            id,
            name: "Large-Cap".to_string(),
            initial_margin_ppm: 200_000,
            maintenance_fraction_ppm: 500_000,
            base_position_notional: 0,
        }
    }

    /// 100% initial and maintenance.
    pub fn full_margin(id: LiquidityTierId) -> Self {
        Self {
            id,
            name: "Full-Margin".to_string(),
            initial_margin_ppm: ONE_MILLION,
            maintenance_fraction_ppm: ONE_MILLION,
            base_position_notional: 0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_margin_ppm > ONE_MILLION {
            return Err(format!(
                "initial margin ppm {} exceeds {}",
                self.initial_margin_ppm, ONE_MILLION
            ));
        }
        if self.maintenance_fraction_ppm > ONE_MILLION {
            return Err(format!(
                "maintenance fraction ppm {} exceeds {}",
                self.maintenance_fraction_ppm, ONE_MILLION
            ));
        }
        Ok(())
    }

    // 3.1: sqrt scaling for oversized positions, capped at 100%.
    fn adjusted_initial_margin_ppm(&self, abs_notional: u128) -> u32 {
        if self.base_position_notional == 0 || abs_notional <= self.base_position_notional as u128 {
            return self.initial_margin_ppm;
        }
        let notional = Decimal::from_u128(abs_notional).unwrap_or(Decimal::MAX);
        let ratio = notional / Decimal::from(self.base_position_notional);
        let multiplier = ratio.sqrt().unwrap_or(Decimal::ONE).max(Decimal::ONE);
        let adjusted = Decimal::from(self.initial_margin_ppm) * multiplier;
        adjusted
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_u32()
            .unwrap_or(ONE_MILLION)
            .min(ONE_MILLION)
    }

    /// (IMR, MMR) for a position whose absolute notional is `abs_notional`.
    pub fn margin_requirements(&self, abs_notional: u128) -> (u128, u128) {
        let ppm = self.adjusted_initial_margin_ppm(abs_notional);
        let initial = (abs_notional * ppm as u128).div_ceil(ONE_MILLION as u128);
        let maintenance = mul_ppm_round_down(initial, self.maintenance_fraction_ppm);
        (initial, maintenance)
    }
}

// 3.2: price conversions.

/// Signed notional of `base_quantums` at `price * 10^price_exponent`, floored.
pub fn base_to_quote_quantums(
    base_quantums: i128,
    atomic_resolution: i32,
    price: u64,
    price_exponent: i32,
) -> Option<i128> {
    let product = base_quantums.checked_mul(price as i128)?;
    mul_pow10_floor(
        product,
        atomic_resolution + price_exponent - QUOTE_ATOMIC_RESOLUTION,
    )
}

/// Oracle price expressed in a pair's subticks.
pub fn price_to_subticks(
    price: u64,
    price_exponent: i32,
    atomic_resolution: i32,
    quantum_conversion_exponent: i32,
) -> Option<u64> {
    let exponent =
        atomic_resolution + price_exponent - QUOTE_ATOMIC_RESOLUTION - quantum_conversion_exponent;
    let subticks = mul_pow10_floor(price as i128, exponent)?;
    u64::try_from(subticks).ok()
}

/// Funding owed since the position last settled. positive credits the holder.
/// positive amounts round toward zero, negative ones away from it, so settlement
/// never creates value.
pub fn funding_settlement(index_delta: i64, quantums: i128) -> i128 {
    div_floor(-(index_delta as i128) * quantums, ONE_MILLION as i128)
}

/// Net collateral plus the two margin requirements of a subaccount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub net_collateral: i128,
    pub initial_margin: i128,
    pub maintenance_margin: i128,
}

impl RiskSummary {
    pub fn is_initial_collateralized(&self) -> bool {
        self.net_collateral >= self.initial_margin
    }

    pub fn is_liquidatable(&self) -> bool {
        self.net_collateral < self.maintenance_margin
    }

    pub fn add_position(&mut self, net_notional: i128, initial: i128, maintenance: i128) {
        self.net_collateral += net_notional;
        self.initial_margin += initial;
        self.maintenance_margin += maintenance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_percent_tier() {
        let tier = LiquidityTier::twenty_percent_initial(LiquidityTierId(0));
        // $50,000 notional
        let (imr, mmr) = tier.margin_requirements(50_000_000_000);
        assert_eq!(imr, 10_000_000_000);
        assert_eq!(mmr, 5_000_000_000);
    }

    #[test]
    fn full_margin_tier() {
        let tier = LiquidityTier::full_margin(LiquidityTierId(1));
        let (imr, mmr) = tier.margin_requirements(1_234);
        assert_eq!((imr, mmr), (1_234, 1_234));
    }

    #[test]
    fn oversized_positions_scale() {
        let mut tier = LiquidityTier::twenty_percent_initial(LiquidityTierId(0));
        tier.base_position_notional = 1_000;
        // 4x the base notional doubles the initial margin fraction
        let (imr, _) = tier.margin_requirements(4_000);
        assert_eq!(imr, 1_600);
        // capped at 100%
        let (imr, _) = tier.margin_requirements(100_000);
        assert_eq!(imr, 100_000);
    }

    #[test]
    fn btc_notional() {
        // 1 BTC at $50,000 with atomic resolution -8 and price exponent -5
        assert_eq!(
            base_to_quote_quantums(100_000_000, -8, 5_000_000_000, -5),
            Some(50_000_000_000)
        );
        assert_eq!(
            base_to_quote_quantums(-25_000_000, -8, 5_000_000_000, -5),
            Some(-12_500_000_000)
        );
    }

    #[test]
    fn oracle_in_subticks() {
        assert_eq!(price_to_subticks(5_000_000_000, -5, -8, -8), Some(50_000_000_000));
    }

    #[test]
    fn funding_rounding() {
        // paying side rounds away from zero
        assert_eq!(funding_settlement(3, 1), -1);
        // receiving side rounds toward zero
        assert_eq!(funding_settlement(-3, 1), 0);
        assert_eq!(funding_settlement(0, 1_000), 0);
    }

    #[test]
    fn liquidatable_threshold() {
        let summary = RiskSummary {
            net_collateral: 5_000,
            initial_margin: 10_000,
            maintenance_margin: 5_000,
        };
        assert!(!summary.is_liquidatable());
        assert!(!summary.is_initial_collateralized());
    }
}
