//! ClobPair: a tradable perpetual market.
//!
//! Created once through validated construction and stored under a sequential id.
//! Only the status may change afterwards.

use crate::config::FeeTierParams;
use crate::types::{ClobPairId, PerpetualId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClobPairStatus {
    Active,
    Paused,
    CancelOnly,
    PostOnly,
    Initializing,
    FinalSettlement,
}

impl ClobPairStatus {
    pub fn accepts_orders(&self) -> bool {
        matches!(self, ClobPairStatus::Active | ClobPairStatus::PostOnly)
    }

    pub fn allows_matching(&self) -> bool {
        matches!(self, ClobPairStatus::Active)
    }
}

// 12.0: stored ClobPair. status is optional so "unspecified" survives until validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClobPair {
    pub id: ClobPairId,
    pub perpetual_id: PerpetualId,
    pub step_base_quantums: u64,
    pub subticks_per_tick: u32,
    pub min_order_base_quantums: u64,
    pub quantum_conversion_exponent: i32,
    pub status: Option<ClobPairStatus>,
    /// Charged to the maker of every fill on this pair. negative is a rebate.
    pub maker_fee_ppm: i32,
    pub taker_fee_ppm: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClobPairError {
    #[error("ClobPair {clob_pair_id} has invalid perpetual. perpetual {perpetual_id} does not exist")]
    InvalidPerpetual {
        clob_pair_id: ClobPairId,
        perpetual_id: PerpetualId,
    },

    #[error("invalid ClobPair parameter: {0}")]
    InvalidParameter(String),
}

impl ClobPair {
    /// Parameter checks. the perpetual lookup happens in the keeper.
    pub fn validate(&self, max_fee_ppm: u32) -> Result<(), ClobPairError> {
        let invalid = |msg: String| Err(ClobPairError::InvalidParameter(msg));

        if self.min_order_base_quantums == 0 {
            return invalid("MinOrderBaseQuantums must be > 0.".to_string());
        }
        if self.step_base_quantums == 0 {
            return invalid("StepBaseQuantums must be > 0.".to_string());
        }
        if self.min_order_base_quantums % self.step_base_quantums != 0 {
            return invalid(format!(
                "MinOrderBaseQuantums ({}) must be divisible by StepBaseQuantums ({}).",
                self.min_order_base_quantums, self.step_base_quantums
            ));
        }
        if self.subticks_per_tick == 0 {
            return invalid("SubticksPerTick must be > 0.".to_string());
        }
        if self.status.is_none() {
            return invalid("Status must be specified.".to_string());
        }
        let max = i64::from(max_fee_ppm);
        if i64::from(self.maker_fee_ppm) > max {
            return invalid(format!(
                "MakerFeePpm ({}) must be <= MaxFeePpm ({}).",
                self.maker_fee_ppm, max_fee_ppm
            ));
        }
        if self.taker_fee_ppm < 0 || i64::from(self.taker_fee_ppm) > max {
            return invalid(format!(
                "TakerFeePpm ({}) must be in [0, MaxFeePpm ({})].",
                self.taker_fee_ppm, max_fee_ppm
            ));
        }
        if self.maker_fee_ppm > self.taker_fee_ppm {
            return invalid(format!(
                "MakerFeePpm ({}) must be <= TakerFeePpm ({}).",
                self.maker_fee_ppm, self.taker_fee_ppm
            ));
        }
        // a maker rebate is paid out of the taker fee
        if self.maker_fee_ppm.unsigned_abs() > self.taker_fee_ppm.unsigned_abs() {
            return invalid(format!(
                "MakerFeePpm rebate ({}) must not exceed TakerFeePpm ({}).",
                self.maker_fee_ppm, self.taker_fee_ppm
            ));
        }
        Ok(())
    }

    pub fn fee_ppm(&self, is_taker: bool) -> i32 {
        if is_taker {
            self.taker_fee_ppm
        } else {
            self.maker_fee_ppm
        }
    }

    /// The same pair charging `fees`.
    pub fn with_fees(self, fees: FeeTierParams) -> Self {
        Self {
            maker_fee_ppm: fees.maker_fee_ppm,
            taker_fee_ppm: fees.taker_fee_ppm,
            ..self
        }
    }

    pub fn status(&self) -> ClobPairStatus {
        self.status.unwrap_or(ClobPairStatus::Initializing)
    }

    /// Largest multiple of the tick at or below `subticks`, never below one tick.
    pub fn round_down_to_tick(&self, subticks: u64) -> u64 {
        let tick = self.subticks_per_tick.max(1) as u64;
        (subticks / tick * tick).max(tick)
    }

    /// Smallest multiple of the tick at or above `subticks`.
    pub fn round_up_to_tick(&self, subticks: u64) -> u64 {
        let tick = self.subticks_per_tick.max(1) as u64;
        subticks.div_ceil(tick).saturating_mul(tick).max(tick)
    }

    /// Largest multiple of the step at or below `quantums`.
    pub fn round_down_to_step(&self, quantums: u64) -> u64 {
        let step = self.step_base_quantums.max(1);
        quantums / step * step
    }

    /// BTC-USD pair on perpetual 0 used across tests and the simulator.
    pub fn btc_usd(id: ClobPairId) -> Self {
        Self {
            id,
            perpetual_id: PerpetualId(0),
            step_base_quantums: 5,
            subticks_per_tick: 5,
            min_order_base_quantums: 5,
            quantum_conversion_exponent: -8,
            status: Some(ClobPairStatus::Active),
            maker_fee_ppm: 200,
            taker_fee_ppm: 500,
        }
    }
}
