// 7.0 config.rs: all keeper settings in one place. fees, liquidations, windows.
// 7.1 FeeTierParams is the schedule new pairs are created with. fills are
// charged from the pair. no volume-based tiers yet.

use serde::{Deserialize, Serialize};

use crate::deleveraging::DeleveragingParams;
use crate::liquidation::LiquidationsConfig;
use crate::matching::SelfTradePolicy;
use crate::types::ONE_MILLION;

/** 7.2: fee settings in ppm. 10_000 ppm = 1% */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTierParams {
    // Maker fee in ppm (negative = rebate)
    pub maker_fee_ppm: i32,
    // Taker fee in ppm
    pub taker_fee_ppm: i32,
}

impl Default for FeeTierParams {
    fn default() -> Self {
        Self {
            maker_fee_ppm: 200,  // 0.02%
            taker_fee_ppm: 500,  // 0.05%
        }
    }
}

impl FeeTierParams {
    pub fn fee_ppm(&self, is_taker: bool) -> i32 {
        if is_taker {
            self.taker_fee_ppm
        } else {
            self.maker_fee_ppm
        }
    }
}

// The complete keeper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClobConfig {
    // How many blocks ahead a short-term order's good-til-block may be
    pub short_block_window: u32,
    // Upper bound for any ClobPair fee
    pub max_fee_ppm: u32,
    pub fees: FeeTierParams,
    // What local matching does with same-subaccount crosses
    pub self_trade_policy: SelfTradePolicy,
    pub liquidations: LiquidationsConfig,
    pub deleveraging: DeleveragingParams,
    // Length of one stats epoch in seconds
    pub stats_epoch_secs: i64,
    // Epoch stats older than this are expired
    pub stats_window_secs: i64,
    // Whether indexer events are collected at all
    pub indexer_enabled: bool,
}

impl Default for ClobConfig {
    fn default() -> Self {
        Self {
            short_block_window: 20,
            max_fee_ppm: 100_000, // 10%
            fees: FeeTierParams::default(),
            self_trade_policy: SelfTradePolicy::default(),
            liquidations: LiquidationsConfig::default(),
            deleveraging: DeleveragingParams::default(),
            stats_epoch_secs: 3_600,
            stats_window_secs: 30 * 24 * 3_600, // 30 days
            indexer_enabled: true,
        }
    }
}

impl ClobConfig {
    // Free makers and a minimal taker fee
    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.fees.maker_fee_ppm = 0;
        config.fees.taker_fee_ppm = 100;
        config.stats_window_secs = 24 * 3_600;
        config
    }

    // Maker rebate and a tighter liquidation fee
    pub fn mainnet() -> Self {
        let mut config = Self::default();
        config.fees.maker_fee_ppm = -110;
        config.fees.taker_fee_ppm = 500;
        config.liquidations.max_liquidation_fee_ppm = 15_000;
        config
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.short_block_window == 0 {
            return Err(ConfigError::InvalidWindow {
                reason: "short block window must be > 0".to_string(),
            });
        }

        // fee checks
        if self.max_fee_ppm > ONE_MILLION {
            return Err(ConfigError::InvalidFees {
                reason: format!("max fee ppm {} exceeds {}", self.max_fee_ppm, ONE_MILLION),
            });
        }
        let fees = &self.fees;
        if fees.taker_fee_ppm < 0 || fees.taker_fee_ppm as u32 > self.max_fee_ppm {
            return Err(ConfigError::InvalidFees {
                reason: format!("taker fee ppm {} must be in [0, {}]", fees.taker_fee_ppm, self.max_fee_ppm),
            });
        }
        // a rebate may never exceed what the taker pays
        if fees.maker_fee_ppm.unsigned_abs() > fees.taker_fee_ppm as u32 {
            return Err(ConfigError::InvalidFees {
                reason: format!(
                    "maker fee ppm {} must be within taker fee ppm {}",
                    fees.maker_fee_ppm, fees.taker_fee_ppm
                ),
            });
        }

        self.liquidations
            .validate()
            .map_err(|reason| ConfigError::InvalidLiquidations { reason })?;

        if self.deleveraging.max_offsetting_subaccounts == 0 {
            return Err(ConfigError::InvalidLiquidations {
                reason: "need at least 1 offsetting subaccount".to_string(),
            });
        }

        // stats checks
        if self.stats_epoch_secs <= 0 || self.stats_window_secs < self.stats_epoch_secs {
            return Err(ConfigError::InvalidWindow {
                reason: "stats window must cover at least one positive epoch".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid fees: {reason}")]
    InvalidFees { reason: String },

    #[error("invalid liquidations config: {reason}")]
    InvalidLiquidations { reason: String },

    #[error("invalid window: {reason}")]
    InvalidWindow { reason: String },

    #[error("config parse error: {0}")]
    Parse(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> ClobConfig {
        match self {
            Environment::Development => ClobConfig::default(),
            Environment::Testnet => ClobConfig::testnet(),
            Environment::Mainnet => ClobConfig::mainnet(),
        }
    }
}
