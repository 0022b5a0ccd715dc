use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::phy::PulseTiming;

/// Most satellites one channel can carry
pub const MAX_SATELLITES: usize = 8;
/// Link positions including the guard position used by discovery
pub const MAX_POSITIONS: usize = MAX_SATELLITES + 1;

const DEFAULT_SCAN_INTERVAL_MS: u64 = 20;
const DEFAULT_SETTLE_MS: u64 = 50;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 10;
const DEFAULT_CRC_TEST_TRAILING_CYCLES: u8 = 2;

/// Error-rate thresholds in errors per second. `high == 0` disables blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorThresholds {
    pub high: u32,
    pub low: u32,
}

impl ErrorThresholds {
    pub const DISABLED: ErrorThresholds = ErrorThresholds { high: 0, low: 0 };

    pub fn new(high: u32, low: u32) -> Self {
        Self { high, low }
    }

    pub fn is_enabled(&self) -> bool {
        self.high != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    /// Largest chain this channel accepts; one guard position is added on top
    pub max_satellites: usize,
    pub scan_interval_ms: u64,
    pub error_thresholds: ErrorThresholds,
    /// Wait after each discovery probe cycle
    pub discovery_settle_ms: u64,
    /// How long a cycle waits for the capture to come back
    pub receive_timeout_ms: u64,
    /// Cycles a CRC self-test keeps suppressing errors after it is switched off
    pub crc_test_trailing_cycles: u8,
    pub timing: PulseTiming,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "satlink0".to_string(),
            max_satellites: MAX_SATELLITES,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            error_thresholds: ErrorThresholds::DISABLED,
            discovery_settle_ms: DEFAULT_SETTLE_MS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            crc_test_trailing_cycles: DEFAULT_CRC_TEST_TRAILING_CYCLES,
            timing: PulseTiming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("max_satellites must be within 1..={max}, got {got}")]
    SatelliteCount { got: usize, max: usize },
    #[error("scan interval must be non-zero")]
    ZeroScanInterval,
    #[error("low threshold {low} exceeds high threshold {high}")]
    Thresholds { high: u32, low: u32 },
    #[error("pulse timing profiles do not fit their tolerance windows")]
    Timing,
}

impl ChannelConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ChannelConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidJson(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_satellites == 0 || self.max_satellites > MAX_SATELLITES {
            return Err(ConfigError::SatelliteCount {
                got: self.max_satellites,
                max: MAX_SATELLITES,
            });
        }
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::ZeroScanInterval);
        }
        validate_thresholds(self.error_thresholds)?;
        if !self.timing.is_consistent() {
            return Err(ConfigError::Timing);
        }
        Ok(())
    }

    /// Positions probed during discovery, the guard position included
    pub fn capacity(&self) -> usize {
        self.max_satellites + 1
    }
}

pub(crate) fn validate_thresholds(thresholds: ErrorThresholds) -> Result<(), ConfigError> {
    if thresholds.is_enabled() && thresholds.low > thresholds.high {
        return Err(ConfigError::Thresholds {
            high: thresholds.high,
            low: thresholds.low,
        });
    }
    Ok(())
}
