//! Closed vocabulary for candle timeframes and aggregation periods.
//!
//! Every storage identifier and upstream interval code is derived from these
//! enums, so user-supplied labels never reach SQL text.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    Mo1,
}

pub const ALL_TIMEFRAMES: [Timeframe; 9] = [
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::H4,
    Timeframe::D1,
    Timeframe::W1,
    Timeframe::Mo1,
];

pub const DEFAULT_TIMEFRAMES: [Timeframe; 7] = [
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::H4,
    Timeframe::D1,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    H1,
    H6,
    H12,
    H24,
    D1,
    D7,
    W1,
    Mo1,
}

pub const ALL_PERIODS: [Period; 8] = [
    Period::H1,
    Period::H6,
    Period::H12,
    Period::H24,
    Period::D1,
    Period::D7,
    Period::W1,
    Period::Mo1,
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeframeError {
    #[error("unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),
    #[error("unsupported period: {0}")]
    UnsupportedPeriod(String),
}

pub fn parse_timeframe(input: &str) -> Result<Timeframe, TimeframeError> {
    match input.trim() {
        "1m" => Ok(Timeframe::M1),
        "5m" => Ok(Timeframe::M5),
        "15m" => Ok(Timeframe::M15),
        "30m" => Ok(Timeframe::M30),
        "1h" => Ok(Timeframe::H1),
        "4h" => Ok(Timeframe::H4),
        "1d" => Ok(Timeframe::D1),
        "1w" => Ok(Timeframe::W1),
        "1M" => Ok(Timeframe::Mo1),
        other => Err(TimeframeError::UnsupportedTimeframe(other.to_string())),
    }
}

pub fn parse_period(input: &str) -> Result<Period, TimeframeError> {
    match input.trim() {
        "1h" => Ok(Period::H1),
        "6h" => Ok(Period::H6),
        "12h" => Ok(Period::H12),
        "24h" => Ok(Period::H24),
        "1d" => Ok(Period::D1),
        "7d" => Ok(Period::D7),
        "1w" => Ok(Period::W1),
        "1M" => Ok(Period::Mo1),
        other => Err(TimeframeError::UnsupportedPeriod(other.to_string())),
    }
}

const MINUTE_SECONDS: i64 = 60;
const HOUR_SECONDS: i64 = 60 * MINUTE_SECONDS;
const DAY_SECONDS: i64 = 24 * HOUR_SECONDS;

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn bybit_interval(self) -> &'static str {
        match self {
            Self::M1 => "1",
            Self::M5 => "5",
            Self::M15 => "15",
            Self::M30 => "30",
            Self::H1 => "60",
            Self::H4 => "240",
            Self::D1 => "D",
            Self::W1 => "W",
            Self::Mo1 => "M",
        }
    }

    // SQLite identifiers are case-insensitive, so the monthly table cannot be
    // `ohlcv_1M` next to `ohlcv_1m`.
    pub fn table_name(self) -> &'static str {
        match self {
            Self::M1 => "ohlcv_1m",
            Self::M5 => "ohlcv_5m",
            Self::M15 => "ohlcv_15m",
            Self::M30 => "ohlcv_30m",
            Self::H1 => "ohlcv_1h",
            Self::H4 => "ohlcv_4h",
            Self::D1 => "ohlcv_1d",
            Self::W1 => "ohlcv_1w",
            Self::Mo1 => "ohlcv_1mo",
        }
    }

    pub fn step_seconds(self) -> i64 {
        match self {
            Self::M1 => MINUTE_SECONDS,
            Self::M5 => 5 * MINUTE_SECONDS,
            Self::M15 => 15 * MINUTE_SECONDS,
            Self::M30 => 30 * MINUTE_SECONDS,
            Self::H1 => HOUR_SECONDS,
            Self::H4 => 4 * HOUR_SECONDS,
            Self::D1 => DAY_SECONDS,
            Self::W1 => 7 * DAY_SECONDS,
            Self::Mo1 => 30 * DAY_SECONDS,
        }
    }

    pub fn step_ms(self) -> i64 {
        self.step_seconds() * 1_000
    }

    pub fn step_minutes(self) -> i64 {
        self.step_seconds() / MINUTE_SECONDS
    }

    pub fn has_regular_grid(self) -> bool {
        !matches!(self, Self::Mo1)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H1 => "1h",
            Self::H6 => "6h",
            Self::H12 => "12h",
            Self::H24 => "24h",
            Self::D1 => "1d",
            Self::D7 => "7d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn minutes(self) -> i64 {
        match self {
            Self::H1 => 60,
            Self::H6 => 6 * 60,
            Self::H12 => 12 * 60,
            Self::H24 | Self::D1 => 24 * 60,
            Self::D7 | Self::W1 => 7 * 24 * 60,
            Self::Mo1 => 30 * 24 * 60,
        }
    }

    pub fn duration_ms(self) -> i64 {
        self.minutes() * MINUTE_SECONDS * 1_000
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

pub fn timeframe_labels() -> String {
    ALL_TIMEFRAMES
        .iter()
        .map(|tf| tf.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn period_labels() -> String {
    ALL_PERIODS
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
