use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::DEFAULT_REFRESH_EVERY;
use crate::ingest::{GapFillMode, IngestSettings};
use crate::retry::RetryPolicy;
use crate::timeframe::{parse_timeframe, Timeframe, TimeframeError, DEFAULT_TIMEFRAMES};
use crate::upstream::{BybitConfig, BYBIT_BASE_URL};

pub const DEFAULT_DB_PATH: &str = "/app/data/cmma.db";
pub const DEFAULT_FETCH_INTERVAL_SECONDS: u64 = 300;
pub const DEFAULT_FETCHER_HISTORY_LIMIT: usize = 1_000;
pub const DEFAULT_API_HISTORY_LIMIT: usize = 5;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TIMEFRAMES: {0}")]
    Timeframe(#[from] TimeframeError),
    #[error("GAP_FILL must be one of off, startup, always; got {0:?}")]
    GapFill(String),
    #[error("API_ADDR {value:?} is not a socket address: {message}")]
    Addr { value: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    pub timeframes: Vec<Timeframe>,
    pub fetch_interval_seconds: u64,
    pub history_limit: usize,
    pub concurrency_limit: usize,
    pub db_path: PathBuf,
    pub gap_fill: GapFillMode,
    pub bybit: BybitConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeframes: DEFAULT_TIMEFRAMES.to_vec(),
            fetch_interval_seconds: DEFAULT_FETCH_INTERVAL_SECONDS,
            history_limit: DEFAULT_FETCHER_HISTORY_LIMIT,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            gap_fill: GapFillMode::Startup,
            bybit: BybitConfig::default(),
        }
    }
}

impl FetcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| non_empty(lookup(key));
        let mut cfg = Self::default();

        if let Some(raw) = get("TIMEFRAMES") {
            let parsed = parse_timeframe_list(&raw)?;
            if !parsed.is_empty() {
                cfg.timeframes = parsed;
            }
        }
        if let Some(value) = get("FETCH_INTERVAL_SECONDS").and_then(|raw| positive::<u64>(&raw)) {
            cfg.fetch_interval_seconds = value;
        }
        if let Some(value) = get("OHLCV_HISTORY_LIMIT").and_then(|raw| positive::<usize>(&raw)) {
            cfg.history_limit = value;
        }
        if let Some(value) = get("CONCURRENCY_LIMIT").and_then(|raw| positive::<usize>(&raw)) {
            cfg.concurrency_limit = value;
        }
        if let Some(path) = get("DB_PATH") {
            cfg.db_path = PathBuf::from(path);
        }
        if let Some(raw) = get("GAP_FILL") {
            cfg.gap_fill = GapFillMode::parse(&raw).ok_or(ConfigError::GapFill(raw))?;
        }

        cfg.bybit = BybitConfig {
            base_url: get("BYBIT_BASE_URL").unwrap_or_else(|| BYBIT_BASE_URL.to_string()),
            http_timeout_ms: get("HTTP_TIMEOUT_MS")
                .and_then(|raw| positive::<u64>(&raw))
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            ..BybitConfig::default()
        };

        Ok(cfg)
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            timeframes: self.timeframes.clone(),
            fetch_interval: Duration::from_secs(self.fetch_interval_seconds),
            history_limit: self.history_limit,
            concurrency_limit: self.concurrency_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub db_path: PathBuf,
    pub history_limit: usize,
    pub refresh_every: Duration,
    pub addr: SocketAddr,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| non_empty(lookup(key));

        let raw_addr = get("API_ADDR").unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let addr = raw_addr.parse::<SocketAddr>().map_err(|err| ConfigError::Addr {
            value: raw_addr.clone(),
            message: err.to_string(),
        })?;

        Ok(Self {
            db_path: get("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            history_limit: get("OHLCV_HISTORY_LIMIT")
                .and_then(|raw| positive::<usize>(&raw))
                .unwrap_or(DEFAULT_API_HISTORY_LIMIT),
            refresh_every: get("CACHE_REFRESH_SECONDS")
                .and_then(|raw| positive::<u64>(&raw))
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REFRESH_EVERY),
            addr,
        })
    }
}

pub fn parse_timeframe_list(raw: &str) -> Result<Vec<Timeframe>, ConfigError> {
    let mut out = Vec::new();
    for label in raw.split(',').map(str::trim).filter(|label| !label.is_empty()) {
        let tf = parse_timeframe(label)?;
        if !out.contains(&tf) {
            out.push(tf);
        }
    }
    Ok(out)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn positive<T>(raw: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.parse::<T>().ok().filter(|value| *value > T::default())
}
