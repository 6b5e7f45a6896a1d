//! CMMA core crate.
//!
//! Bybit linear-perpetual candle ingestion with gap backfill, a SQLite
//! rolling store, and a refresh-ahead snapshot cache serving volatility and
//! volume rankings over HTTP.

mod analytics;
mod api;
mod cache;
mod candle;
mod config;
mod executor;
mod gaps;
mod ingest;
mod observability;
mod retry;
mod shutdown;
mod store;
mod timeframe;
mod upstream;

pub use analytics::{
    required_candles, round4, volatility_ranking, volume_ranking, Direction, DirectionFilter,
    PriceChange, PricePair, VolatilityItem, VolatilityQuery, VolatilitySort, VolumeItem,
    VolumeQuery, VolumeSort, VolumeTarget, DEFAULT_RANKING_LIMIT, MAX_RANKING_LIMIT,
};
pub use api::{api_router, api_router_with_clock, ApiError, RankingResponse, WELCOME_MESSAGE};
pub use cache::{CacheError, Snapshot, SnapshotCache, DEFAULT_REFRESH_EVERY};
pub use candle::{Candle, SeriesBySymbol};
pub use config::{
    parse_timeframe_list, ApiConfig, ConfigError, FetcherConfig, DEFAULT_API_ADDR,
    DEFAULT_API_HISTORY_LIMIT, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_DB_PATH,
    DEFAULT_FETCHER_HISTORY_LIMIT, DEFAULT_FETCH_INTERVAL_SECONDS, DEFAULT_HTTP_TIMEOUT_MS,
};
pub use executor::{run_bounded, BatchOutcome};
pub use gaps::{
    detect_missing_since, detect_missing_timestamps, group_missing_ranges, latest_closed_boundary,
    retention_floor, MissingRange,
};
pub use ingest::{
    incremental_fetch_limit, CycleReport, GapFillMode, IngestError, IngestSettings, Ingestor,
    TimeframeReport,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_app_stop, log_cache_configured,
    log_store_opened, logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use retry::{run_with_retry, RetryPolicy};
pub use shutdown::shutdown_signal;
pub use store::{CandleReader, SqliteCandleStore, StoreError};
pub use timeframe::{
    parse_period, parse_timeframe, period_labels, system_clock, timeframe_labels, Clock, Period,
    Timeframe, TimeframeError, ALL_PERIODS, ALL_TIMEFRAMES, DEFAULT_TIMEFRAMES,
};
pub use upstream::{
    BybitClient, BybitConfig, CancelPhase, KlineRequest, MarketDataSource, TimeWindow,
    UpstreamError, BYBIT_BASE_URL, MAX_PAGE_LIMIT,
};
