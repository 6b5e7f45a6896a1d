use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::candle::Candle;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::timeframe::Timeframe;

pub const BYBIT_BASE_URL: &str = "https://api.bybit.com";
pub const MAX_PAGE_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPhase {
    Call,
    Backoff,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },
    #[error("bybit retCode={code} retMsg={message}")]
    Api { code: i64, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("bybit {operation} cancelled ({phase:?})")]
    Cancelled {
        operation: &'static str,
        phase: CancelPhase,
    },
    #[error("bybit {operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<UpstreamError>,
    },
}

impl UpstreamError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: usize,
    pub window: Option<TimeWindow>,
}

impl KlineRequest {
    pub fn latest(symbol: impl Into<String>, timeframe: Timeframe, limit: usize) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            limit,
            window: None,
        }
    }

    pub fn ranged(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        limit: usize,
        window: TimeWindow,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            limit,
            window: Some(window),
        }
    }
}

#[async_trait]
pub trait MarketDataSource: Send + Sync + 'static {
    async fn list_symbols(&self, cancel: &CancellationToken) -> Result<Vec<String>, UpstreamError>;

    /// Candles come back newest first.
    async fn fetch_candles(
        &self,
        request: &KlineRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>, UpstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BybitConfig {
    pub base_url: String,
    pub category: String,
    pub quote_suffix: String,
    pub http_timeout_ms: u64,
    pub page_delay_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            base_url: BYBIT_BASE_URL.to_string(),
            category: "linear".to_string(),
            quote_suffix: "USDT".to_string(),
            http_timeout_ms: 10_000,
            page_delay_ms: 100,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct BybitClient {
    http: reqwest::Client,
    cfg: BybitConfig,
}

impl BybitClient {
    pub fn new(cfg: BybitConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .map_err(|err| UpstreamError::HttpClientBuild(err.to_string()))?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &BybitConfig {
        &self.cfg
    }

    fn instruments_url(&self, cursor: Option<&str>) -> String {
        let mut url = format!(
            "{}/v5/market/instruments-info?category={}&status=Trading&limit={}",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.category,
            MAX_PAGE_LIMIT
        );
        if let Some(cursor) = cursor {
            url.push_str("&cursor=");
            url.push_str(cursor);
        }
        url
    }

    fn kline_url(&self, request: &KlineRequest) -> String {
        let limit = request.limit.clamp(1, MAX_PAGE_LIMIT);
        let mut url = format!(
            "{}/v5/market/kline?category={}&symbol={}&interval={}&limit={}",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.category,
            request.symbol,
            request.timeframe.bybit_interval(),
            limit
        );
        if let Some(window) = request.window {
            url.push_str(&format!("&start={}&end={}", window.start_ms, window.end_ms));
        }
        url
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, UpstreamError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| UpstreamError::Transport(err.to_string()))
    }

    async fn get_instruments_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<InstrumentsResult, UpstreamError> {
        let url = self.instruments_url(cursor);
        let bytes = self.get_bytes(&url).await?;
        let payload: InstrumentsResponse =
            serde_json::from_slice(&bytes).map_err(|err| UpstreamError::Decode(err.to_string()))?;
        check_ret_code(payload.ret_code, &payload.ret_msg)?;
        Ok(payload.result)
    }

    async fn get_klines(&self, request: &KlineRequest) -> Result<Vec<Candle>, UpstreamError> {
        let url = self.kline_url(request);
        let bytes = self.get_bytes(&url).await?;
        let payload: KlineResponse =
            serde_json::from_slice(&bytes).map_err(|err| UpstreamError::Decode(err.to_string()))?;
        check_ret_code(payload.ret_code, &payload.ret_msg)?;

        let total = payload.result.list.len();
        let candles: Vec<Candle> = payload
            .result
            .list
            .iter()
            .filter_map(|row| parse_kline_row(row))
            .collect();
        if candles.len() < total {
            debug!(
                component = "upstream",
                event = "upstream.kline.rows_skipped",
                symbol = %request.symbol,
                timeframe = request.timeframe.as_str(),
                skipped = total - candles.len()
            );
        }
        Ok(candles)
    }
}

#[async_trait]
impl MarketDataSource for BybitClient {
    async fn list_symbols(&self, cancel: &CancellationToken) -> Result<Vec<String>, UpstreamError> {
        let mut symbols = Vec::with_capacity(800);
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = run_with_retry(&self.cfg.retry, "instruments-info", cancel, || {
                self.get_instruments_page(cursor.as_deref())
            })
            .await?;
            pages += 1;

            symbols.extend(
                page.list
                    .into_iter()
                    .map(|item| item.symbol)
                    .filter(|symbol| symbol.ends_with(&self.cfg.quote_suffix)),
            );

            if page.next_page_cursor.is_empty() {
                break;
            }
            cursor = Some(page.next_page_cursor);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(UpstreamError::Cancelled {
                        operation: "instruments-info",
                        phase: CancelPhase::Backoff,
                    });
                }
                _ = tokio::time::sleep(Duration::from_millis(self.cfg.page_delay_ms)) => {}
            }
        }

        info!(
            component = "upstream",
            event = "upstream.symbols.listed",
            symbol_count = symbols.len(),
            pages
        );
        Ok(symbols)
    }

    async fn fetch_candles(
        &self,
        request: &KlineRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>, UpstreamError> {
        run_with_retry(&self.cfg.retry, "kline", cancel, || self.get_klines(request)).await
    }
}

fn check_ret_code(code: i64, message: &str) -> Result<(), UpstreamError> {
    if code != 0 {
        return Err(UpstreamError::Api {
            code,
            message: message.to_string(),
        });
    }
    Ok(())
}

/// Parses `[ts, open, high, low, close, volume, turnover]`; malformed rows
/// yield `None` and are dropped by the caller.
fn parse_kline_row(row: &[String]) -> Option<Candle> {
    if row.len() < 7 {
        return None;
    }
    Some(Candle {
        timestamp_ms: row[0].parse().ok()?,
        open: row[1].parse().ok()?,
        high: row[2].parse().ok()?,
        low: row[3].parse().ok()?,
        close: row[4].parse().ok()?,
        volume: row[5].parse().ok()?,
        turnover: row[6].parse().ok()?,
    })
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: InstrumentsResult,
}

#[derive(Debug, Default, Deserialize)]
struct InstrumentsResult {
    #[serde(default)]
    list: Vec<InstrumentItem>,
    #[serde(rename = "nextPageCursor", default)]
    next_page_cursor: String,
}

#[derive(Debug, Deserialize)]
struct InstrumentItem {
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: KlineResult,
}

#[derive(Debug, Default, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}
