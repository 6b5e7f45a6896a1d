use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::candle::{Candle, SeriesBySymbol};
use crate::executor::run_bounded;
use crate::gaps::{
    detect_missing_since, group_missing_ranges, latest_closed_boundary, retention_floor,
};
use crate::store::{SqliteCandleStore, StoreError};
use crate::timeframe::{system_clock, Clock, Timeframe};
use crate::upstream::{KlineRequest, MarketDataSource, TimeWindow, UpstreamError, MAX_PAGE_LIMIT};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to list symbols: {0}")]
    ListSymbols(#[source] UpstreamError),
    #[error("upstream returned no symbols")]
    NoSymbols,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("blocking store task failed: {0}")]
    Join(String),
    #[error("ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::ListSymbols(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapFillMode {
    Off,
    /// Fill once, on the first cycle that completes after process start.
    Startup,
    Always,
}

impl GapFillMode {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "off" | "false" | "0" => Some(Self::Off),
            "startup" => Some(Self::Startup),
            "always" | "true" | "1" => Some(Self::Always),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Startup => "startup",
            Self::Always => "always",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub timeframes: Vec<Timeframe>,
    pub fetch_interval: Duration,
    pub history_limit: usize,
    pub concurrency_limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeframeReport {
    pub timeframe: Option<Timeframe>,
    pub fetch_limit: usize,
    pub fetched_symbols: usize,
    pub failed_symbols: usize,
    pub persisted_rows: usize,
    pub trimmed_rows: usize,
    pub missing_points: usize,
    pub filled_rows: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub symbols_listed: usize,
    pub gap_fill: bool,
    pub timeframes: Vec<TimeframeReport>,
    pub elapsed_ms: u64,
}

/// Steady-state fetch depth: enough candles to cover one scheduling interval
/// plus two of margin, never more than the retained history.
pub fn incremental_fetch_limit(
    fetch_interval_secs: u64,
    timeframe: Timeframe,
    history_limit: usize,
) -> usize {
    let history_limit = history_limit.max(1);
    let step = timeframe.step_seconds() as u64;
    let interval = if fetch_interval_secs == 0 {
        step
    } else {
        fetch_interval_secs
    };
    let needed = interval.div_ceil(step) as usize + 2;
    needed.max(2).min(history_limit)
}

pub struct Ingestor {
    source: Arc<dyn MarketDataSource>,
    store: Arc<SqliteCandleStore>,
    settings: IngestSettings,
    clock: Clock,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Arc<SqliteCandleStore>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, IngestError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteCandleStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| IngestError::Join(err.to_string()))?
            .map_err(IngestError::from)
    }

    pub async fn run_cycle(
        &self,
        fill_gaps: bool,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, IngestError> {
        let started_at = Utc::now();
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let symbols = self
            .source
            .list_symbols(cancel)
            .await
            .map_err(IngestError::ListSymbols)?;
        if symbols.is_empty() {
            return Err(IngestError::NoSymbols);
        }
        info!(
            component = "ingest",
            event = "ingest.cycle.start",
            symbol_count = symbols.len(),
            timeframe_count = self.settings.timeframes.len(),
            gap_fill = fill_gaps
        );

        let timeframes = self.settings.timeframes.clone();
        self.with_store(move |store| store.ensure_schema(&timeframes))
            .await?;

        let mut reports = Vec::with_capacity(self.settings.timeframes.len());
        for &tf in &self.settings.timeframes {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let mut report = TimeframeReport {
                timeframe: Some(tf),
                ..TimeframeReport::default()
            };
            match self.run_timeframe(tf, &symbols, fill_gaps, cancel, &mut report).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    error!(
                        component = "ingest",
                        event = "ingest.timeframe.failed",
                        timeframe = tf.as_str(),
                        error = %err
                    );
                    report.error = Some(err.to_string());
                }
            }
            reports.push(report);
        }

        let report = CycleReport {
            started_at,
            symbols_listed: symbols.len(),
            gap_fill: fill_gaps,
            timeframes: reports,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            component = "ingest",
            event = "ingest.cycle.finish",
            symbol_count = report.symbols_listed,
            elapsed_ms = report.elapsed_ms,
            failed_timeframes = report.timeframes.iter().filter(|t| t.error.is_some()).count()
        );
        Ok(report)
    }

    async fn run_timeframe(
        &self,
        tf: Timeframe,
        symbols: &[String],
        fill_gaps: bool,
        cancel: &CancellationToken,
        report: &mut TimeframeReport,
    ) -> Result<(), IngestError> {
        let history_limit = self.settings.history_limit;
        let has_rows = self.with_store(move |store| store.has_any_rows(tf)).await?;
        let fetch_limit = if has_rows {
            incremental_fetch_limit(self.settings.fetch_interval.as_secs(), tf, history_limit)
        } else {
            history_limit
        };
        report.fetch_limit = fetch_limit;

        let source = Arc::clone(&self.source);
        let task_cancel = cancel.clone();
        let outcome = run_bounded(
            "fetch_latest",
            symbols.to_vec(),
            self.settings.concurrency_limit,
            cancel,
            move |symbol| {
                let source = Arc::clone(&source);
                let cancel = task_cancel.clone();
                async move {
                    let request = KlineRequest::latest(symbol, tf, fetch_limit);
                    source.fetch_candles(&request, &cancel).await
                }
            },
        )
        .await;
        report.fetched_symbols = outcome.results.len();
        report.failed_symbols = outcome.failed;

        let (persisted, trimmed) = self.persist_and_trim(tf, outcome.results).await?;
        report.persisted_rows = persisted;
        report.trimmed_rows = trimmed;
        info!(
            component = "ingest",
            event = "ingest.timeframe.persisted",
            timeframe = tf.as_str(),
            fetch_limit,
            fetched_symbols = report.fetched_symbols,
            failed_symbols = report.failed_symbols,
            persisted_rows = persisted,
            trimmed_rows = trimmed
        );

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if !fill_gaps {
            return Ok(());
        }
        if !tf.has_regular_grid() {
            info!(
                component = "ingest",
                event = "ingest.gaps.skipped",
                timeframe = tf.as_str(),
                reason = "irregular_grid"
            );
            return Ok(());
        }

        self.backfill_gaps(tf, symbols, cancel, report).await
    }

    async fn persist_and_trim(
        &self,
        tf: Timeframe,
        rows: SeriesBySymbol,
    ) -> Result<(usize, usize), IngestError> {
        let history_limit = self.settings.history_limit;
        self.with_store(move |store| {
            let written = store.upsert(tf, &rows)?;
            let trimmed = store.trim_to_limit(tf, history_limit)?;
            Ok((written, trimmed))
        })
        .await
    }

    async fn backfill_gaps(
        &self,
        tf: Timeframe,
        symbols: &[String],
        cancel: &CancellationToken,
        report: &mut TimeframeReport,
    ) -> Result<(), IngestError> {
        let history_limit = self.settings.history_limit;
        let step_ms = tf.step_ms();
        let stored = self
            .with_store(move |store| store.latest_timestamps_per_symbol(tf, history_limit))
            .await?;

        let listed: HashSet<&str> = symbols.iter().map(String::as_str).collect();
        let now_ms = (self.clock)();
        let mut missing_by_symbol: HashMap<String, Vec<i64>> = HashMap::new();
        for (symbol, timestamps) in stored {
            if !listed.contains(symbol.as_str()) {
                continue;
            }
            let Some(&newest) = timestamps.first() else {
                continue;
            };
            let latest_closed = latest_closed_boundary(now_ms, step_ms, newest);
            let floor = retention_floor(latest_closed, step_ms, history_limit);
            let missing = detect_missing_since(&timestamps, step_ms, now_ms, history_limit, floor);
            if !missing.is_empty() {
                missing_by_symbol.insert(symbol, missing);
            }
        }

        report.missing_points = missing_by_symbol.values().map(Vec::len).sum();
        if missing_by_symbol.is_empty() {
            return Ok(());
        }
        info!(
            component = "ingest",
            event = "ingest.gaps.detected",
            timeframe = tf.as_str(),
            symbols = missing_by_symbol.len(),
            missing_points = report.missing_points
        );

        let targets: Vec<String> = missing_by_symbol.keys().cloned().collect();
        let missing_by_symbol = Arc::new(missing_by_symbol);
        let source = Arc::clone(&self.source);
        let task_cancel = cancel.clone();
        let outcome = run_bounded(
            "fill_gaps",
            targets,
            self.settings.concurrency_limit,
            cancel,
            move |symbol| {
                let source = Arc::clone(&source);
                let cancel = task_cancel.clone();
                let missing = missing_by_symbol.get(&symbol).cloned().unwrap_or_default();
                async move {
                    fetch_missing_rows(source.as_ref(), &symbol, tf, &missing, &cancel).await
                }
            },
        )
        .await;

        let filled_rows: usize = outcome.results.values().map(Vec::len).sum();
        report.filled_rows = filled_rows;
        if filled_rows > 0 {
            let (_, trimmed) = self.persist_and_trim(tf, outcome.results).await?;
            report.trimmed_rows += trimmed;
        }
        if filled_rows < report.missing_points {
            warn!(
                component = "ingest",
                event = "ingest.gaps.unfilled",
                timeframe = tf.as_str(),
                missing_points = report.missing_points,
                filled_rows
            );
        }
        info!(
            component = "ingest",
            event = "ingest.gaps.filled",
            timeframe = tf.as_str(),
            missing_points = report.missing_points,
            filled_rows
        );
        Ok(())
    }

    pub async fn run_scheduler(&self, mode: GapFillMode, cancel: &CancellationToken) {
        let mut startup_fill_pending = mode == GapFillMode::Startup;
        let mut cycles: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let fill_gaps = match mode {
                GapFillMode::Off => false,
                GapFillMode::Startup => startup_fill_pending,
                GapFillMode::Always => true,
            };

            match self.run_cycle(fill_gaps, cancel).await {
                Ok(_) => {
                    startup_fill_pending = false;
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    error!(
                        component = "ingest",
                        event = "ingest.cycle.failed",
                        cycle = cycles,
                        error = %err
                    );
                }
            }
            cycles += 1;

            let elapsed = started.elapsed();
            let wait = self.settings.fetch_interval.saturating_sub(elapsed);
            info!(
                component = "ingest",
                event = "ingest.cycle.wait",
                cycle = cycles,
                elapsed_ms = elapsed.as_millis() as u64,
                wait_ms = wait.as_millis() as u64
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(
            component = "ingest",
            event = "ingest.scheduler.stopped",
            cycles
        );
    }
}

async fn fetch_missing_rows(
    source: &dyn MarketDataSource,
    symbol: &str,
    tf: Timeframe,
    missing: &[i64],
    cancel: &CancellationToken,
) -> Result<Vec<Candle>, UpstreamError> {
    if missing.is_empty() {
        return Ok(Vec::new());
    }

    let step_ms = tf.step_ms();
    let expected: HashSet<i64> = missing.iter().copied().collect();
    let mut collected: BTreeMap<i64, Candle> = BTreeMap::new();

    for range in group_missing_ranges(missing, step_ms) {
        for window in range.page_windows(step_ms, MAX_PAGE_LIMIT) {
            let request = KlineRequest::ranged(
                symbol,
                tf,
                window.timestamps.len(),
                TimeWindow {
                    start_ms: window.start_ms,
                    end_ms: window.end_ms,
                },
            );
            for candle in source.fetch_candles(&request, cancel).await? {
                if expected.contains(&candle.timestamp_ms) {
                    collected.insert(candle.timestamp_ms, candle);
                }
            }
        }
    }

    Ok(collected.into_values().rev().collect())
}
