use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::candle::SeriesBySymbol;
use crate::store::CandleReader;
use crate::timeframe::Timeframe;

pub const DEFAULT_REFRESH_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("failed to load {timeframe} snapshot: {message}")]
    Load {
        timeframe: Timeframe,
        message: String,
    },
    #[error("snapshot refresh for {0} ended without a result")]
    RefreshAborted(Timeframe),
    #[error("snapshot cache is shut down")]
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timeframe: Timeframe,
    pub series_by_symbol: SeriesBySymbol,
    pub refreshed_at: DateTime<Utc>,
    loaded_at: Instant,
}

impl Snapshot {
    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn symbol_count(&self) -> usize {
        self.series_by_symbol.len()
    }
}

type RefreshOutcome = Option<Result<Arc<Snapshot>, CacheError>>;

#[derive(Default)]
struct CacheState {
    snapshots: HashMap<Timeframe, Arc<Snapshot>>,
    refreshing: HashMap<Timeframe, watch::Receiver<RefreshOutcome>>,
}

struct Inner {
    reader: Arc<dyn CandleReader>,
    history_limit: usize,
    refresh_every: Duration,
    state: RwLock<CacheState>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<Inner>,
}

enum Plan {
    Serve(Arc<Snapshot>),
    Await(watch::Receiver<RefreshOutcome>),
}

impl SnapshotCache {
    pub fn new(
        reader: Arc<dyn CandleReader>,
        history_limit: usize,
        refresh_every: Duration,
    ) -> Self {
        let refresh_every = if refresh_every.is_zero() {
            DEFAULT_REFRESH_EVERY
        } else {
            refresh_every
        };
        Self::with_exact_interval(reader, history_limit, refresh_every)
    }

    /// Keeps `refresh_every` as given, so a zero interval makes every read
    /// after the first see a stale snapshot.
    pub fn with_exact_interval(
        reader: Arc<dyn CandleReader>,
        history_limit: usize,
        refresh_every: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reader,
                history_limit: history_limit.max(1),
                refresh_every,
                state: RwLock::new(CacheState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn history_limit(&self) -> usize {
        self.inner.history_limit
    }

    pub fn refresh_every(&self) -> Duration {
        self.inner.refresh_every
    }

    pub async fn get_snapshot(&self, timeframe: Timeframe) -> Result<Arc<Snapshot>, CacheError> {
        {
            let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(snapshot) = state.snapshots.get(&timeframe) {
                if self.is_fresh(snapshot) {
                    return Ok(Arc::clone(snapshot));
                }
            }
        }

        let plan = {
            let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
            match state.snapshots.get(&timeframe).cloned() {
                Some(snapshot) if self.is_fresh(&snapshot) => Plan::Serve(snapshot),
                Some(stale) => {
                    if !state.refreshing.contains_key(&timeframe) {
                        self.start_refresh(&mut state, timeframe);
                    }
                    Plan::Serve(stale)
                }
                None => match state.refreshing.get(&timeframe) {
                    Some(rx) => Plan::Await(rx.clone()),
                    None => Plan::Await(self.start_refresh(&mut state, timeframe)),
                },
            }
        };

        match plan {
            Plan::Serve(snapshot) => Ok(snapshot),
            Plan::Await(rx) => await_outcome(timeframe, rx).await,
        }
    }

    pub async fn wait_for_refresh(
        &self,
        timeframe: Timeframe,
    ) -> Option<Result<Arc<Snapshot>, CacheError>> {
        let rx = {
            let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
            state.refreshing.get(&timeframe).cloned()
        }?;
        Some(await_outcome(timeframe, rx).await)
    }

    pub fn is_refreshing(&self, timeframe: Timeframe) -> bool {
        let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        state.refreshing.contains_key(&timeframe)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        snapshot.age() < self.inner.refresh_every
    }

    fn start_refresh(
        &self,
        state: &mut CacheState,
        timeframe: Timeframe,
    ) -> watch::Receiver<RefreshOutcome> {
        let (tx, rx) = watch::channel(None);
        state.refreshing.insert(timeframe, rx.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => Err(CacheError::Shutdown),
                result = inner.load(timeframe) => result,
            };

            {
                let mut state = inner.state.write().unwrap_or_else(PoisonError::into_inner);
                if let Ok(snapshot) = &result {
                    state.snapshots.insert(timeframe, Arc::clone(snapshot));
                }
                state.refreshing.remove(&timeframe);
            }

            match &result {
                Ok(snapshot) => debug!(
                    component = "cache",
                    event = "cache.refresh.finish",
                    timeframe = timeframe.as_str(),
                    symbols = snapshot.symbol_count()
                ),
                Err(err) => warn!(
                    component = "cache",
                    event = "cache.refresh.failed",
                    timeframe = timeframe.as_str(),
                    error = %err
                ),
            }
            let _ = tx.send(Some(result));
        });

        rx
    }
}

impl Inner {
    async fn load(&self, timeframe: Timeframe) -> Result<Arc<Snapshot>, CacheError> {
        let loaded_at = Instant::now();
        let refreshed_at = Utc::now();
        let reader = Arc::clone(&self.reader);
        let limit = self.history_limit;

        let series_by_symbol =
            tokio::task::spawn_blocking(move || reader.latest_candles_per_symbol(timeframe, limit))
                .await
                .map_err(|err| CacheError::Load {
                    timeframe,
                    message: err.to_string(),
                })?
                .map_err(|err| CacheError::Load {
                    timeframe,
                    message: err.to_string(),
                })?;

        Ok(Arc::new(Snapshot {
            timeframe,
            series_by_symbol,
            refreshed_at,
            loaded_at,
        }))
    }
}

async fn await_outcome(
    timeframe: Timeframe,
    mut rx: watch::Receiver<RefreshOutcome>,
) -> Result<Arc<Snapshot>, CacheError> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            let current = rx.borrow().clone();
            return current.unwrap_or(Err(CacheError::RefreshAborted(timeframe)));
        }
    }
}
