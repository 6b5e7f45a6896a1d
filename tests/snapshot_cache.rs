use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cmma::{
    Candle, CandleReader, SeriesBySymbol, SnapshotCache, SqliteCandleStore, StoreError, Timeframe,
};
use tokio::task::JoinSet;

/// Reader that blocks inside the store call until the gate is opened.
struct GatedReader {
    open: Mutex<bool>,
    changed: Condvar,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedReader {
    fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(open),
            changed: Condvar::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn set_open(&self, open: bool) {
        *self.open.lock().unwrap() = open;
        self.changed.notify_all();
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CandleReader for GatedReader {
    fn latest_candles_per_symbol(
        &self,
        timeframe: Timeframe,
        _limit: usize,
    ) -> Result<SeriesBySymbol, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.changed.wait(open).unwrap();
        }
        drop(open);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut out = SeriesBySymbol::new();
        out.insert(
            format!("{}-BTCUSDT", timeframe.as_str()),
            vec![Candle {
                timestamp_ms: call as i64,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: call as f64,
                volume: 1.0,
                turnover: 1.0,
            }],
        );
        Ok(out)
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_start_burst_shares_one_refresh() {
    let reader = GatedReader::new(false);
    let cache = SnapshotCache::new(reader.clone(), 5, Duration::from_secs(60));

    let mut callers = JoinSet::new();
    for _ in 0..100 {
        let cache = cache.clone();
        callers.spawn(async move { cache.get_snapshot(Timeframe::M1).await });
    }

    wait_until(|| reader.calls() == 1).await;
    reader.set_open(true);

    let mut snapshots = Vec::new();
    while let Some(joined) = callers.join_next().await {
        snapshots.push(joined.unwrap().unwrap());
    }

    assert_eq!(snapshots.len(), 100);
    assert_eq!(reader.calls(), 1);
    assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_reads_trigger_a_single_background_refresh() {
    let reader = GatedReader::new(true);
    let cache = SnapshotCache::with_exact_interval(reader.clone(), 5, Duration::ZERO);

    let first = cache.get_snapshot(Timeframe::H1).await.unwrap();
    assert_eq!(reader.calls(), 1);
    reader.set_open(false);

    let mut callers = JoinSet::new();
    for _ in 0..100 {
        let cache = cache.clone();
        callers.spawn(async move { cache.get_snapshot(Timeframe::H1).await });
    }
    while let Some(joined) = callers.join_next().await {
        let served = joined.unwrap().unwrap();
        assert!(Arc::ptr_eq(&served, &first));
    }

    wait_until(|| reader.calls() == 2).await;
    assert!(cache.is_refreshing(Timeframe::H1));
    reader.set_open(true);

    let refreshed = cache.wait_for_refresh(Timeframe::H1).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&refreshed, &first));
    assert_eq!(reader.calls(), 2);
    assert_eq!(reader.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeframes_refresh_independently() {
    let reader = GatedReader::new(false);
    let cache = SnapshotCache::new(reader.clone(), 5, Duration::from_secs(60));

    let (m1_cache, h4_cache) = (cache.clone(), cache.clone());
    let m1 = tokio::spawn(async move { m1_cache.get_snapshot(Timeframe::M1).await });
    let h4 = tokio::spawn(async move { h4_cache.get_snapshot(Timeframe::H4).await });

    wait_until(|| reader.calls() == 2).await;
    assert_eq!(reader.max_in_flight.load(Ordering::SeqCst), 2);
    reader.set_open(true);

    let m1 = m1.await.unwrap().unwrap();
    let h4 = h4.await.unwrap().unwrap();
    assert!(m1.series_by_symbol.contains_key("1m-BTCUSDT"));
    assert!(h4.series_by_symbol.contains_key("4h-BTCUSDT"));
}

#[tokio::test]
async fn refresh_picks_up_new_rows_from_store() {
    let store = Arc::new(SqliteCandleStore::open_in_memory().unwrap());
    store.ensure_schema(&[Timeframe::M5]).unwrap();
    let cache = SnapshotCache::with_exact_interval(store.clone(), 3, Duration::ZERO);

    let empty = cache.get_snapshot(Timeframe::M5).await.unwrap();
    assert_eq!(empty.symbol_count(), 0);

    let mut rows = SeriesBySymbol::new();
    rows.insert(
        "SOLUSDT".to_string(),
        (0..5)
            .map(|i| Candle {
                timestamp_ms: i * 300_000,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: i as f64,
                volume: 1.0,
                turnover: 1.0,
            })
            .collect(),
    );
    store.upsert(Timeframe::M5, &rows).unwrap();

    let stale = cache.get_snapshot(Timeframe::M5).await.unwrap();
    assert!(Arc::ptr_eq(&stale, &empty));

    let refreshed = cache.wait_for_refresh(Timeframe::M5).await.unwrap().unwrap();
    let series = &refreshed.series_by_symbol["SOLUSDT"];
    assert_eq!(series.len(), 3);
    assert_eq!(series[0].timestamp_ms, 4 * 300_000);
    assert!(series.windows(2).all(|w| w[0].timestamp_ms > w[1].timestamp_ms));
}
