use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use cmma::{
    api_router_with_clock, Candle, CandleReader, Clock, SeriesBySymbol, SnapshotCache,
    SqliteCandleStore, StoreError, Timeframe, WELCOME_MESSAGE,
};
use serde_json::Value;
use tower::util::ServiceExt;

const MINUTE: i64 = 60_000;
const NOW: i64 = 1_700_000_000_000 - 1_700_000_000_000 % MINUTE;

fn candle(ts: i64, close: f64, volume: f64) -> Candle {
    Candle {
        timestamp_ms: ts,
        open: close,
        high: close,
        low: close,
        close,
        volume,
        turnover: close * volume,
    }
}

fn seeded_store() -> SqliteCandleStore {
    let store = SqliteCandleStore::open_in_memory().unwrap();
    store.ensure_schema(&[Timeframe::M1, Timeframe::H1]).unwrap();

    let mut rows = SeriesBySymbol::new();
    rows.insert(
        "BTCUSDT".to_string(),
        vec![
            candle(NOW - MINUTE, 110.0, 2.0),
            candle(NOW - 2 * MINUTE, 100.0, 3.0),
            candle(NOW - 3 * MINUTE, 100.0, 4.0),
        ],
    );
    rows.insert(
        "ETHUSDT".to_string(),
        vec![
            candle(NOW - MINUTE, 95.0, 10.0),
            candle(NOW - 2 * MINUTE, 100.0, 10.0),
        ],
    );
    rows.insert(
        "XRPUSDT".to_string(),
        vec![
            candle(NOW - MINUTE, 1.001, 1000.0),
            candle(NOW - 2 * MINUTE, 1.0, 1000.0),
        ],
    );
    rows.insert("NEWUSDT".to_string(), vec![candle(NOW - MINUTE, 5.0, 1.0)]);
    store.upsert(Timeframe::M1, &rows).unwrap();
    store
}

fn app_with(reader: Arc<dyn CandleReader>, history_limit: usize) -> Router {
    let cache = SnapshotCache::new(reader, history_limit, Duration::from_secs(5));
    let clock: Clock = Arc::new(|| NOW);
    api_router_with_clock(cache, clock)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn root_returns_welcome_message() {
    let app = app_with(Arc::new(seeded_store()), 5);
    let (status, body) = get_json(app, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], WELCOME_MESSAGE);
}

#[tokio::test]
async fn volatility_ranks_by_percent_change() {
    let app = app_with(Arc::new(seeded_store()), 5);
    let (status, body) = get_json(app, "/volatility?timeframe=1m&threshold=1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    let first = &body["data"][0];
    assert_eq!(first["symbol"], "BTCUSDT");
    assert_eq!(first["timeframe"], "1m");
    assert_eq!(first["candle_ts"], NOW - MINUTE);
    assert_eq!(first["price"]["close"], 110.0);
    assert_eq!(first["price"]["prev_close"], 100.0);
    assert_eq!(first["change"]["pct"], 10.0);
    assert_eq!(first["change"]["direction"], "up");
    assert_eq!(body["data"][1]["symbol"], "ETHUSDT");
    assert_eq!(body["data"][1]["change"]["direction"], "down");
}

#[tokio::test]
async fn volatility_honours_offset_direction_and_limit() {
    let store = Arc::new(seeded_store());

    let (_, body) = get_json(
        app_with(store.clone(), 5),
        "/volatility?timeframe=1m&threshold=0.05&direction=up&limit=1",
    )
    .await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["symbol"], "BTCUSDT");

    let (_, body) = get_json(
        app_with(store, 5),
        "/volatility?timeframe=1m&threshold=1&offset=2",
    )
    .await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["symbol"], "BTCUSDT");
    assert_eq!(body["data"][0]["price"]["prev_close"], 100.0);
}

#[tokio::test]
async fn volume_sums_period_and_filters_on_turnover() {
    let app = app_with(Arc::new(seeded_store()), 1_000);
    let (status, body) = get_json(
        app,
        "/volume?timeframe=1m&period=1h&min_volume=1000&sort=turnover_desc",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["data"][0]["symbol"], "XRPUSDT");
    assert_eq!(body["data"][0]["total_volume"], 2000.0);
    assert_eq!(body["data"][0]["period"], "1h");
    assert_eq!(body["data"][1]["symbol"], "ETHUSDT");
    assert_eq!(body["data"][1]["total_turnover"], 1950.0);
}

#[tokio::test]
async fn volume_rejects_periods_beyond_retained_history() {
    let app = app_with(Arc::new(seeded_store()), 5);
    let (status, body) = get_json(app, "/volume?timeframe=1m&period=1h").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INSUFFICIENT_HISTORY");
    assert!(body["error"]["message"].as_str().unwrap().contains("60 candles"));
}

#[tokio::test]
async fn invalid_parameters_map_to_error_codes() {
    let store = Arc::new(seeded_store());
    let cases = [
        ("/volatility?timeframe=2m&threshold=1", StatusCode::BAD_REQUEST, "INVALID_TIMEFRAME"),
        ("/volatility?threshold=1", StatusCode::BAD_REQUEST, "INVALID_TIMEFRAME"),
        ("/volatility?timeframe=1m", StatusCode::UNPROCESSABLE_ENTITY, "INVALID_INPUT"),
        (
            "/volatility?timeframe=1m&threshold=1&limit=501",
            StatusCode::UNPROCESSABLE_ENTITY,
            "INVALID_INPUT",
        ),
        ("/volume?timeframe=1m&period=2h", StatusCode::BAD_REQUEST, "INVALID_PERIOD"),
        (
            "/volume?timeframe=1h&period=1h&min_volume_target=both",
            StatusCode::UNPROCESSABLE_ENTITY,
            "INVALID_INPUT",
        ),
    ];

    for (uri, expected_status, expected_code) in cases {
        let (status, body) = get_json(app_with(store.clone(), 1_000), uri).await;
        assert_eq!(status, expected_status, "{uri}");
        assert_eq!(body["error"]["code"], expected_code, "{uri}");
    }
}

struct BrokenReader;

impl CandleReader for BrokenReader {
    fn latest_candles_per_symbol(
        &self,
        _timeframe: Timeframe,
        _limit: usize,
    ) -> Result<SeriesBySymbol, StoreError> {
        Err(StoreError::LockPoisoned)
    }
}

#[tokio::test]
async fn cold_cache_failure_is_internal_error() {
    let app = app_with(Arc::new(BrokenReader), 5);
    let (status, body) = get_json(app, "/volatility?timeframe=1m&threshold=1").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
}
