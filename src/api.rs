use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::analytics::{
    required_candles, volatility_ranking, volume_ranking, DirectionFilter, VolatilityItem,
    VolatilityQuery, VolatilitySort, VolumeItem, VolumeQuery, VolumeSort, VolumeTarget,
    DEFAULT_RANKING_LIMIT, MAX_RANKING_LIMIT,
};
use crate::cache::{CacheError, SnapshotCache};
use crate::timeframe::{
    parse_period, parse_timeframe, period_labels, system_clock, timeframe_labels, Clock, Period,
    Timeframe,
};

pub const WELCOME_MESSAGE: &str = "Welcome to the CMMA API. Query /volatility or /volume.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidTimeframe(String),
    #[error("{0}")]
    InvalidPeriod(String),
    #[error("{0}")]
    InsufficientHistory(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTimeframe(_) => "INVALID_TIMEFRAME",
            Self::InvalidPeriod(_) => "INVALID_PERIOD",
            Self::InsufficientHistory(_) => "INSUFFICIENT_HISTORY",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidTimeframe(_) | Self::InvalidPeriod(_) | Self::InsufficientHistory(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(message) = &self {
            error!(
                component = "api",
                event = "api.request.internal_error",
                error = %message
            );
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct RankingResponse<T> {
    pub count: usize,
    pub data: Vec<T>,
}

impl<T> RankingResponse<T> {
    fn new(data: Vec<T>) -> Self {
        Self {
            count: data.len(),
            data,
        }
    }
}

#[derive(Clone)]
struct ApiState {
    cache: SnapshotCache,
    clock: Clock,
}

pub fn api_router(cache: SnapshotCache) -> Router {
    api_router_with_clock(cache, system_clock())
}

pub fn api_router_with_clock(cache: SnapshotCache, clock: Clock) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/volatility", get(get_volatility))
        .route("/volume", get(get_volume))
        .with_state(ApiState { cache, clock })
}

type Params = HashMap<String, String>;

async fn get_root() -> impl IntoResponse {
    Json(json!({ "message": WELCOME_MESSAGE }))
}

async fn get_volatility(
    State(state): State<ApiState>,
    Query(params): Query<Params>,
) -> Result<Json<RankingResponse<VolatilityItem>>, ApiError> {
    let timeframe = timeframe_param(&params)?;
    let query = volatility_query(&params)?;

    let snapshot = state.cache.get_snapshot(timeframe).await?;
    let items = volatility_ranking(&snapshot.series_by_symbol, timeframe, &query);
    Ok(Json(RankingResponse::new(items)))
}

async fn get_volume(
    State(state): State<ApiState>,
    Query(params): Query<Params>,
) -> Result<Json<RankingResponse<VolumeItem>>, ApiError> {
    let timeframe = timeframe_param(&params)?;
    let period = period_param(&params)?;

    let history_limit = state.cache.history_limit();
    let required = required_candles(period, timeframe);
    if required > history_limit as i64 {
        return Err(ApiError::InsufficientHistory(format!(
            "period {period} at timeframe {timeframe} needs {required} candles, more than the \
             {history_limit} retained; choose a shorter period or a larger timeframe"
        )));
    }

    let query = volume_query(&params, period)?;
    let snapshot = state.cache.get_snapshot(timeframe).await?;
    let items = volume_ranking(&snapshot.series_by_symbol, timeframe, &query, (state.clock)());
    Ok(Json(RankingResponse::new(items)))
}

fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
}

fn timeframe_param(params: &Params) -> Result<Timeframe, ApiError> {
    parse_timeframe(param(params, "timeframe").unwrap_or_default()).map_err(|_| {
        ApiError::InvalidTimeframe(format!(
            "invalid timeframe; valid values: {}",
            timeframe_labels()
        ))
    })
}

fn period_param(params: &Params) -> Result<Period, ApiError> {
    parse_period(param(params, "period").unwrap_or_default()).map_err(|_| {
        ApiError::InvalidPeriod(format!(
            "invalid period; valid values: {}",
            period_labels()
        ))
    })
}

fn positive_f64(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value > 0.0)
}

fn limit_param(params: &Params) -> Result<usize, ApiError> {
    match param(params, "limit") {
        None => Ok(DEFAULT_RANKING_LIMIT),
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|limit| (1..=MAX_RANKING_LIMIT).contains(limit))
            .ok_or_else(|| {
                ApiError::InvalidInput(format!(
                    "limit must be an integer between 1 and {MAX_RANKING_LIMIT}"
                ))
            }),
    }
}

fn volatility_query(params: &Params) -> Result<VolatilityQuery, ApiError> {
    let threshold = param(params, "threshold")
        .and_then(positive_f64)
        .ok_or_else(|| ApiError::InvalidInput("threshold must be a number greater than 0".into()))?;

    let offset = match param(params, "offset") {
        None => 1,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|offset| *offset >= 1)
            .ok_or_else(|| {
                ApiError::InvalidInput("offset must be an integer of at least 1".into())
            })?,
    };

    let direction = DirectionFilter::parse(param(params, "direction").unwrap_or("both"))
        .ok_or_else(|| ApiError::InvalidInput("direction must be one of up, down, both".into()))?;

    let sort = VolatilitySort::parse(param(params, "sort").unwrap_or("volatility_desc"))
        .ok_or_else(|| {
            ApiError::InvalidInput(
                "sort must be one of volatility_desc, volatility_asc, symbol_asc".into(),
            )
        })?;

    Ok(VolatilityQuery {
        threshold,
        offset,
        direction,
        sort,
        limit: limit_param(params)?,
    })
}

fn volume_query(params: &Params, period: Period) -> Result<VolumeQuery, ApiError> {
    let min_volume = match param(params, "min_volume") {
        None => 0.0,
        Some(raw) => positive_f64(raw).ok_or_else(|| {
            ApiError::InvalidInput("min_volume must be a number greater than 0".into())
        })?,
    };

    let target_raw = param(params, "min_volume_target").unwrap_or("turnover");
    let min_volume_target = VolumeTarget::parse(target_raw).ok_or_else(|| {
        ApiError::InvalidInput("min_volume_target must be one of volume, turnover".into())
    })?;

    let sort = VolumeSort::parse(param(params, "sort").unwrap_or("volume_desc")).ok_or_else(|| {
        ApiError::InvalidInput(
            "sort must be one of volume_desc, volume_asc, turnover_desc, turnover_asc, symbol_asc"
                .into(),
        )
    })?;

    Ok(VolumeQuery {
        period,
        min_volume,
        min_volume_target,
        sort,
        limit: limit_param(params)?,
    })
}
