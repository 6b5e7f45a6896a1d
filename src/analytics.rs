use std::cmp::Ordering;

use serde::Serialize;

use crate::candle::SeriesBySymbol;
use crate::timeframe::{Period, Timeframe};

pub const DEFAULT_RANKING_LIMIT: usize = 100;
pub const MAX_RANKING_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionFilter {
    Up,
    Down,
    Both,
}

impl DirectionFilter {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilitySort {
    VolatilityDesc,
    VolatilityAsc,
    SymbolAsc,
}

impl VolatilitySort {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "volatility_desc" => Some(Self::VolatilityDesc),
            "volatility_asc" => Some(Self::VolatilityAsc),
            "symbol_asc" => Some(Self::SymbolAsc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSort {
    VolumeDesc,
    VolumeAsc,
    TurnoverDesc,
    TurnoverAsc,
    SymbolAsc,
}

impl VolumeSort {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "volume_desc" => Some(Self::VolumeDesc),
            "volume_asc" => Some(Self::VolumeAsc),
            "turnover_desc" => Some(Self::TurnoverDesc),
            "turnover_asc" => Some(Self::TurnoverAsc),
            "symbol_asc" => Some(Self::SymbolAsc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeTarget {
    Volume,
    Turnover,
}

impl VolumeTarget {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "volume" => Some(Self::Volume),
            "turnover" => Some(Self::Turnover),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolatilityQuery {
    pub threshold: f64,
    pub offset: usize,
    pub direction: DirectionFilter,
    pub sort: VolatilitySort,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeQuery {
    pub period: Period,
    pub min_volume: f64,
    pub min_volume_target: VolumeTarget,
    pub sort: VolumeSort,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricePair {
    pub close: f64,
    pub prev_close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub pct: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolatilityItem {
    pub symbol: String,
    pub timeframe: &'static str,
    pub candle_ts: i64,
    pub price: PricePair,
    pub change: PriceChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeItem {
    pub symbol: String,
    pub total_volume: f64,
    pub total_turnover: f64,
    pub timeframe: &'static str,
    pub period: &'static str,
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub fn required_candles(period: Period, timeframe: Timeframe) -> i64 {
    period.minutes() / timeframe.step_minutes()
}

pub fn volatility_ranking(
    series: &SeriesBySymbol,
    timeframe: Timeframe,
    query: &VolatilityQuery,
) -> Vec<VolatilityItem> {
    let mut items = Vec::with_capacity(series.len());

    for (symbol, candles) in series {
        if candles.len() <= query.offset {
            continue;
        }
        let latest = &candles[0];
        let prev = &candles[query.offset];
        if prev.close == 0.0 {
            continue;
        }

        let pct = (latest.close - prev.close) / prev.close * 100.0;
        if pct.abs() < query.threshold {
            continue;
        }
        match query.direction {
            DirectionFilter::Up if pct <= 0.0 => continue,
            DirectionFilter::Down if pct >= 0.0 => continue,
            _ => {}
        }

        items.push(VolatilityItem {
            symbol: symbol.clone(),
            timeframe: timeframe.as_str(),
            candle_ts: latest.timestamp_ms,
            price: PricePair {
                close: latest.close,
                prev_close: prev.close,
            },
            change: PriceChange {
                pct: round4(pct),
                direction: if pct > 0.0 { Direction::Up } else { Direction::Down },
            },
        });
    }

    items.sort_by(|a, b| {
        let by_symbol = || a.symbol.cmp(&b.symbol);
        match query.sort {
            VolatilitySort::VolatilityDesc => desc(a.change.pct, b.change.pct).then_with(by_symbol),
            VolatilitySort::VolatilityAsc => asc(a.change.pct, b.change.pct).then_with(by_symbol),
            VolatilitySort::SymbolAsc => by_symbol(),
        }
    });
    items.truncate(query.limit);
    items
}

pub fn volume_ranking(
    series: &SeriesBySymbol,
    timeframe: Timeframe,
    query: &VolumeQuery,
    now_ms: i64,
) -> Vec<VolumeItem> {
    let start_ms = now_ms - query.period.duration_ms();
    let mut items = Vec::with_capacity(series.len());

    for (symbol, candles) in series {
        let recent: Vec<_> = candles
            .iter()
            .take_while(|candle| candle.timestamp_ms >= start_ms)
            .collect();
        if recent.is_empty() {
            continue;
        }

        let total_volume: f64 = recent.iter().map(|c| c.volume).sum();
        let total_turnover: f64 = recent.iter().map(|c| c.turnover).sum();
        if query.min_volume > 0.0 {
            let measured = match query.min_volume_target {
                VolumeTarget::Volume => total_volume,
                VolumeTarget::Turnover => total_turnover,
            };
            if measured <= query.min_volume {
                continue;
            }
        }

        items.push(VolumeItem {
            symbol: symbol.clone(),
            total_volume: round4(total_volume),
            total_turnover: round4(total_turnover),
            timeframe: timeframe.as_str(),
            period: query.period.as_str(),
        });
    }

    items.sort_by(|a, b| {
        let by_symbol = || a.symbol.cmp(&b.symbol);
        match query.sort {
            VolumeSort::VolumeDesc => desc(a.total_volume, b.total_volume).then_with(by_symbol),
            VolumeSort::VolumeAsc => asc(a.total_volume, b.total_volume).then_with(by_symbol),
            VolumeSort::TurnoverDesc => {
                desc(a.total_turnover, b.total_turnover).then_with(by_symbol)
            }
            VolumeSort::TurnoverAsc => {
                asc(a.total_turnover, b.total_turnover).then_with(by_symbol)
            }
            VolumeSort::SymbolAsc => by_symbol(),
        }
    });
    items.truncate(query.limit);
    items
}

fn asc(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

fn desc(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}
