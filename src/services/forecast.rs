//! Consumption-rate forecasting over the ledger's per-consumable series.
//!
//! Rate estimation, in order of preference:
//! 1. EMA over instantaneous rates `|Δ%| / Δdays` (at least 3 observations);
//! 2. least-squares slope of % over days (at least 3 observations);
//! 3. average rate between the last two observations.
//!
//! A non-positive or undefined rate leaves days remaining and the exhaustion
//! date undefined; they are never reported as zero.
//!
//! Under `ZeroLevelPolicy::Depleted` a latest reading of 0% is final: it
//! reports zero days left even when it is the only observation, ahead of the
//! two-observation minimum.

use crate::models::printer::{ConsumableReading, Device};
use crate::services::ledger::{self, LedgerStore};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::str::FromStr;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

pub const CRITICAL_DAYS: f64 = 3.0;
pub const REPLACE_SOON_DAYS: f64 = 7.0;
pub const LOW_STOCK_DAYS: f64 = 15.0;

/// How a 0% observation is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroLevelPolicy {
    /// An ordinary observation.
    Reading,
    /// The consumable is empty now: no projection needed.
    Depleted,
    /// Dropped from the series (some devices report 0% for "unknown").
    Ignore,
}

impl FromStr for ZeroLevelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reading" => Ok(ZeroLevelPolicy::Reading),
            "depleted" => Ok(ZeroLevelPolicy::Depleted),
            "ignore" => Ok(ZeroLevelPolicy::Ignore),
            other => Err(format!(
                "ZERO_LEVEL_POLICY must be one of reading, depleted, ignore (got {:?})",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastSettings {
    pub ema_span: u32,
    pub max_days: f64,
    pub zero_policy: ZeroLevelPolicy,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        ForecastSettings {
            ema_span: 10,
            max_days: 730.0,
            zero_policy: ZeroLevelPolicy::Reading,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMethod {
    InsufficientData,
    Ema,
    LinearRegression,
    TwoPointAverage,
    Depleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTier {
    InsufficientData,
    Depleted,
    Critical,
    ReplaceSoon,
    LowStock,
    Ok,
}

impl AlertTier {
    pub fn label(&self) -> &'static str {
        match self {
            AlertTier::InsufficientData => "insufficient data",
            AlertTier::Depleted => "depleted, replace now",
            AlertTier::Critical => "critical, replace now",
            AlertTier::ReplaceSoon => "replace soon",
            AlertTier::LowStock => "low stock warning",
            AlertTier::Ok => "ok",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub current_percent: Option<f64>,
    /// Percent per day; `None` when no positive rate could be estimated.
    pub daily_rate: Option<f64>,
    pub days_remaining: Option<f64>,
    pub exhaustion_at: Option<DateTime<Utc>>,
    pub method: ForecastMethod,
    pub rate_invalid: bool,
    pub alert: AlertTier,
}

impl ForecastResult {
    fn insufficient(current_percent: Option<f64>) -> Self {
        ForecastResult {
            current_percent,
            daily_rate: None,
            days_remaining: None,
            exhaustion_at: None,
            method: ForecastMethod::InsufficientData,
            rate_invalid: false,
            alert: AlertTier::InsufficientData,
        }
    }
}

/// One output line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRecord {
    pub printer_id: i64,
    pub display_name: String,
    pub group: String,
    pub address: String,
    pub consumable: String,
    #[serde(flatten)]
    pub result: ForecastResult,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    at: DateTime<Utc>,
    days: f64,
    percent: f64,
}

/// Usable observations, ascending, with days measured from the first one.
fn points(series: &[ConsumableReading], policy: ZeroLevelPolicy) -> Vec<Point> {
    let mut usable: Vec<(DateTime<Utc>, f64)> = series
        .iter()
        .filter_map(|r| r.percent().map(|p| (r.captured_at, p)))
        .filter(|(_, p)| policy != ZeroLevelPolicy::Ignore || *p > 0.0)
        .collect();
    usable.sort_by_key(|(at, _)| *at);

    let Some(&(first, _)) = usable.first() else {
        return Vec::new();
    };
    usable
        .into_iter()
        .map(|(at, percent)| Point {
            at,
            days: (at - first).num_milliseconds() as f64 / MILLIS_PER_DAY,
            percent,
        })
        .collect()
}

/// Instantaneous consumption rates between consecutive points.
fn instantaneous_rates(points: &[Point]) -> Vec<f64> {
    points
        .windows(2)
        .filter_map(|w| {
            let dx = w[1].days - w[0].days;
            (dx > 0.0).then(|| (w[1].percent - w[0].percent).abs() / dx)
        })
        .collect()
}

/// Exponentially weighted mean, seeded with the first value; returns the last
/// smoothed value.
pub fn ema(values: &[f64], span: u32) -> Option<f64> {
    let alpha = 2.0 / (f64::from(span.max(1)) + 1.0);
    let mut iter = values.iter().copied().filter(|v| v.is_finite());
    let mut acc = iter.next()?;
    for v in iter {
        acc = alpha * v + (1.0 - alpha) * acc;
    }
    Some(acc)
}

/// Negated least-squares slope of percent over days; `None` when all points
/// share the same day.
fn ols_rate(points: &[Point]) -> Option<f64> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let mean_x = points.iter().map(|p| p.days).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.percent).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.days - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points.iter().map(|p| (p.days - mean_x) * (p.percent - mean_y)).sum();
    Some(-(sxy / sxx))
}

fn two_point_rate(points: &[Point]) -> Option<f64> {
    let [.., older, newer] = points else {
        return None;
    };
    let dx = newer.days - older.days;
    (dx > 0.0).then(|| (older.percent - newer.percent) / dx)
}

pub fn classify(days_remaining: Option<f64>) -> AlertTier {
    match days_remaining {
        None => AlertTier::InsufficientData,
        Some(d) if d <= CRITICAL_DAYS => AlertTier::Critical,
        Some(d) if d <= REPLACE_SOON_DAYS => AlertTier::ReplaceSoon,
        Some(d) if d <= LOW_STOCK_DAYS => AlertTier::LowStock,
        Some(_) => AlertTier::Ok,
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Forecast one (device, consumable) series. Input order does not matter.
pub fn forecast(series: &[ConsumableReading], settings: &ForecastSettings) -> ForecastResult {
    let points = points(series, settings.zero_policy);
    let Some(last) = points.last().copied() else {
        return ForecastResult::insufficient(None);
    };

    if settings.zero_policy == ZeroLevelPolicy::Depleted && last.percent <= 0.0 {
        return ForecastResult {
            current_percent: Some(0.0),
            daily_rate: None,
            days_remaining: Some(0.0),
            exhaustion_at: Some(last.at),
            method: ForecastMethod::Depleted,
            rate_invalid: false,
            alert: AlertTier::Depleted,
        };
    }
    if points.len() < 2 {
        return ForecastResult::insufficient(Some(round_to(last.percent, 1)));
    }

    let mut estimate = None;
    if points.len() >= 3 {
        estimate = ema(&instantaneous_rates(&points), settings.ema_span).map(|r| (r, ForecastMethod::Ema));
        if !matches!(estimate, Some((r, _)) if r > 0.0) {
            estimate = ols_rate(&points).map(|r| (r, ForecastMethod::LinearRegression));
        }
    }
    if estimate.is_none() {
        estimate = two_point_rate(&points).map(|r| (r, ForecastMethod::TwoPointAverage));
    }

    let current = last.percent;
    let (rate, method) = match estimate {
        Some((r, m)) if r.is_finite() && r > 0.0 => (r, m),
        other => {
            let method = other.map(|(_, m)| m).unwrap_or(ForecastMethod::TwoPointAverage);
            debug!("Forecast: no positive rate ({:?}) via {:?}", other.map(|(r, _)| r), method);
            return ForecastResult {
                current_percent: Some(round_to(current, 1)),
                daily_rate: None,
                days_remaining: None,
                exhaustion_at: None,
                method,
                rate_invalid: true,
                alert: AlertTier::InsufficientData,
            };
        }
    };

    let days = (current / rate).min(settings.max_days);
    let exhaustion_at = TimeDelta::try_milliseconds((days * MILLIS_PER_DAY).round() as i64)
        .and_then(|delta| last.at.checked_add_signed(delta));
    let days = round_to(days, 1);

    ForecastResult {
        current_percent: Some(round_to(current, 1)),
        daily_rate: Some(round_to(rate, 4)),
        days_remaining: Some(days),
        exhaustion_at,
        method,
        rate_invalid: false,
        alert: classify(Some(days)),
    }
}

/// Forecast every consumable of every addressed device from the ledger.
///
/// Consumables are the device's expected list plus any other name found in
/// its history.
pub fn forecast_devices<L: LedgerStore>(
    store: &mut L,
    devices: &[Device],
    settings: &ForecastSettings,
    generated_at: DateTime<Utc>,
) -> Result<Vec<ForecastRecord>, String> {
    let mut records = Vec::new();
    for device in devices {
        let Some(address) = device.address.as_deref() else {
            continue;
        };
        let entries = store.entries_for(address)?;

        let mut names: Vec<String> = device.consumables.clone();
        let extra: BTreeSet<&String> = entries
            .iter()
            .flat_map(|e| e.values.keys())
            .filter(|k| !device.consumables.contains(k))
            .collect();
        names.extend(extra.into_iter().cloned());

        for name in names {
            let result = forecast(&ledger::series(&entries, &name), settings);
            records.push(ForecastRecord {
                printer_id: device.printer_id,
                display_name: device.display_name.clone(),
                group: device.group.clone(),
                address: address.to_string(),
                consumable: name,
                result,
                generated_at,
            });
        }
    }

    let urgent = records
        .iter()
        .filter(|r| matches!(r.result.alert, AlertTier::Depleted | AlertTier::Critical | AlertTier::ReplaceSoon))
        .count();
    info!("Forecast: {} record(s), {} needing replacement soon", records.len(), urgent);
    Ok(records)
}

/// Write records as JSON lines to `output` (`-` is stdout).
pub fn write_records(records: &[ForecastRecord], output: &str) -> Result<(), String> {
    if output == "-" {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        write_lines(&mut lock, records).map_err(|e| format!("write forecast to stdout failed: {}", e))
    } else {
        let file = File::create(output).map_err(|e| format!("create {} failed: {}", output, e))?;
        let mut writer = BufWriter::new(file);
        write_lines(&mut writer, records)
            .and_then(|_| writer.flush())
            .map_err(|e| format!("write forecast to {} failed: {}", output, e))
    }
}

fn write_lines<W: Write>(writer: &mut W, records: &[ForecastRecord]) -> io::Result<()> {
    for record in records {
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}
