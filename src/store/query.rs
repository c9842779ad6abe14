/// Query tier: range reads against the merged partition only.
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::candle::Candle;
use crate::error::StoreError;

use super::compaction;

/// Normalizes any accepted `t_from`/`t_to` shape — integer epoch seconds,
/// float epoch seconds, an ISO-8601 `YYYY-MM-DD[ HH:MM:SS]` string, or a
/// timezone-aware datetime — to integer epoch seconds.
pub trait IntoEpochSeconds {
    fn into_epoch_seconds(self) -> Result<i64, StoreError>;
}

impl IntoEpochSeconds for i64 {
    fn into_epoch_seconds(self) -> Result<i64, StoreError> {
        Ok(self)
    }
}

impl IntoEpochSeconds for f64 {
    fn into_epoch_seconds(self) -> Result<i64, StoreError> {
        Ok(self.floor() as i64)
    }
}

impl IntoEpochSeconds for DateTime<Utc> {
    fn into_epoch_seconds(self) -> Result<i64, StoreError> {
        Ok(self.timestamp())
    }
}

impl IntoEpochSeconds for &str {
    fn into_epoch_seconds(self) -> Result<i64, StoreError> {
        parse_timestamp_str(self)
    }
}

impl IntoEpochSeconds for String {
    fn into_epoch_seconds(self) -> Result<i64, StoreError> {
        parse_timestamp_str(&self)
    }
}

fn parse_timestamp_str(s: &str) -> Result<i64, StoreError> {
    let s = s.trim();

    if let Ok(epoch) = s.parse::<i64>() {
        return Ok(epoch);
    }
    if let Ok(epoch) = s.parse::<f64>() {
        return Ok(epoch.floor() as i64);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive).timestamp());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive).timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let naive = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time");
        return Ok(Utc.from_utc_datetime(&naive).timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).timestamp());
    }

    Err(StoreError::Invariant(format!(
        "unparseable query bound: {s:?}"
    )))
}

/// Returns `product`'s candles with `t_from <= t <= t_to`, ascending. Empty
/// if the product has no merged data yet.
pub fn range<T: IntoEpochSeconds>(
    root: &Path,
    product: &str,
    t_from: T,
    t_to: T,
) -> Result<Vec<Candle>, StoreError> {
    let t_from = t_from.into_epoch_seconds()?;
    let t_to = t_to.into_epoch_seconds()?;

    let path = compaction::merged_path(root, product);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let rows = compaction::read_parquet(&path)?;
    Ok(rows
        .into_iter()
        .filter(|candle| candle.t >= t_from && candle.t <= t_to)
        .collect())
}
