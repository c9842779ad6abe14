/// Candle (OHLCV bar) and Candle Batch types.
///
/// A single candle is immutable once constructed; constructing one with
/// violated invariants is a programmer error caught by `debug_assert!`
/// rather than a runtime `Result`, mirroring how the rest of the pipeline
/// treats the six numeric columns as already-validated once they leave the
/// adapter layer.
use serde::{Deserialize, Serialize};

/// One of the six granularities an exchange adapter accepts, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    SixHours,
    OneDay,
}

impl Granularity {
    pub const ALL: [Granularity; 6] = [
        Granularity::OneMinute,
        Granularity::FiveMinutes,
        Granularity::FifteenMinutes,
        Granularity::OneHour,
        Granularity::SixHours,
        Granularity::OneDay,
    ];

    pub fn seconds(self) -> i64 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::FifteenMinutes => 900,
            Granularity::OneHour => 3600,
            Granularity::SixHours => 21_600,
            Granularity::OneDay => 86_400,
        }
    }

    pub fn from_seconds(secs: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.seconds() == secs)
    }
}

/// One OHLCV bar. `t` is epoch seconds, aligned to the batch's granularity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(rename = "timestamp")]
    pub t: i64,
    pub low: f64,
    pub high: f64,
    pub open: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(t: i64, low: f64, high: f64, open: f64, close: f64, volume: f64) -> Self {
        debug_assert!(low <= open && open <= high, "open out of [low, high]");
        debug_assert!(low <= close && close <= high, "close out of [low, high]");
        debug_assert!(volume >= 0.0, "volume must be non-negative");
        Candle {
            t,
            low,
            high,
            open,
            close,
            volume,
        }
    }
}

/// An ordered, non-empty run of candles for a single product, as produced
/// by one REST response. Timestamps are strictly increasing after
/// normalization (ascending sort + dedup happens before construction).
#[derive(Debug, Clone, PartialEq)]
pub struct CandleBatch {
    pub product: String,
    pub data: Vec<Candle>,
}

impl CandleBatch {
    /// Builds a batch from raw, possibly-unsorted candles (exchanges commonly
    /// return newest-first). Returns `None` if the input is empty after
    /// dedup, since an empty batch must never be emitted (§8).
    pub fn from_unsorted(product: impl Into<String>, mut data: Vec<Candle>) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        data.sort_by_key(|c| c.t);
        data.dedup_by_key(|c| c.t);
        Some(CandleBatch {
            product: product.into(),
            data,
        })
    }

    pub fn max_timestamp(&self) -> i64 {
        // `data` is non-empty by construction (see `from_unsorted`).
        self.data.last().expect("non-empty batch").t
    }
}
