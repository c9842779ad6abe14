/// Historical Backfill Engine.
///
/// Re-expresses a generator-of-generators fetch loop as a single
/// `async_stream` pull-based stream holding the symbol index, cursor, and
/// last-emitted timestamp as explicit state. Products are processed strictly
/// sequentially — the stream never interleaves two products' requests.
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use futures_util::Stream;
use thiserror::Error;

use crate::adapter::{ExchangeAdapter, FetchOutcome};
use crate::bisection::first_occurrence_async;
use crate::candle::{CandleBatch, Granularity};

const DEFAULT_START_DATE: &str = "2012-01-01";
const BISECTION_MAX_DEPTH: u32 = 32;

/// One `{product, start_date?, end_date?, granularity}` request.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub product: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub granularity: Granularity,
}

impl BackfillRequest {
    pub fn new(product: impl Into<String>, granularity: Granularity) -> Self {
        BackfillRequest {
            product: product.into(),
            start_date: None,
            end_date: None,
            granularity,
        }
    }
}

/// The only error surface the engine exposes to its caller: invariant
/// violations. Per-request transport failures never reach this type — they
/// are reduced to [`FetchOutcome`] tags.
#[derive(Debug, Error, PartialEq)]
pub enum BackfillError {
    #[error("invalid range for {product}: start ({start}) is after end ({end})")]
    InvalidRange {
        product: String,
        start: i64,
        end: i64,
    },
}

fn parse_date_to_epoch(date_str: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()?;
    let datetime = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&datetime).timestamp())
}

/// Normalizes a request's optional start/end dates to epoch seconds,
/// clamping `end` to "now" if it is absent or in the future.
fn normalize_range(request: &BackfillRequest, now: DateTime<Utc>) -> Option<(i64, i64)> {
    let start_str = request
        .start_date
        .as_deref()
        .unwrap_or(DEFAULT_START_DATE);
    let start_ts = parse_date_to_epoch(start_str)?;

    let end_ts = match &request.end_date {
        Some(end_str) => {
            let parsed = parse_date_to_epoch(end_str)?;
            parsed.min(now.timestamp())
        }
        None => now.timestamp(),
    };

    Some((start_ts, end_ts))
}

fn is_current_month(ts: i64, now: DateTime<Utc>) -> bool {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.year() == now.year() && dt.month() == now.month(),
        None => false,
    }
}

/// [DISCOVER] phase: locates the earliest discoverable timestamp with data
/// via bounded bisection. Not guaranteed to be the exact first candle —
/// precision is bounded by the recursion depth, not by the granularity.
async fn discover_first_occurrence<A: ExchangeAdapter>(
    adapter: &A,
    product: &str,
    start_ts: i64,
    end_ts: i64,
    granularity: Granularity,
    window_span: i64,
) -> Option<i64> {
    let mut condition = |candidate: i64| {
        let product = product.to_string();
        async move {
            let window_end = candidate + window_span;
            matches!(
                adapter
                    .fetch_candles(&product, candidate, window_end, granularity)
                    .await,
                FetchOutcome::Ok(_)
            )
        }
    };

    first_occurrence_async(&mut condition, start_ts, end_ts, BISECTION_MAX_DEPTH).await
}

/// [STREAM] phase: advances a windowed cursor from `cursor` to `end_ts` (or
/// until the current calendar month is reached), yielding one
/// [`CandleBatch`] per successful window and classifying every response
/// into the fixed response taxonomy.
fn stream_from_cursor<'a, A: ExchangeAdapter>(
    adapter: &'a A,
    product: &'a str,
    mut cursor: i64,
    end_ts: i64,
    granularity: Granularity,
    window_span: i64,
    now: DateTime<Utc>,
) -> impl Stream<Item = CandleBatch> + 'a {
    let granularity_secs = granularity.seconds();
    let rate_delay = Duration::from_secs_f64(1.0 / adapter.default_rate_limit_hz());

    async_stream::stream! {
        loop {
            if cursor > end_ts {
                tracing::info!(product, "reached end of requested range");
                break;
            }
            if is_current_month(cursor, now) {
                tracing::info!(product, "reached current month, switching to next product");
                break;
            }

            let window_end = (cursor + window_span).min(end_ts);
            let outcome = adapter
                .fetch_candles(product, cursor, window_end, granularity)
                .await;

            match outcome {
                FetchOutcome::Ok(batch) => {
                    let max_ts = batch.max_timestamp();
                    let mut next_cursor = max_ts + granularity_secs;
                    if next_cursor <= cursor {
                        tracing::warn!(product, cursor, "cursor stuck, forcing progress");
                        next_cursor = cursor + granularity_secs;
                    }
                    cursor = next_cursor;
                    yield batch;
                    tokio::time::sleep(rate_delay).await;
                }
                FetchOutcome::NotFound => {
                    tracing::error!(product, "product not found, terminating symbol");
                    break;
                }
                FetchOutcome::RateLimited => {
                    tracing::warn!(product, cursor, "rate limited, backing off and retrying window");
                    tokio::time::sleep(rate_delay).await;
                }
                FetchOutcome::ServerError => {
                    tracing::error!(product, cursor, "server error, backing off and retrying window");
                    tokio::time::sleep(rate_delay).await;
                }
                FetchOutcome::TimeoutError => {
                    tracing::error!(product, cursor, "timeout, skipping window");
                    cursor += window_span;
                }
                FetchOutcome::ApiFailure => {
                    tracing::error!(product, cursor, "api failure, skipping window");
                    cursor += window_span;
                }
                FetchOutcome::NoData => {
                    tracing::debug!(product, cursor, "no data, advancing one granularity");
                    cursor += granularity_secs;
                }
            }
        }
    }
}

/// Runs the Backfill Engine over `requests`, yielding a finite lazy
/// sequence of [`CandleBatch`]es. Per-request transport failures never
/// surface as stream errors; only an invariant violation does, and it
/// terminates the entire stream immediately.
pub fn fetch<A>(
    adapter: Arc<A>,
    requests: Vec<BackfillRequest>,
) -> impl Stream<Item = Result<CandleBatch, BackfillError>>
where
    A: ExchangeAdapter + 'static,
{
    try_stream! {
        for request in requests {
            let now = Utc::now();
            let Some((start_ts, end_ts)) = normalize_range(&request, now) else {
                tracing::error!(product = %request.product, "unparseable date in backfill request");
                continue;
            };

            if start_ts > end_ts {
                Err(BackfillError::InvalidRange {
                    product: request.product.clone(),
                    start: start_ts,
                    end: end_ts,
                })?;
            }

            if start_ts == end_ts {
                tracing::info!(product = %request.product, "empty range requested, nothing to do");
                continue;
            }

            let max_candles = adapter.max_candles() as i64;
            let granularity_secs = request.granularity.seconds();
            let window_span = max_candles * granularity_secs;
            // The bisection probe window is a `MAX_CANDLES`-minute span,
            // independent of the requested granularity — not the
            // granularity-scaled streaming window. Conflating the two
            // would probe 300-day windows for a daily granularity instead
            // of 300-minute ones, destroying discovery precision.
            let bisection_window = max_candles * 60;

            tracing::info!(product = %request.product, start_ts, end_ts, "seeking first occurrence of data");

            let discovered = discover_first_occurrence(
                adapter.as_ref(),
                &request.product,
                start_ts,
                end_ts,
                request.granularity,
                bisection_window,
            )
            .await;

            let Some(cursor) = discovered else {
                tracing::error!(product = %request.product, "no historical data found within range");
                continue;
            };

            tracing::info!(product = %request.product, cursor, "discovered first occurrence, streaming history");

            let symbol_stream = stream_from_cursor(
                adapter.as_ref(),
                &request.product,
                cursor,
                end_ts,
                request.granularity,
                window_span,
                now,
            );
            futures_util::pin_mut!(symbol_stream);
            while let Some(batch) = futures_util::StreamExt::next(&mut symbol_stream).await {
                yield batch;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MessageStream;
    use crate::candle::Candle;
    use crate::error::AdapterError;
    use futures_util::StreamExt;
    use std::sync::Mutex;

    fn candle_at(t: i64) -> Candle {
        Candle::new(t, 1.0, 1.0, 1.0, 1.0, 1.0)
    }

    struct ScriptedAdapter {
        max_candles: u32,
        responses: Mutex<Vec<FetchOutcome>>,
    }

    #[async_trait::async_trait]
    impl ExchangeAdapter for ScriptedAdapter {
        fn max_candles(&self) -> u32 {
            self.max_candles
        }
        fn default_rate_limit_hz(&self) -> f64 {
            1000.0
        }
        fn default_timeout_secs(&self) -> u64 {
            1
        }
        async fn fetch_candles(
            &self,
            _product: &str,
            _start: i64,
            _end: i64,
            _granularity: Granularity,
        ) -> FetchOutcome {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                FetchOutcome::NoData
            } else {
                responses.remove(0)
            }
        }
        async fn subscribe_level2(
            &self,
            _products: &[String],
        ) -> Result<MessageStream, AdapterError> {
            unimplemented!("not exercised by backfill tests")
        }
        async fn unsubscribe_level2(&self, _products: &[String]) -> Result<(), AdapterError> {
            unimplemented!("not exercised by backfill tests")
        }
        async fn close(&self) -> Result<(), AdapterError> {
            unimplemented!("not exercised by backfill tests")
        }
    }

    // --- fetch()-level tests: range normalization and invariant checks ---

    #[tokio::test]
    async fn start_equals_end_emits_nothing() {
        let adapter = Arc::new(ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![]),
        });
        let request = BackfillRequest {
            product: "BTC-USD".to_string(),
            start_date: Some("2020-01-01".to_string()),
            end_date: Some("2020-01-01".to_string()),
            granularity: Granularity::OneMinute,
        };
        let stream = fetch(adapter, vec![request]);
        tokio::pin!(stream);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn start_after_end_is_invariant_error() {
        let adapter = Arc::new(ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![]),
        });
        let request = BackfillRequest {
            product: "BTC-USD".to_string(),
            start_date: Some("2020-06-01".to_string()),
            end_date: Some("2020-01-01".to_string()),
            granularity: Granularity::OneMinute,
        };
        let stream = fetch(adapter, vec![request]);
        tokio::pin!(stream);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(BackfillError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn not_found_during_discovery_emits_zero_batches() {
        let adapter = Arc::new(ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![]),
        });
        let request = BackfillRequest {
            product: "ZZZ-NEVER".to_string(),
            start_date: Some("2020-01-01".to_string()),
            end_date: Some("2020-01-02".to_string()),
            granularity: Granularity::OneMinute,
        };
        let stream = fetch(adapter, vec![request]);
        tokio::pin!(stream);
        assert!(stream.next().await.is_none());
    }

    // --- stream_from_cursor()-level tests: exercise the STREAM state machine directly ---

    #[tokio::test]
    async fn ok_response_emits_batch_and_advances_cursor_monotonically() {
        let batch_one = CandleBatch::from_unsorted("BTC-USD", vec![candle_at(1_000_000_000)]).unwrap();
        let batch_two = CandleBatch::from_unsorted("BTC-USD", vec![candle_at(1_000_001_000)]).unwrap();
        let adapter = ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![
                FetchOutcome::Ok(batch_one.clone()),
                FetchOutcome::Ok(batch_two.clone()),
            ]),
        };
        let now = Utc::now();
        let stream = stream_from_cursor(
            &adapter,
            "BTC-USD",
            999_999_000,
            1_000_002_000,
            Granularity::OneMinute,
            300 * 60,
            now,
        );
        tokio::pin!(stream);

        let first = stream.next().await.unwrap();
        assert_eq!(first, batch_one);
        let second = stream.next().await.unwrap();
        assert_eq!(second, batch_two);
    }

    #[tokio::test]
    async fn timeout_then_success_skips_one_window_without_duplicating() {
        let batch = CandleBatch::from_unsorted("BTC-USD", vec![candle_at(2_000_000_000)]).unwrap();
        let adapter = ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![FetchOutcome::TimeoutError, FetchOutcome::Ok(batch.clone())]),
        };
        let now = Utc::now();
        let stream = stream_from_cursor(
            &adapter,
            "BTC-USD",
            1_000_000_000,
            3_000_000_000,
            Granularity::OneMinute,
            300 * 60,
            now,
        );
        tokio::pin!(stream);

        let first = stream.next().await.unwrap();
        assert_eq!(first, batch);
    }

    #[tokio::test]
    async fn not_found_terminates_without_emitting() {
        let adapter = ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![FetchOutcome::NotFound]),
        };
        let now = Utc::now();
        let stream = stream_from_cursor(
            &adapter,
            "BTC-USD",
            1_000_000_000,
            3_000_000_000,
            Granularity::OneMinute,
            300 * 60,
            now,
        );
        tokio::pin!(stream);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn rate_limited_then_server_error_then_success_retries_same_window() {
        let batch = CandleBatch::from_unsorted("BTC-USD", vec![candle_at(1_000_000_000)]).unwrap();
        let adapter = ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![
                FetchOutcome::RateLimited,
                FetchOutcome::ServerError,
                FetchOutcome::Ok(batch.clone()),
            ]),
        };
        let now = Utc::now();
        let stream = stream_from_cursor(
            &adapter,
            "BTC-USD",
            1_000_000_000,
            3_000_000_000,
            Granularity::OneMinute,
            300 * 60,
            now,
        );
        tokio::pin!(stream);
        let first = stream.next().await.unwrap();
        // the same window is retried, so the first emitted batch still starts at the cursor
        assert_eq!(first, batch);
    }

    #[tokio::test]
    async fn cursor_never_decreases_across_iterations() {
        let batches: Vec<CandleBatch> = (0..5)
            .map(|i| {
                CandleBatch::from_unsorted("BTC-USD", vec![candle_at(1_000_000_000 + i * 60)]).unwrap()
            })
            .collect();
        let adapter = ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(batches.iter().cloned().map(FetchOutcome::Ok).collect()),
        };
        let now = Utc::now();
        let stream = stream_from_cursor(
            &adapter,
            "BTC-USD",
            1_000_000_000,
            1_000_000_900,
            Granularity::OneMinute,
            300 * 60,
            now,
        );
        tokio::pin!(stream);

        let mut last_ts = i64::MIN;
        while let Some(batch) = stream.next().await {
            assert!(batch.max_timestamp() >= last_ts);
            last_ts = batch.max_timestamp();
        }
    }

    #[tokio::test]
    async fn all_data_in_one_window_emits_single_batch_then_terminates() {
        // The whole requested range fits in one probe window and the
        // response covers it entirely, so the cursor should jump straight
        // past `end_ts` and the stream should yield exactly one batch.
        let end_ts = 1_000_000_900;
        let batch = CandleBatch::from_unsorted("BTC-USD", vec![candle_at(end_ts - 60)]).unwrap();
        let adapter = ScriptedAdapter {
            max_candles: 300,
            responses: Mutex::new(vec![FetchOutcome::Ok(batch.clone())]),
        };
        let now = Utc::now();
        let stream = stream_from_cursor(
            &adapter,
            "BTC-USD",
            1_000_000_000,
            end_ts,
            Granularity::OneMinute,
            300 * 60,
            now,
        );
        tokio::pin!(stream);

        let first = stream.next().await.unwrap();
        assert_eq!(first, batch);
        assert!(stream.next().await.is_none());
    }
}
