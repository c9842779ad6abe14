/// Exchange Adapter interface.
///
/// The core depends only on this trait; concrete exchanges are
/// polymorphic over the capability set `{fetch_candles, subscribe_level2}`.
/// A dynamic-dispatch-by-string-name pattern is re-expressed as a registry
/// of factories keyed by exchange name: an unregistered name is a lookup
/// miss, never a panic or a runtime "not implemented" error variant.
pub mod coinbase;

use std::collections::HashMap;
use std::pin::Pin;

use futures_util::Stream;

use crate::candle::{CandleBatch, Granularity};
use crate::error::AdapterError;

/// Every backfill request maps to exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ok(CandleBatch),
    NotFound,
    RateLimited,
    ServerError,
    TimeoutError,
    ApiFailure,
    NoData,
}

/// A single level-2 price-level update, already numerically parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelUpdate {
    pub side: Side,
    pub price: f64,
    pub new_quantity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Snapshot,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookEvent {
    pub event_type: EventType,
    pub product_id: String,
    pub updates: Vec<LevelUpdate>,
}

/// A single level-2 message, already decoded down to its relevant events.
/// Messages on channels other than `l2_data` are filtered out by the
/// adapter before they reach the Order-Book Maintainer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub events: Vec<BookEvent>,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Per-exchange constants, associated rather than instance state, since
/// they never vary across adapter instances of the same exchange.
pub trait ExchangeConstants {
    const MAX_CANDLES: u32;
    const DEFAULT_RATE_LIMIT_HZ: f64;
    const DEFAULT_TIMEOUT_SECS: u64;
}

#[async_trait::async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn max_candles(&self) -> u32;
    fn default_rate_limit_hz(&self) -> f64;
    fn default_timeout_secs(&self) -> u64;

    async fn fetch_candles(
        &self,
        product: &str,
        start: i64,
        end: i64,
        granularity: Granularity,
    ) -> FetchOutcome;

    /// Subscribes to level-2 updates for `products` and returns a stream of
    /// decoded messages. The adapter instance retains whatever connection
    /// state `unsubscribe_level2`/`close` need; the caller is responsible
    /// for calling both on every exit path, not this method directly.
    async fn subscribe_level2(&self, products: &[String]) -> Result<MessageStream, AdapterError>;

    /// Sends an unsubscribe frame for `products` over the connection opened
    /// by `subscribe_level2`. A no-op if no subscription is currently open.
    async fn unsubscribe_level2(&self, products: &[String]) -> Result<(), AdapterError>;

    /// Closes the transport opened by `subscribe_level2`. A no-op if no
    /// subscription is currently open.
    async fn close(&self) -> Result<(), AdapterError>;
}

pub type AdapterFactory = fn(&crate::config::Config) -> Box<dyn ExchangeAdapter>;

/// Registry of adapter factories keyed by exchange name. Only exchanges
/// with a working implementation are present; `binance`, `kraken`, and
/// `robinhood` are deliberately absent rather than registered with a
/// factory that returns an error.
pub fn registry() -> HashMap<&'static str, AdapterFactory> {
    let mut map: HashMap<&'static str, AdapterFactory> = HashMap::new();
    map.insert("coinbase", |config| {
        Box::new(coinbase::CoinbaseAdapter::new(config))
    });
    map
}

pub fn lookup(name: &str) -> Result<AdapterFactory, AdapterError> {
    registry()
        .get(name)
        .copied()
        .ok_or_else(|| AdapterError::UnknownAdapter(name.to_string()))
}

/// Fan-out helper: constructs one fresh adapter instance per product
/// request — scoped acquisition, released as soon as that product's
/// history is caught up — and yields `{product, data}` batches across all
/// products, sequentially, as a single stream. Products are still
/// processed one at a time, matching the Backfill Engine's sequential
/// ordering guarantee; only the adapter instance is now per-product rather
/// than shared.
pub fn fetch_many(
    factory: AdapterFactory,
    config: crate::config::Config,
    requests: Vec<crate::backfill::BackfillRequest>,
) -> impl Stream<Item = Result<CandleBatch, crate::backfill::BackfillError>> + 'static {
    async_stream::try_stream! {
        for request in requests {
            let adapter: std::sync::Arc<dyn ExchangeAdapter> = std::sync::Arc::from(factory(&config));
            let product_stream = crate::backfill::fetch(adapter, vec![request]);
            futures_util::pin_mut!(product_stream);
            while let Some(batch) = futures_util::StreamExt::next(&mut product_stream).await {
                yield batch?;
            }
            // `adapter` is dropped here, before the next product's instance
            // is constructed — the scoped release `fetch_many` is named for.
        }
    }
}
