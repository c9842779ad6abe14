/// Live Order-Book Maintainer.
///
/// Applies the usual level-2 mutation rule — zero-quantity deletes,
/// existing-price overwrites, new-price inserts-then-truncates — over a
/// sorted `Vec<PriceLevel>` instead of a bounded heap (a `Vec` truncated to
/// `depth` after every insert is simpler and just as cheap at the depths
/// this maintainer runs at). An async context-manager-style lifecycle
/// becomes a `start()`/`Drop` guard pair so release is guaranteed by the
/// borrow checker rather than a `finally`.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::adapter::{EventType, ExchangeAdapter, Message, Side};
use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

/// One side of one product's book, kept sorted and truncated to `depth`
/// after every mutation so reads never need to sort.
#[derive(Debug, Clone)]
struct BookSide {
    side: Side,
    levels: Vec<PriceLevel>,
}

impl BookSide {
    fn new(side: Side) -> Self {
        BookSide {
            side,
            levels: Vec::new(),
        }
    }

    fn apply(&mut self, price: f64, quantity: f64, depth: usize) {
        if quantity == 0.0 {
            self.levels.retain(|level| level.price != price);
            return;
        }

        match self.levels.iter_mut().find(|level| level.price == price) {
            Some(level) => level.quantity = quantity,
            None => self.levels.push(PriceLevel { price, quantity }),
        }

        self.sort();
        self.levels.truncate(depth);
    }

    fn sort(&mut self) {
        match self.side {
            // highest price first
            Side::Bid => self
                .levels
                .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap()),
            // lowest price first
            Side::Ask => self
                .levels
                .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap()),
        }
    }
}

#[derive(Debug, Clone)]
struct OrderBook {
    bids: BookSide,
    asks: BookSide,
}

impl OrderBook {
    fn empty() -> Self {
        OrderBook {
            bids: BookSide::new(Side::Bid),
            asks: BookSide::new(Side::Ask),
        }
    }
}

/// Deep-copied top-`depth` ladder for one product, as emitted in a [`Snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProductBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// A point-in-time, value-copied view across every subscribed product.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub products: HashMap<String, ProductBook>,
}

type Books = Arc<Mutex<HashMap<String, OrderBook>>>;

fn apply_message(books: &Books, message: Message, depth: usize) {
    let mut books = books.lock().unwrap();
    for event in message.events {
        if !matches!(event.event_type, EventType::Snapshot | EventType::Update) {
            continue;
        }
        let Some(book) = books.get_mut(&event.product_id) else {
            continue; // unknown product, silently ignored
        };
        for update in event.updates {
            let side = match update.side {
                Side::Bid => &mut book.bids,
                Side::Ask => &mut book.asks,
            };
            side.apply(update.price, update.new_quantity, depth);
        }
    }
}

/// Owns the level-2 subscription for the lifetime of the value. Dropping
/// it — on any exit path, including a panic unwind in the caller — signals
/// the background task to unsubscribe and close the transport.
pub struct OrderBookMaintainer {
    products: Vec<String>,
    depth: usize,
    frequency_s: f64,
    books: Books,
    task: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl OrderBookMaintainer {
    /// Scoped acquisition of a level-2 subscription.
    pub async fn start<A>(
        adapter: Arc<A>,
        products: Vec<String>,
        depth: usize,
        frequency_s: f64,
    ) -> Result<Self, AdapterError>
    where
        A: ExchangeAdapter + 'static,
    {
        let stream = adapter.subscribe_level2(&products).await?;

        let mut initial = HashMap::with_capacity(products.len());
        for product in &products {
            initial.insert(product.clone(), OrderBook::empty());
        }
        let books: Books = Arc::new(Mutex::new(initial));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_books = books.clone();
        let task_adapter = adapter.clone();
        let task_products = products.clone();
        let task = tokio::spawn(run_message_loop(
            stream,
            task_books,
            depth,
            shutdown_rx,
            task_adapter,
            task_products,
        ));

        Ok(OrderBookMaintainer {
            products,
            depth,
            frequency_s,
            books,
            task: Some(task),
            shutdown: Some(shutdown_tx),
        })
    }

    /// Produces snapshots at `frequency_s` cadence until wall clock reaches
    /// `until`, or indefinitely if `until` is absent.
    pub fn snapshots(&self, until: Option<DateTime<Utc>>) -> impl Stream<Item = Snapshot> + '_ {
        let books = self.books.clone();
        let products = self.products.clone();
        let period = Duration::from_secs_f64(self.frequency_s.max(0.0));

        async_stream::stream! {
            loop {
                if let Some(until) = until {
                    if Utc::now() >= until {
                        break;
                    }
                }
                tokio::time::sleep(period).await;

                let guard = books.lock().unwrap();
                let mut snapshot_products = HashMap::with_capacity(products.len());
                for product in &products {
                    if let Some(book) = guard.get(product) {
                        snapshot_products.insert(
                            product.clone(),
                            ProductBook {
                                bids: book.bids.levels.clone(),
                                asks: book.asks.levels.clone(),
                            },
                        );
                    }
                }
                drop(guard);

                yield Snapshot {
                    timestamp: Utc::now(),
                    products: snapshot_products,
                };
            }
        }
    }
}

async fn run_message_loop<A>(
    stream: crate::adapter::MessageStream,
    books: Books,
    depth: usize,
    shutdown: oneshot::Receiver<()>,
    adapter: Arc<A>,
    products: Vec<String>,
) where
    A: ExchangeAdapter + 'static,
{
    futures_util::pin_mut!(stream);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, unsubscribing and closing level-2 stream");
                break;
            }
            maybe_message = stream.next() => {
                match maybe_message {
                    Some(message) => apply_message(&books, message, depth),
                    None => {
                        tracing::warn!("level-2 stream closed by remote");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = adapter.unsubscribe_level2(&products).await {
        tracing::error!(error = %e, "failed to send unsubscribe frame");
    }
    if let Err(e) = adapter.close().await {
        tracing::error!(error = %e, "failed to close level-2 transport");
    }
}

impl Drop for OrderBookMaintainer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        // Intentionally not joined: Drop cannot await. The background task
        // observes the shutdown signal and exits on its own.
        self.task.take();
    }
}
