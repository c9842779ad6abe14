/// Thin CLI front-end: argument parsing, config/logging init, and wiring
/// over the core (`backfill`, `orderbook`, `store` modules). No business
/// logic lives here that duplicates the core's invariants.
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use crypto_market_store::adapter::{self, AdapterFactory, ExchangeAdapter};
use crypto_market_store::backfill::BackfillRequest;
use crypto_market_store::candle::Granularity;
use crypto_market_store::config::Config;
use crypto_market_store::error::CliError;
use crypto_market_store::logging;
use crypto_market_store::orderbook::OrderBookMaintainer;
use crypto_market_store::store::ColumnarStore;

#[derive(Parser)]
#[command(name = "crypto-market-store", version, about)]
struct Cli {
    /// Path to a TOML config file (env vars still take precedence).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Exchange adapter to use.
    #[arg(long, global = true, default_value = "coinbase")]
    exchange: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Backfill Engine for one or more comma-separated products.
    Backfill {
        #[arg(long)]
        product: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long, default_value_t = 60)]
        granularity: i64,
        #[arg(long)]
        root: PathBuf,
    },
    /// Run the Order-Book Maintainer, printing snapshots to stdout.
    Watch {
        #[arg(long)]
        product: String,
        #[arg(long, default_value_t = 10)]
        depth: usize,
        #[arg(long, default_value_t = 1.0)]
        frequency: f64,
        #[arg(long)]
        root: PathBuf,
    },
    /// Run a single range query against the merged partition. `--from`/
    /// `--to` accept epoch seconds or an ISO-8601 `YYYY-MM-DD[ HH:MM:SS]`
    /// string.
    Query {
        #[arg(long)]
        product: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    // Best-effort: a `.env` file is a convenience for local runs, never
    // required. Config::load still enforces required fields afterward.
    let _ = dotenvy::dotenv();

    logging::init();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let factory = adapter::lookup(&cli.exchange)?;

    match cli.command {
        Command::Backfill {
            product,
            start,
            end,
            granularity,
            root,
        } => run_backfill(factory, config, product, start, end, granularity, root).await,
        Command::Watch {
            product,
            depth,
            frequency,
            root,
        } => {
            let exchange_adapter: Arc<dyn ExchangeAdapter> = Arc::from(factory(&config));
            run_watch(exchange_adapter, product, depth, frequency, root).await
        }
        Command::Query {
            product,
            from,
            to,
            root,
        } => run_query(product, from, to, root),
    }
}

async fn run_backfill(
    factory: AdapterFactory,
    config: Config,
    product: String,
    start: Option<String>,
    end: Option<String>,
    granularity_secs: i64,
    root: PathBuf,
) -> Result<(), CliError> {
    let granularity =
        Granularity::from_seconds(granularity_secs).unwrap_or(Granularity::OneMinute);
    let store = ColumnarStore::new(root)?;

    let requests: Vec<BackfillRequest> = product
        .split(',')
        .map(str::trim)
        .map(|product| BackfillRequest {
            product: product.to_string(),
            start_date: start.clone(),
            end_date: end.clone(),
            granularity,
        })
        .collect();

    // `fetch_many` builds one adapter instance per product (scoped
    // acquisition/release), not a single instance shared across all of them.
    let stream = adapter::fetch_many(factory, config, requests);
    tokio::pin!(stream);
    while let Some(result) = stream.next().await {
        let batch = result?;
        tracing::info!(product = %batch.product, candles = batch.data.len(), "persisting batch");
        store.write_batch(&batch)?;
    }
    Ok(())
}

async fn run_watch(
    adapter: Arc<dyn ExchangeAdapter>,
    product: String,
    depth: usize,
    frequency: f64,
    root: PathBuf,
) -> Result<(), CliError> {
    // Opened so `watch` shares config/root validation with `backfill`, but
    // snapshots never flow into it — they are not candles.
    let _store = ColumnarStore::new(root)?;

    let products: Vec<String> = product.split(',').map(|p| p.trim().to_string()).collect();
    let maintainer = OrderBookMaintainer::start(adapter, products, depth, frequency).await?;

    let snapshots = maintainer.snapshots(None);
    tokio::pin!(snapshots);
    while let Some(snapshot) = snapshots.next().await {
        print_snapshot(&snapshot);
    }
    Ok(())
}

fn print_snapshot(snapshot: &crypto_market_store::orderbook::Snapshot) {
    for (product, book) in &snapshot.products {
        let best_bid = book.bids.first().map(|l| l.price);
        let best_ask = book.asks.first().map(|l| l.price);
        println!(
            "{} {} bid={:?} ask={:?}",
            snapshot.timestamp.to_rfc3339(),
            product,
            best_bid,
            best_ask
        );
    }
}

fn run_query(product: String, from: String, to: String, root: PathBuf) -> Result<(), CliError> {
    let store = ColumnarStore::new(root)?;
    let rows = store.query(&product, from.as_str(), to.as_str())?;

    println!(
        "{:<25} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "t", "open", "high", "low", "close", "volume"
    );
    for candle in rows {
        let ts: DateTime<Utc> = DateTime::from_timestamp(candle.t, 0).unwrap_or_else(Utc::now);
        println!(
            "{:<25} {:>10} {:>10} {:>10} {:>10} {:>10}",
            ts.to_rfc3339(),
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume
        );
    }
    Ok(())
}
