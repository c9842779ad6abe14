/// Typed error taxonomy shared across the crate.
///
/// Per-request backfill failures are never represented here — they are
/// reduced to [`crate::backfill::FetchOutcome`] tags and never escape the
/// engine. These variants cover configuration, storage, and adapter
/// construction failures — the only errors the core is allowed to surface
/// to its caller.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown exchange adapter: {0}")]
    UnknownAdapter(String),
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backfill(#[from] crate::backfill::BackfillError),
}
