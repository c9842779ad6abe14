/// Coinbase instantiation of the Exchange Adapter interface.
///
/// Implements the REST candles endpoint (header set, status code taxonomy)
/// and the level-2 websocket channel. This is the one concrete adapter the
/// core ships with; others are registry slots (see `adapter::registry`).
use std::time::Duration;

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::candle::{Candle, CandleBatch, Granularity};
use crate::config::Config;
use crate::error::AdapterError;

use super::{
    BookEvent, EventType, ExchangeAdapter, ExchangeConstants, FetchOutcome, LevelUpdate,
    Message, MessageStream, Side,
};

const CANDLES_URL_TEMPLATE: &str = "https://api.exchange.coinbase.com/products/{}/candles";
const WS_URL: &str = "wss://advanced-trade-ws.coinbase.com";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

pub struct CoinbaseAdapter {
    client: reqwest::Client,
    user_agent: String,
    contact_email: Option<String>,
    app_version: String,
    repo_link: String,
    /// The write half of the currently open level-2 connection, if any.
    /// Populated by `subscribe_level2`, consumed by `unsubscribe_level2`
    /// (to send the unsubscribe frame) and `close` (to take and close it).
    ws_sink: AsyncMutex<Option<WsSink>>,
}

impl ExchangeConstants for CoinbaseAdapter {
    const MAX_CANDLES: u32 = 300;
    const DEFAULT_RATE_LIMIT_HZ: f64 = 8.0;
    const DEFAULT_TIMEOUT_SECS: u64 = 10;
}

impl CoinbaseAdapter {
    pub fn new(config: &Config) -> Self {
        CoinbaseAdapter {
            client: reqwest::Client::new(),
            user_agent: config.user_agent.clone(),
            contact_email: config.email.clone(),
            app_version: config.version.clone(),
            repo_link: config.repo_link.clone(),
            ws_sink: AsyncMutex::new(None),
        }
    }

    fn candles_url(product: &str) -> String {
        CANDLES_URL_TEMPLATE.replace("{}", product)
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for CoinbaseAdapter {
    fn max_candles(&self) -> u32 {
        Self::MAX_CANDLES
    }

    fn default_rate_limit_hz(&self) -> f64 {
        Self::DEFAULT_RATE_LIMIT_HZ
    }

    fn default_timeout_secs(&self) -> u64 {
        Self::DEFAULT_TIMEOUT_SECS
    }

    async fn fetch_candles(
        &self,
        product: &str,
        start: i64,
        end: i64,
        granularity: Granularity,
    ) -> FetchOutcome {
        let Some(start_dt) = DateTime::<Utc>::from_timestamp(start, 0) else {
            return FetchOutcome::ApiFailure;
        };
        let Some(end_dt) = DateTime::<Utc>::from_timestamp(end, 0) else {
            return FetchOutcome::ApiFailure;
        };

        let url = Self::candles_url(product);
        let mut request = self
            .client
            .get(&url)
            .query(&[
                ("start", start_dt.to_rfc3339()),
                ("end", end_dt.to_rfc3339()),
                ("granularity", granularity.seconds().to_string()),
            ])
            .header("User-Agent", &self.user_agent)
            .header("Accept", "application/json")
            .header("X-App-Version", &self.app_version)
            .header("X-Repo-Link", &self.repo_link)
            .timeout(Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS));

        if let Some(email) = &self.contact_email {
            request = request.header("X-Contact-Email", email);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::error!(%product, "timeout fetching candles");
                return FetchOutcome::TimeoutError;
            }
            Err(e) => {
                tracing::error!(%product, error = %e, "network error fetching candles");
                return FetchOutcome::ApiFailure;
            }
        };

        match response.status().as_u16() {
            404 => {
                tracing::error!(%product, "product not found");
                FetchOutcome::NotFound
            }
            429 => {
                tracing::warn!(%product, "rate limited");
                FetchOutcome::RateLimited
            }
            status if status >= 500 => {
                tracing::error!(%product, status, "server error");
                FetchOutcome::ServerError
            }
            200 => {
                let rows: Result<Vec<[f64; 6]>, _> = response.json().await;
                match rows {
                    Ok(rows) if rows.is_empty() => {
                        tracing::debug!(%product, "no data in window");
                        FetchOutcome::NoData
                    }
                    Ok(rows) => {
                        let candles: Vec<Candle> = rows
                            .into_iter()
                            .map(|[t, low, high, open, close, volume]| {
                                Candle::new(t as i64, low, high, open, close, volume)
                            })
                            .collect();
                        match CandleBatch::from_unsorted(product, candles) {
                            Some(batch) => FetchOutcome::Ok(batch),
                            None => FetchOutcome::NoData,
                        }
                    }
                    Err(e) => {
                        tracing::error!(%product, error = %e, "malformed candle response");
                        FetchOutcome::ApiFailure
                    }
                }
            }
            status => {
                tracing::error!(%product, status, "unexpected status");
                FetchOutcome::ApiFailure
            }
        }
    }

    async fn subscribe_level2(&self, products: &[String]) -> Result<MessageStream, AdapterError> {
        let (ws_stream, _) = connect_async(WS_URL).await?;
        let (write, mut read) = ws_stream.split();
        *self.ws_sink.lock().await = Some(write);

        let subscribe_frame = serde_json::json!({
            "type": "subscribe",
            "product_ids": products,
            "channel": "l2_data",
        });

        {
            let mut guard = self.ws_sink.lock().await;
            if let Some(sink) = guard.as_mut() {
                sink.send(WsMessage::Text(subscribe_frame.to_string()))
                    .await?;
            }
        }

        let stream = stream! {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::error!(error = %e, "websocket transport error");
                        break;
                    }
                };

                let WsMessage::Text(text) = msg else { continue };

                match parse_l2_message(&text) {
                    Some(message) => yield message,
                    None => {
                        tracing::error!("malformed or non-l2_data message, skipping");
                        continue;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Sends an unsubscribe frame over the still-open connection from
    /// `subscribe_level2`. A no-op if no subscription is open (e.g. `close`
    /// already ran, or `subscribe_level2` was never called).
    async fn unsubscribe_level2(&self, products: &[String]) -> Result<(), AdapterError> {
        let mut guard = self.ws_sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Ok(());
        };

        let unsubscribe_frame = serde_json::json!({
            "type": "unsubscribe",
            "product_ids": products,
            "channel": "l2_data",
        });
        sink.send(WsMessage::Text(unsubscribe_frame.to_string()))
            .await?;
        Ok(())
    }

    /// Closes the websocket connection opened by `subscribe_level2`, taking
    /// it out of `ws_sink` so a later call is a no-op.
    async fn close(&self) -> Result<(), AdapterError> {
        let mut guard = self.ws_sink.lock().await;
        let Some(mut sink) = guard.take() else {
            return Ok(());
        };
        sink.close().await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    channel: String,
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    product_id: String,
    updates: Vec<WireUpdate>,
}

#[derive(Debug, Deserialize)]
struct WireUpdate {
    side: String,
    price_level: String,
    new_quantity: String,
}

fn parse_l2_message(text: &str) -> Option<Message> {
    let wire: WireMessage = serde_json::from_str(text).ok()?;
    if wire.channel != "l2_data" {
        return None;
    }

    let mut events = Vec::with_capacity(wire.events.len());
    for event in wire.events {
        let event_type = match event.event_type.as_str() {
            "snapshot" => EventType::Snapshot,
            "update" => EventType::Update,
            _ => continue,
        };

        let mut updates = Vec::with_capacity(event.updates.len());
        for update in event.updates {
            let side = match update.side.as_str() {
                "bid" => Side::Bid,
                "ask" => Side::Ask,
                _ => continue,
            };
            let price: f64 = update.price_level.parse().ok()?;
            let new_quantity: f64 = update.new_quantity.parse().ok()?;
            updates.push(LevelUpdate {
                side,
                price,
                new_quantity,
            });
        }

        events.push(BookEvent {
            event_type,
            product_id: event.product_id,
            updates,
        });
    }

    Some(Message { events })
}
