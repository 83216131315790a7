use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::kalshi::auth::{now_timestamp_ms, RequestSigner};
use crate::kalshi::OrderSide;

const HEARTBEAT_SECS: u64 = 10;
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const EVENT_BUFFER: usize = 256;

/// Events surfaced from the order-book stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    OrderbookSnapshot {
        ticker: String,
        yes: Vec<(i64, i64)>,
        no: Vec<(i64, i64)>,
    },
    OrderbookDelta {
        ticker: String,
        side: OrderSide,
        price_cents: i64,
        delta: i64,
    },
    Ticker {
        ticker: String,
        yes_bid_cents: Option<i64>,
        yes_ask_cents: Option<i64>,
        last_price_cents: Option<i64>,
    },
    Fill {
        ticker: String,
        order_id: String,
        side: OrderSide,
        count: i64,
    },
}

/// Backoff before reconnect attempt `attempt` (1-based): 2, 4, 8, 16, 32 s.
pub fn reconnect_delay_secs(attempt: u32) -> u64 {
    2u64.pow(attempt.min(6))
}

/// Subscribe command covering the recorded market tickers.
pub fn subscribe_command(cmd_id: u64, tickers: &[String]) -> Value {
    json!({
        "id": cmd_id,
        "cmd": "subscribe",
        "params": {
            "channels": ["orderbook_delta", "ticker", "fill"],
            "market_tickers": tickers,
        }
    })
}

fn parse_side(v: &Value) -> Option<OrderSide> {
    match v.as_str()? {
        "yes" => Some(OrderSide::Yes),
        "no" => Some(OrderSide::No),
        _ => None,
    }
}

fn parse_levels(v: &Value) -> Vec<(i64, i64)> {
    v.as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let pair = row.as_array()?;
                    Some((pair.first()?.as_i64()?, pair.get(1)?.as_i64()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one text frame into a stream event. Unknown frame types (command
/// acks, errors) return None and are logged by the caller.
pub fn parse_stream_message(text: &str) -> Option<StreamEvent> {
    let v: Value = serde_json::from_str(text).ok()?;
    let msg = &v["msg"];
    let ticker = msg["market_ticker"].as_str()?.to_string();
    match v["type"].as_str()? {
        "orderbook_snapshot" => Some(StreamEvent::OrderbookSnapshot {
            ticker,
            yes: parse_levels(&msg["yes"]),
            no: parse_levels(&msg["no"]),
        }),
        "orderbook_delta" => Some(StreamEvent::OrderbookDelta {
            ticker,
            side: parse_side(&msg["side"])?,
            price_cents: msg["price"].as_i64()?,
            delta: msg["delta"].as_i64()?,
        }),
        "ticker" => Some(StreamEvent::Ticker {
            ticker,
            yes_bid_cents: msg["yes_bid"].as_i64().filter(|p| *p > 0),
            yes_ask_cents: msg["yes_ask"].as_i64().filter(|p| *p > 0),
            last_price_cents: msg["price"].as_i64().filter(|p| *p > 0),
        }),
        "fill" => Some(StreamEvent::Fill {
            ticker,
            order_id: msg["order_id"].as_str()?.to_string(),
            side: parse_side(&msg["side"])?,
            count: msg["count"].as_i64()?,
        }),
        _ => None,
    }
}

/// Live order-book stream: connect → subscribe → heartbeat → listen.
///
/// Every subscription is recorded so a reconnect re-issues all of them. A
/// disconnect run past the attempt ceiling surfaces as a fatal
/// ConnectionError; the caller falls back to REST polling and schedules
/// the next connect.
pub struct MarketStream {
    ws_url: String,
    signer: Arc<RequestSigner>,
    subscriptions: Vec<String>,
    events_tx: mpsc::Sender<StreamEvent>,
    next_cmd_id: u64,
}

impl MarketStream {
    pub fn new(
        ws_url: &str,
        signer: Arc<RequestSigner>,
        tickers: Vec<String>,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        (
            MarketStream {
                ws_url: ws_url.to_string(),
                signer,
                subscriptions: tickers,
                events_tx,
                next_cmd_id: 1,
            },
            events_rx,
        )
    }

    /// Record another subscription; it takes effect on the next (re)connect.
    pub fn track(&mut self, ticker: String) {
        if !self.subscriptions.contains(&ticker) {
            self.subscriptions.push(ticker);
        }
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Run until the receiver is dropped or reconnects are exhausted. A
    /// successful connect resets the attempt counter.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let mut attempt = 0u32;
        loop {
            match self.connect_and_listen(&mut attempt).await {
                Ok(()) => {
                    // Receiver dropped: orderly shutdown
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        return Err(AgentError::Connection(format!(
                            "stream gave up after {} reconnect attempts: {}",
                            attempt, e
                        )));
                    }
                    let delay = reconnect_delay_secs(attempt);
                    warn!(
                        "Stream disconnected ({}), reconnecting in {}s (attempt {}/{})",
                        e, delay, attempt, MAX_RECONNECT_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    async fn connect_and_listen(&mut self, attempt: &mut u32) -> Result<(), AgentError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Connection(format!("bad WS URL: {}", e)))?;
        for (name, value) in self
            .signer
            .ws_headers(now_timestamp_ms())
            .map_err(|e| AgentError::Auth {
                message: format!("WS signing failed: {}", e),
            })?
        {
            request.headers_mut().insert(
                name,
                value
                    .parse()
                    .map_err(|_| AgentError::Auth {
                        message: "invalid auth header value".into(),
                    })?,
            );
        }

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| AgentError::Connection(format!("WS connect failed: {}", e)))?;
        info!("Stream connected, subscribing {} markets", self.subscriptions.len());
        let (mut write, mut read) = ws.split();

        // Re-issue every recorded subscription
        let cmd = subscribe_command(self.next_cmd_id, &self.subscriptions);
        self.next_cmd_id += 1;
        write
            .send(Message::Text(cmd.to_string()))
            .await
            .map_err(|e| AgentError::Connection(format!("subscribe failed: {}", e)))?;
        *attempt = 0;

        let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| AgentError::Connection(format!("ping failed: {}", e)))?;
                }
                frame = read.next() => {
                    match frame {
                        None => return Err(AgentError::Connection("stream closed".into())),
                        Some(Err(e)) => return Err(AgentError::Connection(e.to_string())),
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_stream_message(&text) {
                                if self.events_tx.send(event).await.is_err() {
                                    // Consumer gone; stop cleanly
                                    return Ok(());
                                }
                            } else {
                                debug!("Ignoring stream frame: {}", text);
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write
                                .send(Message::Pong(payload))
                                .await
                                .map_err(|e| AgentError::Connection(format!("pong failed: {}", e)))?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(AgentError::Connection("server closed stream".into()));
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }
}
