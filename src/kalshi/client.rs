use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cities::City;
use crate::errors::AgentError;
use crate::kalshi::auth::{now_timestamp_ms, RequestSigner};
use crate::kalshi::{
    bracket_label, validate_price_cents, Bracket, MarketEvent, MarketStatus, Orderbook,
    OrderRequest, OrderResponse, PositionRow,
};
use crate::rate_limit::TokenBucket;

const API_PREFIX: &str = "/trade-api/v2";
const MAX_READ_RETRIES: u32 = 3;

/// Rate-limited, signed REST client for the exchange. One instance per
/// user; the token bucket wraps every call.
pub struct KalshiClient {
    http: Client,
    base_url: String,
    signer: Arc<RequestSigner>,
    limiter: TokenBucket,
}

impl KalshiClient {
    pub fn new(
        base_url: &str,
        signer: Arc<RequestSigner>,
        rate_per_sec: f64,
        burst: f64,
        timeout_secs: u64,
    ) -> Result<Self, AgentError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AgentError::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(KalshiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            limiter: TokenBucket::new(rate_per_sec, burst),
        })
    }

    /// One signed request. `path` is relative to the API prefix; the signing
    /// string covers the prefixed path without the query string.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        order_endpoint: bool,
    ) -> Result<Value, AgentError> {
        self.limiter.acquire().await;

        let full_path = format!("{}{}", API_PREFIX, path);
        let sign_path = full_path.split('?').next().unwrap_or(&full_path);
        let timestamp_ms = now_timestamp_ms();
        let headers = self
            .signer
            .headers(timestamp_ms, method.as_str(), sign_path)
            .map_err(|e| AgentError::Auth {
                message: format!("signing failed: {}", e),
            })?;

        let url = format!("{}{}", self.base_url, full_path);
        let mut req = self.http.request(method, &url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))?;
        let status = resp.status();

        if status.is_success() {
            return resp.json::<Value>().await.map_err(|e| AgentError::Api {
                status: status.as_u16(),
                message: format!("invalid response body: {}", e),
            });
        }

        // Error taxonomy. Bodies are included for diagnostics; they come
        // from the server and never contain our key material.
        let retry_after = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let message = resp.text().await.unwrap_or_default();

        Err(match status {
            StatusCode::UNAUTHORIZED => AgentError::Auth { message },
            StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited {
                retry_after_secs: retry_after,
            },
            StatusCode::BAD_REQUEST if order_endpoint => {
                AgentError::OrderRejected { reason: message }
            }
            _ => AgentError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    /// Read path with exponential backoff on transient failures.
    async fn get_with_retry(&self, path: &str) -> Result<Value, AgentError> {
        let mut last_err = None;
        for attempt in 0..MAX_READ_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1));
                debug!("Retrying GET {} after {:?}", path, delay);
                tokio::time::sleep(delay).await;
            }
            match self.request(Method::GET, path, None, false).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    warn!("Exchange GET {} failed (attempt {}): {}", path, attempt + 1, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| AgentError::Connection("retries exhausted".into())))
    }

    pub async fn get_balance(&self) -> Result<i64, AgentError> {
        let v = self.get_with_retry("/portfolio/balance").await?;
        v["balance"].as_i64().ok_or_else(|| AgentError::Api {
            status: 200,
            message: "balance missing from response".into(),
        })
    }

    /// The event (with brackets) for a city's daily-high on `target_date`.
    /// Returns `None` when the exchange has not listed the event.
    pub async fn list_events_for(
        &self,
        city: &City,
        target_date: NaiveDate,
    ) -> Result<Option<MarketEvent>, AgentError> {
        let event_ticker = city.event_ticker(target_date);
        let brackets = match self.get_event_markets(&event_ticker).await {
            Ok(b) => b,
            Err(AgentError::Api { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(MarketEvent {
            event_ticker,
            city: city.code.to_string(),
            target_date,
            brackets,
        }))
    }

    /// Full bracket list for an event, sorted bottom edge first.
    pub async fn get_event_markets(&self, event_ticker: &str) -> Result<Vec<Bracket>, AgentError> {
        let path = format!("/events/{}?with_nested_markets=true", event_ticker);
        let v = self.get_with_retry(&path).await?;
        let markets = v["markets"].as_array().ok_or_else(|| AgentError::Api {
            status: 200,
            message: "markets missing from event response".into(),
        })?;

        let mut brackets = Vec::with_capacity(markets.len());
        for market in markets {
            brackets.push(parse_bracket(market)?);
        }
        brackets.sort_by(|a, b| {
            let ka = a.lower_bound_f.unwrap_or(f64::NEG_INFINITY);
            let kb = b.lower_bound_f.unwrap_or(f64::NEG_INFINITY);
            ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let bottoms = brackets.iter().filter(|b| b.lower_bound_f.is_none()).count();
        let tops = brackets.iter().filter(|b| b.upper_bound_f.is_none()).count();
        if !brackets.is_empty() && (bottoms != 1 || tops != 1) {
            return Err(AgentError::Invariant(format!(
                "event {} has {} bottom and {} top edge brackets",
                event_ticker, bottoms, tops
            )));
        }
        if brackets.len() != 6 {
            warn!(
                "Event {} returned {} brackets (expected 6)",
                event_ticker,
                brackets.len()
            );
        }
        Ok(brackets)
    }

    pub async fn get_market(&self, ticker: &str) -> Result<Bracket, AgentError> {
        let v = self.get_with_retry(&format!("/markets/{}", ticker)).await?;
        parse_bracket(&v["market"])
    }

    pub async fn get_orderbook(&self, ticker: &str) -> Result<Orderbook, AgentError> {
        let v = self
            .get_with_retry(&format!("/markets/{}/orderbook", ticker))
            .await?;
        Ok(Orderbook {
            yes_levels: parse_levels(&v["orderbook"]["yes"])?,
            no_levels: parse_levels(&v["orderbook"]["no"])?,
        })
    }

    pub async fn get_positions(&self) -> Result<Vec<PositionRow>, AgentError> {
        let v = self.get_with_retry("/portfolio/positions").await?;
        let rows = v["market_positions"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            positions.push(
                serde_json::from_value::<PositionRow>(row).map_err(|e| AgentError::Api {
                    status: 200,
                    message: format!("invalid position row: {}", e),
                })?,
            );
        }
        Ok(positions)
    }

    /// Place a limit order. Never retried here: an ambiguous failure is the
    /// caller's cue to mark the trade UNCERTAIN and reconcile from
    /// positions next cycle.
    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse, AgentError> {
        let price = validate_price_cents(order.price_cents)?;
        if order.quantity < 1 {
            return Err(AgentError::Invariant(format!(
                "order quantity {} must be at least 1",
                order.quantity
            )));
        }

        let mut body = json!({
            "ticker": order.ticker,
            "client_order_id": order.client_order_id,
            "action": "buy",
            "side": order.side,
            "count": order.quantity,
            "type": "limit",
        });
        match order.side {
            crate::kalshi::OrderSide::Yes => body["yes_price"] = json!(price),
            crate::kalshi::OrderSide::No => body["no_price"] = json!(price),
        }

        let v = self
            .request(Method::POST, "/portfolio/orders", Some(&body), true)
            .await?;
        serde_json::from_value::<OrderResponse>(v["order"].clone()).map_err(|e| AgentError::Api {
            status: 200,
            message: format!("invalid order response: {}", e),
        })
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<bool, AgentError> {
        match self
            .request(
                Method::DELETE,
                &format!("/portfolio/orders/{}", order_id),
                None,
                true,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(AgentError::Api { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn price_or_none(v: &Value) -> Result<Option<i64>, AgentError> {
    match v.as_i64() {
        None | Some(0) => Ok(None),
        Some(p) => validate_price_cents(p).map(Some),
    }
}

fn parse_bracket(market: &Value) -> Result<Bracket, AgentError> {
    let ticker = market["ticker"]
        .as_str()
        .ok_or_else(|| AgentError::Api {
            status: 200,
            message: "market missing ticker".into(),
        })?
        .to_string();
    let lower = market["floor_strike"].as_f64();
    let upper = market["cap_strike"].as_f64();
    let status = match market["status"].as_str().unwrap_or("") {
        "active" => MarketStatus::Active,
        "closed" => MarketStatus::Closed,
        "settled" => MarketStatus::Settled,
        _ => MarketStatus::Other,
    };
    let close_time_utc = market["close_time"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));

    Ok(Bracket {
        label: bracket_label(lower, upper),
        ticker,
        lower_bound_f: lower,
        upper_bound_f: upper,
        status,
        yes_bid_cents: price_or_none(&market["yes_bid"])?,
        yes_ask_cents: price_or_none(&market["yes_ask"])?,
        no_bid_cents: price_or_none(&market["no_bid"])?,
        no_ask_cents: price_or_none(&market["no_ask"])?,
        last_price_cents: price_or_none(&market["last_price"])?,
        close_time_utc,
    })
}

fn parse_levels(v: &Value) -> Result<Vec<(i64, i64)>, AgentError> {
    let Some(rows) = v.as_array() else {
        return Ok(Vec::new());
    };
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let pair = row.as_array().ok_or_else(|| AgentError::Api {
            status: 200,
            message: "orderbook level is not a pair".into(),
        })?;
        let price = pair
            .first()
            .and_then(|p| p.as_i64())
            .ok_or_else(|| AgentError::Api {
                status: 200,
                message: "orderbook level missing price".into(),
            })?;
        let qty = pair.get(1).and_then(|q| q.as_i64()).unwrap_or(0);
        levels.push((validate_price_cents(price)?, qty));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cities::city_by_code;
    use crate::kalshi::OrderSide;
    use rsa::pkcs8::EncodePrivateKey;
    use std::sync::OnceLock;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_signer() -> Arc<RequestSigner> {
        static SIGNER: OnceLock<Arc<RequestSigner>> = OnceLock::new();
        SIGNER
            .get_or_init(|| {
                let mut rng = rand::thread_rng();
                let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
                let pem = key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap();
                Arc::new(RequestSigner::from_pem("test-key", &pem).unwrap())
            })
            .clone()
    }

    fn test_client(server: &MockServer) -> KalshiClient {
        KalshiClient::new(&server.uri(), test_signer(), 100.0, 100.0, 5).unwrap()
    }

    fn sample_market(ticker: &str, floor: Option<f64>, cap: Option<f64>, yes_ask: i64) -> Value {
        json!({
            "ticker": ticker,
            "floor_strike": floor,
            "cap_strike": cap,
            "status": "active",
            "yes_bid": yes_ask - 2,
            "yes_ask": yes_ask,
            "no_bid": 100 - yes_ask,
            "no_ask": 100 - yes_ask + 2,
            "last_price": yes_ask - 1,
            "close_time": "2026-02-19T03:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_get_balance_signed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trade-api/v2/portfolio/balance"))
            .and(header_exists("KALSHI-ACCESS-KEY"))
            .and(header_exists("KALSHI-ACCESS-SIGNATURE"))
            .and(header_exists("KALSHI-ACCESS-TIMESTAMP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"balance": 123456})))
            .mount(&server)
            .await;

        let client = test_client(&server);
        assert_eq!(client.get_balance().await.unwrap(), 123456);
    }

    #[tokio::test]
    async fn test_event_markets_parsed_and_sorted() {
        let server = MockServer::start().await;
        let markets = json!({
            "event": {"event_ticker": "KXHIGHNY-26FEB18"},
            "markets": [
                sample_market("B54", Some(52.0), Some(54.0), 22),
                sample_market("T58", Some(58.0), None, 5),
                sample_market("B48", None, Some(47.0), 3),
                sample_market("B50", Some(48.0), Some(50.0), 10),
                sample_market("B52", Some(50.0), Some(52.0), 25),
                sample_market("B56", Some(54.0), Some(56.0), 30),
            ]
        });
        Mock::given(method("GET"))
            .and(path("/trade-api/v2/events/KXHIGHNY-26FEB18"))
            .respond_with(ResponseTemplate::new(200).set_body_json(markets))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let nyc = city_by_code("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        let event = client.list_events_for(nyc, date).await.unwrap().unwrap();

        assert_eq!(event.event_ticker, "KXHIGHNY-26FEB18");
        assert_eq!(event.brackets.len(), 6);
        // Bottom edge first, then ascending by floor
        assert!(event.brackets[0].lower_bound_f.is_none());
        assert_eq!(event.brackets[0].label, "Below 48°");
        assert!(event.brackets[5].upper_bound_f.is_none());
        assert_eq!(event.brackets[5].label, "58° or above");
        assert_eq!(event.brackets[3].label, "52-54°");
        assert_eq!(event.brackets[3].yes_ask_cents, Some(22));
    }

    #[tokio::test]
    async fn test_missing_event_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("event not found"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let nyc = city_by_code("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        assert!(client.list_events_for(nyc, date).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_edges_fail_closed() {
        let server = MockServer::start().await;
        let markets = json!({
            "markets": [
                sample_market("B48", None, Some(47.0), 3),
                sample_market("B50", None, Some(49.0), 5),
                sample_market("T58", Some(58.0), None, 5),
            ]
        });
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(markets))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.get_event_markets("KXHIGHNY-26FEB18").await.unwrap_err();
        assert!(matches!(err, AgentError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_orderbook_levels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trade-api/v2/markets/KXHIGHNY-26FEB18-B54/orderbook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "orderbook": {
                    "yes": [[20, 100], [21, 50]],
                    "no": [[77, 30]]
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let book = client.get_orderbook("KXHIGHNY-26FEB18-B54").await.unwrap();
        assert_eq!(book.yes_levels, vec![(20, 100), (21, 50)]);
        assert_eq!(book.no_levels, vec![(77, 30)]);
    }

    #[tokio::test]
    async fn test_rate_limit_error_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.get_balance().await.unwrap_err();
        match err {
            AgentError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, Some(7));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_error_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid signature"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.get_balance().await.unwrap_err();
        assert!(matches!(err, AgentError::Auth { .. }));
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_order_rejection_preserves_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/trade-api/v2/portfolio/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_string("insufficient balance"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let order = OrderRequest {
            ticker: "KXHIGHNY-26FEB18-B54".into(),
            side: OrderSide::Yes,
            price_cents: 22,
            quantity: 1,
            client_order_id: "c-1".into(),
        };
        let err = client.place_order(&order).await.unwrap_err();
        match err {
            AgentError::OrderRejected { reason } => {
                assert!(reason.contains("insufficient balance"));
            }
            other => panic!("expected OrderRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_place_order_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/trade-api/v2/portfolio/orders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "order": {"order_id": "ord-123", "status": "resting"}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let order = OrderRequest {
            ticker: "KXHIGHNY-26FEB18-B54".into(),
            side: OrderSide::No,
            price_cents: 78,
            quantity: 2,
            client_order_id: "c-2".into(),
        };
        let resp = client.place_order(&order).await.unwrap();
        assert_eq!(resp.order_id, "ord-123");
        assert_eq!(resp.status, "resting");
    }

    #[tokio::test]
    async fn test_place_order_rejects_invalid_price_locally() {
        let server = MockServer::start().await;
        let client = test_client(&server);
        for bad_price in [0, 100, -3] {
            let order = OrderRequest {
                ticker: "T".into(),
                side: OrderSide::Yes,
                price_cents: bad_price,
                quantity: 1,
                client_order_id: "c".into(),
            };
            let err = client.place_order(&order).await.unwrap_err();
            assert!(matches!(err, AgentError::Invariant(_)));
        }
        // No request ever reached the server
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_positions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trade-api/v2/portfolio/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "market_positions": [
                    {"ticker": "KXHIGHNY-26FEB18-B54", "position": 1, "market_exposure": 22}
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let positions = client.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticker, "KXHIGHNY-26FEB18-B54");
        assert_eq!(positions[0].position, 1);
    }

    #[tokio::test]
    async fn test_cancel_order() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/trade-api/v2/portfolio/orders/ord-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"order": {}})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/trade-api/v2/portfolio/orders/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such order"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        assert!(client.cancel_order("ord-1").await.unwrap());
        assert!(!client.cancel_order("gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trade-api/v2/portfolio/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"balance": 500})))
            .mount(&server)
            .await;
        // Error mock mounted last wins until consumed
        Mock::given(method("GET"))
            .and(path("/trade-api/v2/portfolio/balance"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        assert_eq!(client.get_balance().await.unwrap(), 500);
    }
}
