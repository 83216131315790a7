use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cities::{c_to_f, City};
use crate::db::{Database, GridCacheRow};
use crate::forecast::{retry_backoff, ProviderForecast, MAX_FETCH_ATTEMPTS};
use crate::rate_limit::TokenBucket;

/// Governmental forecast client (api.weather.gov). No API key; a
/// descriptive User-Agent is mandatory and the bucket holds 1 req/s.
pub struct NwsClient {
    http: Client,
    base_url: String,
    limiter: TokenBucket,
    db: Arc<Database>,
}

impl NwsClient {
    pub fn new(
        base_url: &str,
        user_agent: &str,
        rate_per_sec: f64,
        timeout_secs: u64,
        db: Arc<Database>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build NWS HTTP client")?;
        Ok(NwsClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: TokenBucket::per_second(rate_per_sec),
            db,
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let mut last_err = None;
        for attempt in 0..MAX_FETCH_ATTEMPTS {
            if attempt > 0 {
                let delay = retry_backoff(attempt);
                debug!("Retrying NWS {} after {:?}", url, delay);
                tokio::time::sleep(delay).await;
            }
            self.limiter.acquire().await;
            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Value>().await.context("Failed to parse NWS JSON");
                    }
                    if status.is_server_error() {
                        warn!("NWS {} returned {}", url, status);
                        last_err = Some(anyhow::anyhow!("NWS returned {}", status));
                        continue;
                    }
                    // 4xx is not retryable
                    anyhow::bail!("NWS returned {} for {}", status, url);
                }
                Err(e) => {
                    warn!("NWS request failed: {}", e);
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("NWS request failed after retries")))
    }

    /// Coordinates map to a forecast grid exactly once; the mapping is
    /// cached in the database and only refetched when explicitly dropped.
    async fn resolve_grid(&self, city: &City) -> Result<GridCacheRow> {
        if let Some(grid) = self.db.get_forecast_grid(city.code)? {
            return Ok(grid);
        }

        let url = format!("{}/points/{:.4},{:.4}", self.base_url, city.lat, city.lon);
        let points = self.get_json(&url).await?;
        let props = &points["properties"];
        let grid = GridCacheRow {
            city: city.code.to_string(),
            grid_id: props["gridId"]
                .as_str()
                .context("points response missing gridId")?
                .to_string(),
            grid_x: props["gridX"].as_i64().context("points response missing gridX")?,
            grid_y: props["gridY"].as_i64().context("points response missing gridY")?,
            forecast_url: props["forecast"]
                .as_str()
                .context("points response missing forecast URL")?
                .to_string(),
        };
        self.db.put_forecast_grid(&grid)?;
        Ok(grid)
    }

    /// Daily high for (city, target_date). Prefers the raw numerical
    /// gridpoint (Celsius, converted); falls back to the period text
    /// forecast (already Fahrenheit).
    pub async fn fetch_daily_high(
        &self,
        city: &City,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<ProviderForecast> {
        let grid = self.resolve_grid(city).await?;

        match self.fetch_gridpoint_high(city, &grid, target_date).await {
            Ok(forecast) => Ok(forecast),
            Err(e) => {
                warn!(
                    "NWS gridpoint fetch failed for {} ({}), trying period forecast",
                    city.code, e
                );
                self.fetch_period_high(city, &grid, target_date, now).await
            }
        }
    }

    async fn fetch_gridpoint_high(
        &self,
        city: &City,
        grid: &GridCacheRow,
        target_date: NaiveDate,
    ) -> Result<ProviderForecast> {
        let url = format!(
            "{}/gridpoints/{}/{},{}",
            self.base_url, grid.grid_id, grid.grid_x, grid.grid_y
        );
        let v = self.get_json(&url).await?;
        let temp = &v["properties"]["temperature"];
        let uom = temp["uom"].as_str().unwrap_or("wmoUnit:degC");
        let values = temp["values"]
            .as_array()
            .context("gridpoint response missing temperature values")?;

        // Hourly samples stamped in UTC; the settlement day is the city's
        // standard-time window.
        let mut high: Option<f64> = None;
        for entry in values {
            let Some(valid) = entry["validTime"].as_str() else {
                continue;
            };
            let Some(start) = valid.split('/').next() else {
                continue;
            };
            let Ok(instant) = DateTime::parse_from_rfc3339(start) else {
                continue;
            };
            let local_date = instant
                .with_timezone(&city.standard_offset())
                .date_naive();
            if local_date != target_date {
                continue;
            }
            if let Some(value) = entry["value"].as_f64() {
                high = Some(high.map_or(value, |h: f64| h.max(value)));
            }
        }
        let raw_high = high.with_context(|| {
            format!("no gridpoint temperatures cover {} {}", city.code, target_date)
        })?;
        let high_f = if uom.contains("degC") { c_to_f(raw_high) } else { raw_high };

        let model_run_ts = v["properties"]["updateTime"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        Ok(ProviderForecast {
            source: "NWS".to_string(),
            city: city.code.to_string(),
            target_date,
            predicted_high_f: high_f,
            model_run_ts,
            raw_json: serde_json::json!({
                "endpoint": "gridpoint",
                "uom": uom,
                "high": raw_high,
            })
            .to_string(),
        })
    }

    async fn fetch_period_high(
        &self,
        city: &City,
        grid: &GridCacheRow,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<ProviderForecast> {
        let v = self.get_json(&grid.forecast_url).await?;
        let periods = v["properties"]["periods"]
            .as_array()
            .context("forecast response missing periods")?;

        for period in periods {
            if !period["isDaytime"].as_bool().unwrap_or(false) {
                continue;
            }
            let Some(start) = period["startTime"].as_str() else {
                continue;
            };
            let Ok(instant) = DateTime::parse_from_rfc3339(start) else {
                continue;
            };
            if instant.with_timezone(&city.standard_offset()).date_naive() != target_date {
                continue;
            }
            // Period temperatures are already Fahrenheit
            let high_f = period["temperature"]
                .as_f64()
                .context("period missing temperature")?;
            let model_run_ts = v["properties"]["updateTime"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| now.format("%Y-%m-%dT%H:00:00Z").to_string());
            return Ok(ProviderForecast {
                source: "NWS".to_string(),
                city: city.code.to_string(),
                target_date,
                predicted_high_f: high_f,
                model_run_ts,
                raw_json: serde_json::json!({
                    "endpoint": "periods",
                    "name": period["name"],
                    "high": high_f,
                })
                .to_string(),
            });
        }
        anyhow::bail!(
            "no daytime period covers {} {}",
            city.code,
            target_date
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cities::city_by_code;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> NwsClient {
        let db = Arc::new(Database::open_in_memory().unwrap());
        NwsClient::new(&server.uri(), "test-agent/1.0", 100.0, 5, db).unwrap()
    }

    fn mount_points(server: &MockServer, grid_url: &str) -> Mock {
        Mock::given(method("GET"))
            .and(path("/points/40.7790,-73.9692"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "properties": {
                    "gridId": "OKX",
                    "gridX": 33,
                    "gridY": 37,
                    "forecast": format!("{}/gridpoints/OKX/33,37/forecast", grid_url),
                }
            })))
    }

    #[tokio::test]
    async fn test_gridpoint_high_converted_from_celsius() {
        let server = MockServer::start().await;
        mount_points(&server, &server.uri()).mount(&server).await;

        // 12.2°C ≈ 54.0°F is the max sample inside Feb 18 EST
        Mock::given(method("GET"))
            .and(path("/gridpoints/OKX/33,37"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "properties": {
                    "updateTime": "2026-02-18T09:32:00+00:00",
                    "temperature": {
                        "uom": "wmoUnit:degC",
                        "values": [
                            {"validTime": "2026-02-18T10:00:00+00:00/PT1H", "value": 6.0},
                            {"validTime": "2026-02-18T19:00:00+00:00/PT1H", "value": 12.2},
                            {"validTime": "2026-02-19T10:00:00+00:00/PT1H", "value": 20.0}
                        ]
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let nyc = city_by_code("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        let forecast = client.fetch_daily_high(nyc, date, Utc::now()).await.unwrap();

        assert_eq!(forecast.source, "NWS");
        assert!((forecast.predicted_high_f - c_to_f(12.2)).abs() < 1e-9);
        assert_eq!(forecast.model_run_ts, "2026-02-18T09:32:00+00:00");
    }

    #[tokio::test]
    async fn test_grid_cached_after_first_resolve() {
        let server = MockServer::start().await;
        mount_points(&server, &server.uri())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gridpoints/OKX/33,37"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "properties": {
                    "updateTime": "2026-02-18T09:32:00+00:00",
                    "temperature": {
                        "uom": "wmoUnit:degC",
                        "values": [
                            {"validTime": "2026-02-18T19:00:00+00:00/PT1H", "value": 10.0}
                        ]
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let nyc = city_by_code("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        // Two fetches, one points call (expect(1) above enforces it)
        client.fetch_daily_high(nyc, date, Utc::now()).await.unwrap();
        client.fetch_daily_high(nyc, date, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_period_forecast() {
        let server = MockServer::start().await;
        mount_points(&server, &server.uri()).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/gridpoints/OKX/33,37"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no gridpoint"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gridpoints/OKX/33,37/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "properties": {
                    "updateTime": "2026-02-18T10:00:00+00:00",
                    "periods": [
                        {"name": "Tonight", "isDaytime": false,
                         "startTime": "2026-02-17T18:00:00-05:00", "temperature": 40},
                        {"name": "Wednesday", "isDaytime": true,
                         "startTime": "2026-02-18T06:00:00-05:00", "temperature": 55}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let nyc = city_by_code("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        let forecast = client.fetch_daily_high(nyc, date, Utc::now()).await.unwrap();
        // Period temperatures arrive in Fahrenheit, no conversion
        assert!((forecast.predicted_high_f - 55.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_day_is_error() {
        let server = MockServer::start().await;
        mount_points(&server, &server.uri()).mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/gridpoints/OKX/33,37"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "properties": {
                    "temperature": {"uom": "wmoUnit:degC", "values": []}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gridpoints/OKX/33,37/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "properties": {"periods": []}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let nyc = city_by_code("NYC").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        assert!(client.fetch_daily_high(nyc, date, Utc::now()).await.is_err());
    }
}
