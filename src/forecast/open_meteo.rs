use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cities::City;
use crate::forecast::{retry_backoff, ProviderForecast, MAX_FETCH_ATTEMPTS};
use crate::rate_limit::TokenBucket;

/// Model keys in the multi-model response mapped to ensemble source names.
const MODEL_KEYS: &[(&str, &str)] = &[
    ("temperature_2m_max_ecmwf_ifs025", "ECMWF"),
    ("temperature_2m_max_gfs_seamless", "GFS"),
    ("temperature_2m_max_icon_seamless", "ICON"),
    ("temperature_2m_max_gem_seamless", "GEM"),
];

/// Multi-model forecast client (api.open-meteo.com). No auth; 5 req/s. The
/// request always carries the Fahrenheit unit parameter, so values are
/// stored as returned.
pub struct OpenMeteoClient {
    http: Client,
    base_url: String,
    limiter: TokenBucket,
}

impl OpenMeteoClient {
    pub fn new(base_url: &str, rate_per_sec: f64, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Open-Meteo HTTP client")?;
        Ok(OpenMeteoClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: TokenBucket::per_second(rate_per_sec),
        })
    }

    /// One call per city returns per-model daily highs for today and D+1.
    pub async fn fetch_daily_highs(
        &self,
        city: &City,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProviderForecast>> {
        let url = format!(
            "{}/v1/forecast?latitude={:.4}&longitude={:.4}&daily=temperature_2m_max\
             &forecast_days=2&temperature_unit=fahrenheit&timezone=UTC\
             &models=ecmwf_ifs025,gfs_seamless,icon_seamless,gem_seamless",
            self.base_url, city.lat, city.lon
        );

        let v = self.get_json(&url).await?;
        let daily = &v["daily"];
        let times: Vec<NaiveDate> = daily["time"]
            .as_array()
            .context("Open-Meteo response missing daily.time")?
            .iter()
            .filter_map(|t| t.as_str())
            .filter_map(|t| NaiveDate::parse_from_str(t, "%Y-%m-%d").ok())
            .collect();

        // No run timestamp on the wire; the fetch hour keys idempotency so
        // re-fetches within the hour are no-ops.
        let model_run_ts = now.format("%Y-%m-%dT%H:00:00Z").to_string();

        let mut forecasts = Vec::new();
        for &(json_key, source) in MODEL_KEYS {
            let Some(temps) = daily[json_key].as_array() else {
                debug!("Open-Meteo response missing {} for {}", json_key, city.code);
                continue;
            };
            for (i, date) in times.iter().enumerate() {
                let Some(high_f) = temps.get(i).and_then(|t| t.as_f64()) else {
                    continue;
                };
                forecasts.push(ProviderForecast {
                    source: source.to_string(),
                    city: city.code.to_string(),
                    target_date: *date,
                    predicted_high_f: high_f,
                    model_run_ts: model_run_ts.clone(),
                    raw_json: serde_json::json!({
                        "model": source,
                        "date": date.to_string(),
                        "high_f": high_f,
                    })
                    .to_string(),
                });
            }
        }

        if forecasts.is_empty() {
            anyhow::bail!("Open-Meteo returned no model temperatures for {}", city.code);
        }
        Ok(forecasts)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let mut last_err = None;
        for attempt in 0..MAX_FETCH_ATTEMPTS {
            if attempt > 0 {
                let delay = retry_backoff(attempt);
                debug!("Retrying Open-Meteo after {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            self.limiter.acquire().await;
            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<Value>()
                            .await
                            .context("Failed to parse Open-Meteo JSON");
                    }
                    if status.is_server_error() {
                        warn!("Open-Meteo returned {}", status);
                        last_err = Some(anyhow::anyhow!("Open-Meteo returned {}", status));
                        continue;
                    }
                    anyhow::bail!("Open-Meteo returned {}", status);
                }
                Err(e) => {
                    warn!("Open-Meteo request failed: {}", e);
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Open-Meteo failed after retries")))
    }
}
