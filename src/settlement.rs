use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cities::City;
use crate::db::Database;

/// Published to the orchestrator when an official high lands.
#[derive(Debug, Clone)]
pub struct SettlementObserved {
    pub city: String,
    pub target_date: NaiveDate,
    pub actual_high_f: f64,
}

/// How many recent CLI products to inspect for the target date.
const PRODUCTS_TO_CHECK: usize = 5;
/// Doubling backoff: 60s, 120s, ... capped at the ceiling.
const BACKOFF_START_SECS: u64 = 60;
const BACKOFF_CEILING_SECS: u64 = 3600;
const MAX_BACKOFF_ATTEMPTS: u32 = 8;

/// Parses the official daily climate report (CLI product) for a city and
/// records the previous day's high. The measurement window is local
/// standard time, which is also the report's own frame.
pub struct SettlementIngestor {
    db: Arc<Database>,
    http: Client,
    base_url: String,
    events_tx: mpsc::Sender<SettlementObserved>,
}

impl SettlementIngestor {
    pub fn new(
        db: Arc<Database>,
        base_url: &str,
        user_agent: &str,
        timeout_secs: u64,
        events_tx: mpsc::Sender<SettlementObserved>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build settlement HTTP client")?;
        Ok(SettlementIngestor {
            db,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            events_tx,
        })
    }

    /// One attempt: fetch the latest CLI products for the city's office and
    /// look for a report covering `target_date`. Returns true when a new
    /// settlement row was written (and the observation published).
    pub async fn run_for_city(
        &self,
        city: &City,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.db.get_settlement(city.code, target_date)?.is_some() {
            return Ok(false);
        }

        let list_url = format!(
            "{}/products/types/CLI/locations/{}",
            self.base_url, city.cli_office
        );
        let listing: Value = self
            .http
            .get(&list_url)
            .send()
            .await
            .context("CLI product list request failed")?
            .error_for_status()
            .context("CLI product list returned error status")?
            .json()
            .await
            .context("Failed to parse CLI product list")?;

        let products = listing["@graph"]
            .as_array()
            .context("CLI product list missing @graph")?;

        for product in products.iter().take(PRODUCTS_TO_CHECK) {
            let Some(id) = product["id"].as_str() else {
                continue;
            };
            let text_url = format!("{}/products/{}", self.base_url, id);
            let body: Value = match self.http.get(&text_url).send().await {
                Ok(resp) => match resp.json().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Failed to parse CLI product {}: {}", id, e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Failed to fetch CLI product {}: {}", id, e);
                    continue;
                }
            };
            let Some(text) = body["productText"].as_str() else {
                continue;
            };
            let Some((report_date, high_f)) = parse_cli_high(text) else {
                continue;
            };
            if report_date != target_date {
                continue;
            }

            let raw = serde_json::json!({
                "product_id": id,
                "office": city.cli_office,
                "station": city.station,
            })
            .to_string();
            let inserted = self.db.insert_settlement(
                city.code,
                target_date,
                high_f,
                "NWS_CLI",
                &raw,
                now,
            )?;
            if inserted {
                info!(
                    "Settlement recorded: {} {} high {}°F",
                    city.code, target_date, high_f
                );
                let _ = self
                    .events_tx
                    .send(SettlementObserved {
                        city: city.code.to_string(),
                        target_date,
                        actual_high_f: high_f,
                    })
                    .await;
            }
            return Ok(inserted);
        }

        anyhow::bail!(
            "no CLI report covering {} found for {}",
            target_date,
            city.code
        )
    }

    /// Retry on a doubling backoff up to the ceiling. A report still
    /// missing after the final attempt surfaces as ClosureStalled; related
    /// trades stay OPEN.
    pub async fn run_with_backoff(&self, city: &City, target_date: NaiveDate) {
        let mut delay = BACKOFF_START_SECS;
        for attempt in 1..=MAX_BACKOFF_ATTEMPTS {
            match self.run_for_city(city, target_date, Utc::now()).await {
                Ok(_) => return,
                Err(e) => {
                    warn!(
                        "Settlement fetch attempt {}/{} failed for {} {}: {}",
                        attempt, MAX_BACKOFF_ATTEMPTS, city.code, target_date, e
                    );
                }
            }
            if attempt < MAX_BACKOFF_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(BACKOFF_CEILING_SECS);
            }
        }
        warn!(
            "ClosureStalled: no climate report for {} {} after {} attempts; trades remain OPEN",
            city.code, target_date, MAX_BACKOFF_ATTEMPTS
        );
        let _ = self.db.log_event(
            "WARN",
            "settlement",
            "ClosureStalled",
            Some(
                &serde_json::json!({
                    "city": city.code,
                    "target_date": target_date.to_string(),
                })
                .to_string(),
            ),
        );
    }
}

fn month_number(name: &str) -> Option<u32> {
    match name.to_uppercase().as_str() {
        "JANUARY" => Some(1),
        "FEBRUARY" => Some(2),
        "MARCH" => Some(3),
        "APRIL" => Some(4),
        "MAY" => Some(5),
        "JUNE" => Some(6),
        "JULY" => Some(7),
        "AUGUST" => Some(8),
        "SEPTEMBER" => Some(9),
        "OCTOBER" => Some(10),
        "NOVEMBER" => Some(11),
        "DECEMBER" => Some(12),
        _ => None,
    }
}

/// Extract (summary date, maximum temperature °F) from a CLI report body.
pub fn parse_cli_high(text: &str) -> Option<(NaiveDate, f64)> {
    let upper = text.to_uppercase();

    let date_re =
        Regex::new(r"CLIMATE SUMMARY FOR\s+([A-Z]+)\s+(\d{1,2})\s+(\d{4})").ok()?;
    let caps = date_re.captures(&upper)?;
    let month = month_number(&caps[1])?;
    let day: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    let report_date = NaiveDate::from_ymd_opt(year, month, day)?;

    // The first MAXIMUM row in the temperature section is the day's high.
    let max_re = Regex::new(r"MAXIMUM\s+(-?\d+)").ok()?;
    let caps = max_re.captures(&upper)?;
    let high: f64 = caps[1].parse().ok()?;
    Some((report_date, high))
}
