pub mod nws;
pub mod open_meteo;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cities::CITIES;
use crate::db::{Database, ForecastRow};
use nws::NwsClient;
use open_meteo::OpenMeteoClient;

/// Total attempts per provider call (initial + retries at 1s, 2s, 4s).
pub const MAX_FETCH_ATTEMPTS: u32 = 4;

pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(4))
}

/// Default staleness threshold in minutes.
pub const DEFAULT_STALENESS_MINUTES: i64 = 120;

/// One provider's daily-high forecast before persistence.
#[derive(Debug, Clone)]
pub struct ProviderForecast {
    pub source: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub predicted_high_f: f64,
    pub model_run_ts: String,
    pub raw_json: String,
}

/// Fetches forecasts for every (city, today/D+1, provider) on a recurring
/// cadence and persists them. The prediction engine only sees durable rows.
pub struct ForecastIngestor {
    db: Arc<Database>,
    nws: NwsClient,
    open_meteo: OpenMeteoClient,
}

impl ForecastIngestor {
    pub fn new(db: Arc<Database>, nws: NwsClient, open_meteo: OpenMeteoClient) -> Self {
        ForecastIngestor { db, nws, open_meteo }
    }

    /// Fetch every (city, target_date, provider) combination. A failing
    /// (city, source) is logged and skipped; it never aborts other work.
    pub async fn fetch_all(&self, now: DateTime<Utc>) {
        let mut written = 0usize;
        for city in CITIES {
            let today = city.local_date(now);
            let dates = [today, today + ChronoDuration::days(1)];

            for target_date in dates {
                match self.nws.fetch_daily_high(city, target_date, now).await {
                    Ok(forecast) => written += self.persist(&forecast, now),
                    Err(e) => {
                        warn!("NWS fetch failed for {} {}: {}", city.code, target_date, e);
                    }
                }
            }

            // One multi-model call covers both dates
            match self.open_meteo.fetch_daily_highs(city, now).await {
                Ok(forecasts) => {
                    for forecast in forecasts.iter().filter(|f| dates.contains(&f.target_date)) {
                        written += self.persist(forecast, now);
                    }
                }
                Err(e) => {
                    warn!("Open-Meteo fetch failed for {}: {}", city.code, e);
                }
            }
        }
        info!("Forecast fetch complete: {} new rows", written);
    }

    fn persist(&self, forecast: &ProviderForecast, fetched_at: DateTime<Utc>) -> usize {
        match self.db.insert_forecast(
            &forecast.city,
            forecast.target_date,
            &forecast.source,
            forecast.predicted_high_f,
            &forecast.model_run_ts,
            &forecast.raw_json,
            fetched_at,
        ) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                warn!(
                    "Failed to persist {} forecast for {}: {}",
                    forecast.source, forecast.city, e
                );
                0
            }
        }
    }

    /// Newest forecast per source for (city, target_date), newest first.
    pub fn newest_for(&self, city: &str, target_date: NaiveDate) -> Result<Vec<ForecastRow>> {
        self.db.newest_forecasts(city, target_date)
    }

    /// True when nothing newer than `threshold_minutes` exists.
    pub fn is_stale(
        &self,
        city: &str,
        target_date: NaiveDate,
        threshold_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.db.newest_forecast_at(city, target_date)? {
            None => Ok(true),
            Some(newest) => Ok(now - newest > ChronoDuration::minutes(threshold_minutes)),
        }
    }
}

/// Age in minutes of the newest forecast, used by the freshness guard and
/// the confidence score.
pub fn forecast_age_minutes(
    db: &Database,
    city: &str,
    target_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    Ok(db
        .newest_forecast_at(city, target_date)?
        .map(|newest| (now - newest).num_minutes()))
}
