use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use boz_weather_trader::cities::{City, CITIES};
use boz_weather_trader::config::Config;
use boz_weather_trader::crypto::KeyVault;
use boz_weather_trader::db::Database;
use boz_weather_trader::forecast::{nws::NwsClient, open_meteo::OpenMeteoClient, ForecastIngestor};
use boz_weather_trader::kalshi::auth::RequestSigner;
use boz_weather_trader::kalshi::client::KalshiClient;
use boz_weather_trader::kalshi::ws::{MarketStream, StreamEvent};
use boz_weather_trader::orchestrator::Orchestrator;
use boz_weather_trader::prediction::{MlArtifact, PredictionEngine};
use boz_weather_trader::settlement::SettlementIngestor;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration is fatal-on-missing for ENCRYPTION_KEY
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!(
        "Boz Weather Trader starting ({:?}, cities: {})",
        config.environment,
        CITIES.iter().map(|c| c.code).collect::<Vec<_>>().join(","),
    );

    let vault = KeyVault::new(&config.encryption_key)?;

    // A configured-but-unreadable model artifact refuses startup
    let ml = match &config.ml_model_path {
        Some(path) => Some(MlArtifact::load(path)?),
        None => None,
    };

    let db = Arc::new(Database::open(&config.database_url)?);
    info!("Database ready at {}", config.database_url);

    bootstrap_user(&db, &vault, &config)?;
    let users = db.list_users()?;
    if users.is_empty() {
        anyhow::bail!(
            "no users configured; set KALSHI_API_KEY_ID and KALSHI_PRIVATE_KEY_PATH to bootstrap"
        );
    }

    // ── Forecast ingestion (every 30 min; the 06:00 refresh is one tick) ──
    let nws = NwsClient::new(
        &config.nws_api_url,
        &config.nws_user_agent,
        config.nws_rate_limit_per_second,
        config.request_timeout_secs,
        db.clone(),
    )?;
    let open_meteo = OpenMeteoClient::new(
        &config.open_meteo_api_url,
        config.open_meteo_rate_limit_per_second,
        config.request_timeout_secs,
    )?;
    let ingestor = Arc::new(ForecastIngestor::new(db.clone(), nws, open_meteo));
    {
        let ingestor = ingestor.clone();
        let interval_minutes = config.forecast_fetch_interval_minutes;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_minutes * 60));
            loop {
                ticker.tick().await;
                ingestor.fetch_all(Utc::now()).await;
            }
        });
    }

    // ── Settlement ingestion (08:00 local standard per city) ──
    let (settle_tx, mut settle_rx) = mpsc::channel(32);
    let settlement = Arc::new(SettlementIngestor::new(
        db.clone(),
        &config.nws_api_url,
        &config.nws_user_agent,
        config.request_timeout_secs,
        settle_tx,
    )?);
    for city in CITIES {
        let settlement = settlement.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sleep_until_local_hour(city, 8)).await;
                let yesterday = city.local_date(Utc::now()) - ChronoDuration::days(1);
                settlement.run_with_backoff(city, yesterday).await;
            }
        });
    }
    // Catch up on yesterday's reports at startup
    {
        let settlement = settlement.clone();
        tokio::spawn(async move {
            for city in CITIES {
                let yesterday = city.local_date(Utc::now()) - ChronoDuration::days(1);
                if let Err(e) = settlement.run_for_city(city, yesterday, Utc::now()).await {
                    info!("Startup settlement catch-up for {}: {}", city.code, e);
                }
            }
        });
    }

    // ── Per-user tasks: trade cycle, approval sweep, order-book stream ──
    let mut orchestrators = Vec::new();
    for user in &users {
        let pem = vault
            .decrypt(&user.encrypted_private_key)
            .with_context(|| format!("failed to decrypt private key for user {}", user.id))?;
        let signer = Arc::new(RequestSigner::from_pem(&user.api_key_id, &pem)?);
        drop(pem);

        let client = Arc::new(KalshiClient::new(
            &config.kalshi_api_url,
            signer.clone(),
            config.exchange_rate_limit_per_second,
            config.exchange_rate_limit_burst,
            config.request_timeout_secs,
        )?);
        let engine = PredictionEngine::new(ml.clone(), config.ml_ensemble_weight);
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            client.clone(),
            engine,
            config.clone(),
            user.id.clone(),
        ));
        orchestrators.push(orchestrator.clone());

        // Trade cycle: serialized per user, watchdogged
        {
            let orchestrator = orchestrator.clone();
            let user_id = user.id.clone();
            let cycle_secs = config.trade_cycle_interval_minutes * 60;
            let watchdog = Duration::from_secs(config.cycle_watchdog_minutes * 60);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(cycle_secs));
                loop {
                    ticker.tick().await;
                    match tokio::time::timeout(watchdog, orchestrator.run_cycle(Utc::now())).await
                    {
                        Ok(Ok(summary)) => {
                            if summary.placed + summary.enqueued > 0 {
                                info!(
                                    "Cycle for {}: {} placed, {} enqueued",
                                    user_id, summary.placed, summary.enqueued
                                );
                            }
                        }
                        Ok(Err(e)) => warn!("Cycle failed for {}: {}", user_id, e),
                        Err(_) => error!("CycleStalled: cycle for {} exceeded watchdog", user_id),
                    }
                }
            });
        }

        // Pending-approval expiry sweep
        {
            let orchestrator = orchestrator.clone();
            let sweep_secs = config.pending_sweep_interval_secs;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(sweep_secs));
                loop {
                    ticker.tick().await;
                    if let Err(e) = orchestrator.approval_queue().sweep(Utc::now()) {
                        warn!("Pending sweep failed: {}", e);
                    }
                }
            });
        }

        // Live order-book stream with REST fallback between attempts
        {
            let db = db.clone();
            let ws_url = config.kalshi_ws_url.clone();
            let fallback = Duration::from_secs(config.trade_cycle_interval_minutes * 60);
            tokio::spawn(async move {
                run_stream(db, client, signer, ws_url, fallback).await;
            });
        }
    }

    // ── Settlement observations fan out to every user's closeout loop ──
    {
        let orchestrators = orchestrators.clone();
        tokio::spawn(async move {
            while let Some(observed) = settle_rx.recv().await {
                for orchestrator in &orchestrators {
                    match orchestrator.on_settlement(&observed, Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => info!(
                            "Settlement {} {} closed {} trade(s)",
                            observed.city, observed.target_date, n
                        ),
                        Err(e) => warn!(
                            "Closeout failed for {} {}: {}",
                            observed.city, observed.target_date, e
                        ),
                    }
                }
            }
        });
    }

    info!("All tasks started; running until Ctrl+C");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

/// Encrypt and store the bootstrap user's credentials if provided.
fn bootstrap_user(db: &Database, vault: &KeyVault, config: &Config) -> Result<()> {
    let Some(key_path) = &config.kalshi_private_key_path else {
        return Ok(());
    };
    if config.kalshi_api_key_id.is_empty() {
        anyhow::bail!("KALSHI_PRIVATE_KEY_PATH set but KALSHI_API_KEY_ID is empty");
    }
    let pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("failed to read private key at {}", key_path))?;
    // Validate before storing
    RequestSigner::from_pem(&config.kalshi_api_key_id, &pem)?;
    let encrypted = vault.encrypt(&pem)?;
    let settings = db
        .get_user("default")
        .ok()
        .flatten()
        .map(|u| u.settings_json)
        .unwrap_or_else(|| "{}".to_string());
    db.upsert_user("default", &config.kalshi_api_key_id, &encrypted, &settings)?;
    info!("Bootstrap user 'default' configured");
    Ok(())
}

/// Until the next `hour`:00 in the city's standard-time frame.
fn sleep_until_local_hour(city: &'static City, hour: u32) -> Duration {
    let now = Utc::now().with_timezone(&city.standard_offset());
    let today_target = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("static time");
    let target = if now.naive_local() < today_target {
        today_target
    } else {
        today_target + ChronoDuration::days(1)
    };
    (target - now.naive_local())
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}

/// Keep the order-book stream alive; when reconnects are exhausted the
/// cycle's REST polling covers the gap until the next connect attempt.
async fn run_stream(
    db: Arc<Database>,
    client: Arc<KalshiClient>,
    signer: Arc<RequestSigner>,
    ws_url: String,
    fallback: Duration,
) {
    loop {
        let mut tickers = Vec::new();
        for city in CITIES {
            let target_date = city.local_date(Utc::now());
            if let Ok(Some(event)) = client.list_events_for(city, target_date).await {
                tickers.extend(event.brackets.into_iter().map(|b| b.ticker));
            }
        }
        if tickers.is_empty() {
            info!("No events to stream; retrying in {:?}", fallback);
            tokio::time::sleep(fallback).await;
            continue;
        }

        let (stream, mut events) = MarketStream::new(&ws_url, signer.clone(), tickers);
        let runner = tokio::spawn(stream.run());

        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Fill {
                    ticker,
                    order_id,
                    side,
                    count,
                } => {
                    info!("Fill observed: {} {} x{} ({})", ticker, side, count, order_id);
                    let _ = db.log_event(
                        "INFO",
                        "stream",
                        "fill",
                        Some(
                            &serde_json::json!({
                                "ticker": ticker,
                                "order_id": order_id,
                                "count": count,
                            })
                            .to_string(),
                        ),
                    );
                }
                other => tracing::debug!("Stream event: {:?}", other),
            }
        }

        match runner.await {
            Ok(Ok(())) => info!("Stream closed cleanly"),
            Ok(Err(e)) => warn!("Stream failed: {}; REST polling until next attempt", e),
            Err(e) => warn!("Stream task panicked: {}", e),
        }
        tokio::time::sleep(fallback).await;
    }
}
