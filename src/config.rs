use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Whether signals execute immediately or wait in the approval queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Auto,
    Manual,
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(TradingMode::Auto),
            "manual" => Ok(TradingMode::Manual),
            _ => anyhow::bail!("Invalid trading mode: '{}'. Must be 'auto' or 'manual'", s),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Auto => write!(f, "auto"),
            TradingMode::Manual => write!(f, "manual"),
        }
    }
}

/// Development routes orders to paper fills; production sends real orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            _ => anyhow::bail!(
                "Invalid environment: '{}'. Must be 'development' or 'production'",
                s
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    // Storage
    pub database_url: String,
    pub redis_url: Option<String>,
    // Secrets
    pub encryption_key: String,
    // Logging
    pub log_level: String,
    // Exchange
    pub kalshi_api_url: String,
    pub kalshi_ws_url: String,
    pub exchange_rate_limit_per_second: f64,
    pub exchange_rate_limit_burst: f64,
    // Weather providers
    pub nws_api_url: String,
    pub nws_user_agent: String,
    pub nws_rate_limit_per_second: f64,
    pub open_meteo_api_url: String,
    pub open_meteo_rate_limit_per_second: f64,
    // Risk defaults (overridable per user via settings_json)
    pub default_trading_mode: TradingMode,
    pub default_max_trade_size_cents: i64,
    pub default_daily_loss_limit_cents: i64,
    pub default_max_daily_exposure_cents: i64,
    pub default_min_ev_threshold: f64,
    pub default_cooldown_minutes: i64,
    pub default_consecutive_loss_limit: u32,
    pub kelly_cap: f64,
    // Fees (exchange schedule, parameterized pending the published formula)
    pub trade_fee_rate: f64,
    pub settlement_fee_rate: f64,
    // Prediction
    pub ml_ensemble_weight: f64,
    pub ml_model_path: Option<String>,
    pub freshness_cap_minutes: i64,
    // Approval queue
    pub approval_window_minutes: i64,
    // Scheduling
    pub forecast_fetch_interval_minutes: u64,
    pub trade_cycle_interval_minutes: u64,
    pub pending_sweep_interval_secs: u64,
    pub cycle_watchdog_minutes: u64,
    pub request_timeout_secs: u64,
    // Bootstrap credentials (single-user reference deployment)
    pub kalshi_api_key_id: String,
    pub kalshi_private_key_path: Option<String>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = var_or(key, default);
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("Failed to parse {}='{}': {}", key, raw, e))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Don't fail if .env missing

        // The one key with no default: refuses startup when absent.
        let encryption_key = env::var("ENCRYPTION_KEY")
            .context("ENCRYPTION_KEY is required (base64, 32 bytes) and has no default")?;

        Ok(Config {
            environment: parse_var("ENVIRONMENT", "development")?,
            database_url: var_or("DATABASE_URL", "data/boz-weather-trader.db"),
            redis_url: env::var("REDIS_URL").ok(),
            encryption_key,
            log_level: var_or("LOG_LEVEL", "boz_weather_trader=info"),
            kalshi_api_url: var_or("KALSHI_API_URL", "https://api.elections.kalshi.com"),
            kalshi_ws_url: var_or(
                "KALSHI_WS_URL",
                "wss://api.elections.kalshi.com/trade-api/ws/v2",
            ),
            exchange_rate_limit_per_second: parse_var("EXCHANGE_RATE_LIMIT_PER_SECOND", "10.0")?,
            exchange_rate_limit_burst: parse_var("EXCHANGE_RATE_LIMIT_BURST", "10.0")?,
            nws_api_url: var_or("NWS_API_URL", "https://api.weather.gov"),
            nws_user_agent: var_or(
                "NWS_USER_AGENT",
                "boz-weather-trader/0.1 (ops@bozweather.example)",
            ),
            nws_rate_limit_per_second: parse_var("NWS_RATE_LIMIT_PER_SECOND", "1.0")?,
            open_meteo_api_url: var_or("OPEN_METEO_API_URL", "https://api.open-meteo.com"),
            open_meteo_rate_limit_per_second: parse_var("OPEN_METEO_RATE_LIMIT_PER_SECOND", "5.0")?,
            default_trading_mode: parse_var("DEFAULT_TRADING_MODE", "manual")?,
            default_max_trade_size_cents: parse_var("DEFAULT_MAX_TRADE_SIZE_CENTS", "1000")?,
            default_daily_loss_limit_cents: parse_var("DEFAULT_DAILY_LOSS_LIMIT_CENTS", "5000")?,
            default_max_daily_exposure_cents: parse_var(
                "DEFAULT_MAX_DAILY_EXPOSURE_CENTS",
                "20000",
            )?,
            default_min_ev_threshold: parse_var("DEFAULT_MIN_EV_THRESHOLD", "0.05")?,
            default_cooldown_minutes: parse_var("DEFAULT_COOLDOWN_MINUTES", "60")?,
            default_consecutive_loss_limit: parse_var("DEFAULT_CONSECUTIVE_LOSS_LIMIT", "3")?,
            kelly_cap: parse_var("KELLY_CAP", "0.25")?,
            trade_fee_rate: parse_var("TRADE_FEE_RATE", "0.01")?,
            settlement_fee_rate: parse_var("SETTLEMENT_FEE_RATE", "0.10")?,
            ml_ensemble_weight: parse_var("ML_ENSEMBLE_WEIGHT", "0.30")?,
            ml_model_path: env::var("ML_MODEL_PATH").ok(),
            freshness_cap_minutes: parse_var("FRESHNESS_CAP_MINUTES", "120")?,
            approval_window_minutes: parse_var("APPROVAL_WINDOW_MINUTES", "30")?,
            forecast_fetch_interval_minutes: parse_var("FORECAST_FETCH_INTERVAL_MINUTES", "30")?,
            trade_cycle_interval_minutes: parse_var("TRADE_CYCLE_INTERVAL_MINUTES", "15")?,
            pending_sweep_interval_secs: parse_var("PENDING_SWEEP_INTERVAL_SECS", "60")?,
            cycle_watchdog_minutes: parse_var("CYCLE_WATCHDOG_MINUTES", "10")?,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", "30")?,
            kalshi_api_key_id: var_or("KALSHI_API_KEY_ID", ""),
            kalshi_private_key_path: env::var("KALSHI_PRIVATE_KEY_PATH").ok(),
        })
    }

    pub fn is_paper(&self) -> bool {
        self.environment == Environment::Development
    }

    /// All-defaults config for tests, bypassing the environment.
    #[cfg(test)]
    pub fn test_default() -> Config {
        Config {
            environment: Environment::Development,
            database_url: "data/boz-weather-trader.db".into(),
            redis_url: None,
            encryption_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".into(),
            log_level: "boz_weather_trader=info".into(),
            kalshi_api_url: "https://api.elections.kalshi.com".into(),
            kalshi_ws_url: "wss://api.elections.kalshi.com/trade-api/ws/v2".into(),
            exchange_rate_limit_per_second: 10.0,
            exchange_rate_limit_burst: 10.0,
            nws_api_url: "https://api.weather.gov".into(),
            nws_user_agent: "boz-weather-trader/0.1 (ops@bozweather.example)".into(),
            nws_rate_limit_per_second: 1.0,
            open_meteo_api_url: "https://api.open-meteo.com".into(),
            open_meteo_rate_limit_per_second: 5.0,
            default_trading_mode: TradingMode::Manual,
            default_max_trade_size_cents: 1000,
            default_daily_loss_limit_cents: 5000,
            default_max_daily_exposure_cents: 20000,
            default_min_ev_threshold: 0.05,
            default_cooldown_minutes: 60,
            default_consecutive_loss_limit: 3,
            kelly_cap: 0.25,
            trade_fee_rate: 0.01,
            settlement_fee_rate: 0.10,
            ml_ensemble_weight: 0.30,
            ml_model_path: None,
            freshness_cap_minutes: 120,
            approval_window_minutes: 30,
            forecast_fetch_interval_minutes: 30,
            trade_cycle_interval_minutes: 15,
            pending_sweep_interval_secs: 60,
            cycle_watchdog_minutes: 10,
            request_timeout_secs: 30,
            kalshi_api_key_id: String::new(),
            kalshi_private_key_path: None,
        }
    }
}
