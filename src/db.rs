use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Trade lifecycle. UNCERTAIN marks an order whose placement outcome is
/// unknown (timeout after send); reconciliation resolves it to OPEN or
/// CANCELLED before the next cycle trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Uncertain,
    Open,
    Won,
    Lost,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Uncertain => "UNCERTAIN",
            TradeStatus::Open => "OPEN",
            TradeStatus::Won => "WON",
            TradeStatus::Lost => "LOST",
            TradeStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<TradeStatus> {
        match s {
            "UNCERTAIN" => Some(TradeStatus::Uncertain),
            "OPEN" => Some(TradeStatus::Open),
            "WON" => Some(TradeStatus::Won),
            "LOST" => Some(TradeStatus::Lost),
            "CANCELLED" => Some(TradeStatus::Cancelled),
            _ => None,
        }
    }
}

/// Pending-trade state machine: PENDING → {APPROVED→EXECUTED, REJECTED,
/// EXPIRED}. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "PENDING",
            PendingStatus::Approved => "APPROVED",
            PendingStatus::Rejected => "REJECTED",
            PendingStatus::Expired => "EXPIRED",
            PendingStatus::Executed => "EXECUTED",
        }
    }

    pub fn parse(s: &str) -> Option<PendingStatus> {
        match s {
            "PENDING" => Some(PendingStatus::Pending),
            "APPROVED" => Some(PendingStatus::Approved),
            "REJECTED" => Some(PendingStatus::Rejected),
            "EXPIRED" => Some(PendingStatus::Expired),
            "EXECUTED" => Some(PendingStatus::Executed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub api_key_id: String,
    pub encrypted_private_key: String,
    pub settings_json: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ForecastRow {
    pub id: i64,
    pub city: String,
    pub target_date: NaiveDate,
    pub source: String,
    pub predicted_high_f: f64,
    pub model_run_ts: String,
    pub raw_json: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PredictionRow {
    pub id: i64,
    pub city: String,
    pub target_date: NaiveDate,
    pub ensemble_high_f: f64,
    pub bracket_probs_json: String,
    pub confidence: String,
    pub model_sources_json: String,
    pub forecast_spread_f: f64,
    pub error_std_f: f64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub id: String,
    pub user_id: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub bracket_ticker: String,
    pub bracket_label: String,
    pub side: String,
    pub entry_price_cents: i64,
    pub quantity: i64,
    pub model_prob: f64,
    pub market_prob: f64,
    pub ev_at_entry: f64,
    pub confidence: String,
    pub exchange_order_id: Option<String>,
    pub status: String,
    pub settlement_temp_f: Option<f64>,
    pub pnl_cents: Option<i64>,
    pub postmortem: Option<String>,
    pub weather_snapshot_json: String,
    pub prediction_snapshot_json: String,
    pub created_at: String,
    pub settled_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SettlementRow {
    pub city: String,
    pub target_date: NaiveDate,
    pub actual_high_f: f64,
    pub source: String,
    pub raw_json: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PendingTradeRow {
    pub id: String,
    pub user_id: String,
    pub signal_json: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub acted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct GridCacheRow {
    pub city: String,
    pub grid_id: String,
    pub grid_x: i64,
    pub grid_y: i64,
    pub forecast_url: String,
}

/// New-trade insert payload; snapshots are frozen copies of the forecasts
/// and prediction that justified the trade.
#[derive(Debug, Clone)]
pub struct NewTrade<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub city: &'a str,
    pub target_date: NaiveDate,
    pub trade_day: NaiveDate,
    pub bracket_ticker: &'a str,
    pub bracket_label: &'a str,
    pub side: &'a str,
    pub entry_price_cents: i64,
    pub quantity: i64,
    pub model_prob: f64,
    pub market_prob: f64,
    pub ev_at_entry: f64,
    pub confidence: &'a str,
    pub exchange_order_id: Option<&'a str>,
    pub status: TradeStatus,
    pub weather_snapshot_json: &'a str,
    pub prediction_snapshot_json: &'a str,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or(NaiveDate::MIN)
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database: {}", path))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;

        let db = Database {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Direct connection access for ad-hoc queries (tests, tooling).
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("db mutex poisoned")
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                api_key_id TEXT NOT NULL,
                encrypted_private_key TEXT NOT NULL,
                settings_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS weather_forecasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                source TEXT NOT NULL,
                predicted_high_f REAL NOT NULL,
                model_run_ts TEXT NOT NULL,
                raw_json TEXT NOT NULL DEFAULT '{}',
                fetched_at TEXT NOT NULL,
                UNIQUE(city, target_date, source, model_run_ts)
            );

            CREATE TABLE IF NOT EXISTS predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                ensemble_high_f REAL NOT NULL,
                bracket_probs_json TEXT NOT NULL,
                confidence TEXT NOT NULL,
                model_sources_json TEXT NOT NULL,
                forecast_spread_f REAL NOT NULL,
                error_std_f REAL NOT NULL,
                generated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                trade_day TEXT NOT NULL,
                bracket_ticker TEXT NOT NULL,
                bracket_label TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price_cents INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                model_prob REAL NOT NULL,
                market_prob REAL NOT NULL,
                ev_at_entry REAL NOT NULL,
                confidence TEXT NOT NULL,
                exchange_order_id TEXT,
                status TEXT NOT NULL,
                settlement_temp_f REAL,
                pnl_cents INTEGER,
                postmortem TEXT,
                weather_snapshot_json TEXT NOT NULL,
                prediction_snapshot_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                settled_at TEXT,
                settled_day TEXT
            );

            CREATE TABLE IF NOT EXISTS settlements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                target_date TEXT NOT NULL,
                actual_high_f REAL NOT NULL,
                source TEXT NOT NULL DEFAULT 'NWS_CLI',
                raw_json TEXT NOT NULL DEFAULT '{}',
                fetched_at TEXT NOT NULL,
                UNIQUE(city, target_date)
            );

            CREATE TABLE IF NOT EXISTS pending_trades (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                signal_json TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                acted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                level TEXT NOT NULL,
                module TEXT NOT NULL,
                message TEXT NOT NULL,
                data_json TEXT
            );

            CREATE TABLE IF NOT EXISTS forecast_grids (
                city TEXT PRIMARY KEY,
                grid_id TEXT NOT NULL,
                grid_x INTEGER NOT NULL,
                grid_y INTEGER NOT NULL,
                forecast_url TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_forecasts_lookup
                ON weather_forecasts(city, target_date, fetched_at);
            CREATE INDEX IF NOT EXISTS idx_predictions_lookup
                ON predictions(city, target_date, generated_at);
            CREATE INDEX IF NOT EXISTS idx_trades_user_status
                ON trades(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_trades_city_date
                ON trades(city, target_date);
            CREATE INDEX IF NOT EXISTS idx_pending_status
                ON pending_trades(status, expires_at);
            ",
            )
            .context("Failed to run database migrations")?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    pub fn upsert_user(
        &self,
        id: &str,
        api_key_id: &str,
        encrypted_private_key: &str,
        settings_json: &str,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users (id, api_key_id, encrypted_private_key, settings_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                api_key_id = excluded.api_key_id,
                encrypted_private_key = excluded.encrypted_private_key,
                settings_json = excluded.settings_json",
                rusqlite::params![id, api_key_id, encrypted_private_key, settings_json],
            )
            .context("Failed to upsert user")?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, api_key_id, encrypted_private_key, settings_json, created_at
             FROM users WHERE id = ?1",
            )
            .context("Failed to prepare user query")?;
        let row = stmt
            .query_row([id], |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    api_key_id: row.get(1)?,
                    encrypted_private_key: row.get(2)?,
                    settings_json: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .ok();
        Ok(row)
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, api_key_id, encrypted_private_key, settings_json, created_at
             FROM users ORDER BY created_at",
            )
            .context("Failed to prepare users query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    api_key_id: row.get(1)?,
                    encrypted_private_key: row.get(2)?,
                    settings_json: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?);
        }
        Ok(users)
    }

    // ── Forecasts ──────────────────────────────────────────────────────

    /// Idempotent on (city, target_date, source, model_run_ts); late
    /// arrivals never overwrite. Returns true when a new row was written.
    pub fn insert_forecast(
        &self,
        city: &str,
        target_date: NaiveDate,
        source: &str,
        predicted_high_f: f64,
        model_run_ts: &str,
        raw_json: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO weather_forecasts
             (city, target_date, source, predicted_high_f, model_run_ts, raw_json, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    city,
                    target_date.to_string(),
                    source,
                    predicted_high_f,
                    model_run_ts,
                    raw_json,
                    ts(fetched_at)
                ],
            )
            .context("Failed to insert forecast")?;
        Ok(n > 0)
    }

    /// Newest forecast per source for (city, target_date), newest first.
    pub fn newest_forecasts(&self, city: &str, target_date: NaiveDate) -> Result<Vec<ForecastRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, city, target_date, source, predicted_high_f, model_run_ts, raw_json, fetched_at
             FROM weather_forecasts wf
             WHERE city = ?1 AND target_date = ?2
               AND fetched_at = (
                   SELECT MAX(fetched_at) FROM weather_forecasts w2
                   WHERE w2.city = wf.city AND w2.target_date = wf.target_date
                     AND w2.source = wf.source
               )
             ORDER BY fetched_at DESC, source",
            )
            .context("Failed to prepare newest forecasts query")?;
        let rows = stmt
            .query_map(rusqlite::params![city, target_date.to_string()], |row| {
                Ok(ForecastRow {
                    id: row.get(0)?,
                    city: row.get(1)?,
                    target_date: parse_date(&row.get::<_, String>(2)?),
                    source: row.get(3)?,
                    predicted_high_f: row.get(4)?,
                    model_run_ts: row.get(5)?,
                    raw_json: row.get(6)?,
                    fetched_at: parse_ts(&row.get::<_, String>(7)?),
                })
            })
            .context("Failed to query newest forecasts")?;
        let mut forecasts = Vec::new();
        for row in rows {
            forecasts.push(row.context("Failed to read forecast row")?);
        }
        Ok(forecasts)
    }

    /// Fetch time of the single newest forecast for (city, target_date).
    pub fn newest_forecast_at(
        &self,
        city: &str,
        target_date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>> {
        let newest: Option<String> = self
            .conn()
            .query_row(
                "SELECT MAX(fetched_at) FROM weather_forecasts
             WHERE city = ?1 AND target_date = ?2",
                rusqlite::params![city, target_date.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get newest forecast time")?;
        Ok(newest.map(|s| parse_ts(&s)))
    }

    // ── Predictions ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_prediction(
        &self,
        city: &str,
        target_date: NaiveDate,
        ensemble_high_f: f64,
        bracket_probs_json: &str,
        confidence: &str,
        model_sources_json: &str,
        forecast_spread_f: f64,
        error_std_f: f64,
        generated_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO predictions
             (city, target_date, ensemble_high_f, bracket_probs_json, confidence,
              model_sources_json, forecast_spread_f, error_std_f, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                city,
                target_date.to_string(),
                ensemble_high_f,
                bracket_probs_json,
                confidence,
                model_sources_json,
                forecast_spread_f,
                error_std_f,
                ts(generated_at)
            ],
        )
        .context("Failed to insert prediction")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_prediction(
        &self,
        city: &str,
        target_date: NaiveDate,
    ) -> Result<Option<PredictionRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, city, target_date, ensemble_high_f, bracket_probs_json, confidence,
                    model_sources_json, forecast_spread_f, error_std_f, generated_at
             FROM predictions
             WHERE city = ?1 AND target_date = ?2
             ORDER BY generated_at DESC LIMIT 1",
            )
            .context("Failed to prepare latest prediction query")?;
        let row = stmt
            .query_row(rusqlite::params![city, target_date.to_string()], |row| {
                Ok(PredictionRow {
                    id: row.get(0)?,
                    city: row.get(1)?,
                    target_date: parse_date(&row.get::<_, String>(2)?),
                    ensemble_high_f: row.get(3)?,
                    bracket_probs_json: row.get(4)?,
                    confidence: row.get(5)?,
                    model_sources_json: row.get(6)?,
                    forecast_spread_f: row.get(7)?,
                    error_std_f: row.get(8)?,
                    generated_at: parse_ts(&row.get::<_, String>(9)?),
                })
            })
            .ok();
        Ok(row)
    }

    /// Historical (actual − predicted) errors for the city in the given
    /// season months, using the last prediction generated per target date.
    pub fn error_samples(&self, city: &str, months: [u32; 3]) -> Result<Vec<f64>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.actual_high_f - p.ensemble_high_f
             FROM settlements s
             JOIN predictions p
               ON p.city = s.city AND p.target_date = s.target_date
             WHERE s.city = ?1
               AND CAST(strftime('%m', s.target_date) AS INTEGER) IN (?2, ?3, ?4)
               AND p.generated_at = (
                   SELECT MAX(generated_at) FROM predictions p2
                   WHERE p2.city = p.city AND p2.target_date = p.target_date
               )",
            )
            .context("Failed to prepare error samples query")?;
        let rows = stmt
            .query_map(
                rusqlite::params![city, months[0], months[1], months[2]],
                |row| row.get::<_, f64>(0),
            )
            .context("Failed to query error samples")?;
        let mut samples = Vec::new();
        for row in rows {
            samples.push(row.context("Failed to read error sample")?);
        }
        Ok(samples)
    }

    // ── Trades ─────────────────────────────────────────────────────────

    pub fn insert_trade(&self, trade: &NewTrade) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO trades
             (id, user_id, city, target_date, trade_day, bracket_ticker, bracket_label, side,
              entry_price_cents, quantity, model_prob, market_prob, ev_at_entry, confidence,
              exchange_order_id, status, weather_snapshot_json, prediction_snapshot_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                rusqlite::params![
                    trade.id,
                    trade.user_id,
                    trade.city,
                    trade.target_date.to_string(),
                    trade.trade_day.to_string(),
                    trade.bracket_ticker,
                    trade.bracket_label,
                    trade.side,
                    trade.entry_price_cents,
                    trade.quantity,
                    trade.model_prob,
                    trade.market_prob,
                    trade.ev_at_entry,
                    trade.confidence,
                    trade.exchange_order_id,
                    trade.status.as_str(),
                    trade.weather_snapshot_json,
                    trade.prediction_snapshot_json,
                ],
            )
            .context("Failed to insert trade")?;
        Ok(())
    }

    fn trade_from_row(row: &rusqlite::Row) -> rusqlite::Result<TradeRow> {
        Ok(TradeRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            city: row.get(2)?,
            target_date: parse_date(&row.get::<_, String>(3)?),
            bracket_ticker: row.get(4)?,
            bracket_label: row.get(5)?,
            side: row.get(6)?,
            entry_price_cents: row.get(7)?,
            quantity: row.get(8)?,
            model_prob: row.get(9)?,
            market_prob: row.get(10)?,
            ev_at_entry: row.get(11)?,
            confidence: row.get(12)?,
            exchange_order_id: row.get(13)?,
            status: row.get(14)?,
            settlement_temp_f: row.get(15)?,
            pnl_cents: row.get(16)?,
            postmortem: row.get(17)?,
            weather_snapshot_json: row.get(18)?,
            prediction_snapshot_json: row.get(19)?,
            created_at: row.get(20)?,
            settled_at: row.get(21)?,
        })
    }

    const TRADE_COLS: &'static str = "id, user_id, city, target_date, bracket_ticker, bracket_label, side, \
         entry_price_cents, quantity, model_prob, market_prob, ev_at_entry, confidence, \
         exchange_order_id, status, settlement_temp_f, pnl_cents, postmortem, \
         weather_snapshot_json, prediction_snapshot_json, created_at, settled_at";

    pub fn get_trade(&self, id: &str) -> Result<Option<TradeRow>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM trades WHERE id = ?1", Self::TRADE_COLS);
        let mut stmt = conn.prepare(&sql).context("Failed to prepare trade query")?;
        Ok(stmt.query_row([id], Self::trade_from_row).ok())
    }

    pub fn trades_with_status(
        &self,
        city: &str,
        target_date: NaiveDate,
        status: TradeStatus,
    ) -> Result<Vec<TradeRow>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM trades WHERE city = ?1 AND target_date = ?2 AND status = ?3
             ORDER BY created_at",
            Self::TRADE_COLS
        );
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare trades query")?;
        let rows = stmt
            .query_map(
                rusqlite::params![city, target_date.to_string(), status.as_str()],
                Self::trade_from_row,
            )
            .context("Failed to query trades")?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.context("Failed to read trade row")?);
        }
        Ok(trades)
    }

    pub fn trades_for_user_with_status(
        &self,
        user_id: &str,
        status: TradeStatus,
    ) -> Result<Vec<TradeRow>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM trades WHERE user_id = ?1 AND status = ?2 ORDER BY created_at",
            Self::TRADE_COLS
        );
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare user trades query")?;
        let rows = stmt
            .query_map(
                rusqlite::params![user_id, status.as_str()],
                Self::trade_from_row,
            )
            .context("Failed to query user trades")?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.context("Failed to read trade row")?);
        }
        Ok(trades)
    }

    /// Settle an OPEN trade. At most one transition per trade: the guard on
    /// status makes duplicate settlement messages no-ops.
    #[allow(clippy::too_many_arguments)]
    pub fn settle_trade(
        &self,
        id: &str,
        status: TradeStatus,
        settlement_temp_f: f64,
        pnl_cents: i64,
        postmortem: &str,
        settled_at: DateTime<Utc>,
        settled_day: NaiveDate,
    ) -> Result<bool> {
        let n = self
            .conn()
            .execute(
                "UPDATE trades SET status = ?1, settlement_temp_f = ?2, pnl_cents = ?3,
                    postmortem = ?4, settled_at = ?5, settled_day = ?6
             WHERE id = ?7 AND status = 'OPEN'",
                rusqlite::params![
                    status.as_str(),
                    settlement_temp_f,
                    pnl_cents,
                    postmortem,
                    ts(settled_at),
                    settled_day.to_string(),
                    id
                ],
            )
            .context("Failed to settle trade")?;
        Ok(n > 0)
    }

    /// Resolve an UNCERTAIN order after reconciliation against positions.
    pub fn resolve_uncertain_trade(
        &self,
        id: &str,
        resolved: TradeStatus,
        exchange_order_id: Option<&str>,
    ) -> Result<bool> {
        let n = self
            .conn()
            .execute(
                "UPDATE trades SET status = ?1,
                    exchange_order_id = COALESCE(?2, exchange_order_id)
             WHERE id = ?3 AND status = 'UNCERTAIN'",
                rusqlite::params![resolved.as_str(), exchange_order_id, id],
            )
            .context("Failed to resolve uncertain trade")?;
        Ok(n > 0)
    }

    // ── Risk state queries (ledger-derived) ────────────────────────────

    /// Cents opened on `trade_day` (entry cost), cancelled trades excluded.
    pub fn daily_exposure_cents(&self, user_id: &str, trade_day: NaiveDate) -> Result<i64> {
        let cents: i64 = self
            .conn()
            .query_row(
                "SELECT COALESCE(SUM(entry_price_cents * quantity), 0) FROM trades
             WHERE user_id = ?1 AND trade_day = ?2 AND status != 'CANCELLED'",
                rusqlite::params![user_id, trade_day.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get daily exposure")?;
        Ok(cents)
    }

    /// Realized P&L of trades settled on `settled_day` (standard time).
    pub fn daily_realized_pnl_cents(&self, user_id: &str, settled_day: NaiveDate) -> Result<i64> {
        let cents: i64 = self
            .conn()
            .query_row(
                "SELECT COALESCE(SUM(pnl_cents), 0) FROM trades
             WHERE user_id = ?1 AND settled_day = ?2 AND status IN ('WON', 'LOST')",
                rusqlite::params![user_id, settled_day.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get daily realized pnl")?;
        Ok(cents)
    }

    /// Trailing run of LOST settlements (reset by the most recent WON).
    pub fn consecutive_losses(&self, user_id: &str) -> Result<u32> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT status FROM trades
             WHERE user_id = ?1 AND status IN ('WON', 'LOST')
             ORDER BY settled_at DESC LIMIT 100",
            )
            .context("Failed to prepare consecutive losses query")?;
        let rows = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))
            .context("Failed to query consecutive losses")?;
        let mut count = 0u32;
        for row in rows {
            match row.context("Failed to read status")?.as_str() {
                "LOST" => count += 1,
                _ => break,
            }
        }
        Ok(count)
    }

    pub fn last_loss_at(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let last: Option<String> = self
            .conn()
            .query_row(
                "SELECT MAX(settled_at) FROM trades
             WHERE user_id = ?1 AND status = 'LOST'",
                [user_id],
                |row| row.get(0),
            )
            .context("Failed to get last loss time")?;
        Ok(last.map(|s| parse_ts(&s)))
    }

    // ── Settlements ────────────────────────────────────────────────────

    /// Idempotent on (city, target_date). Returns true on first write.
    pub fn insert_settlement(
        &self,
        city: &str,
        target_date: NaiveDate,
        actual_high_f: f64,
        source: &str,
        raw_json: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO settlements
             (city, target_date, actual_high_f, source, raw_json, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    city,
                    target_date.to_string(),
                    actual_high_f,
                    source,
                    raw_json,
                    ts(fetched_at)
                ],
            )
            .context("Failed to insert settlement")?;
        Ok(n > 0)
    }

    pub fn get_settlement(&self, city: &str, target_date: NaiveDate) -> Result<Option<SettlementRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT city, target_date, actual_high_f, source, raw_json, fetched_at
             FROM settlements WHERE city = ?1 AND target_date = ?2",
            )
            .context("Failed to prepare settlement query")?;
        let row = stmt
            .query_row(rusqlite::params![city, target_date.to_string()], |row| {
                Ok(SettlementRow {
                    city: row.get(0)?,
                    target_date: parse_date(&row.get::<_, String>(1)?),
                    actual_high_f: row.get(2)?,
                    source: row.get(3)?,
                    raw_json: row.get(4)?,
                    fetched_at: parse_ts(&row.get::<_, String>(5)?),
                })
            })
            .ok();
        Ok(row)
    }

    // ── Pending trades (approval queue) ────────────────────────────────

    pub fn insert_pending_trade(
        &self,
        id: &str,
        user_id: &str,
        signal_json: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO pending_trades (id, user_id, signal_json, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, 'PENDING', ?4, ?5)",
                rusqlite::params![id, user_id, signal_json, ts(created_at), ts(expires_at)],
            )
            .context("Failed to insert pending trade")?;
        Ok(())
    }

    pub fn get_pending_trade(&self, id: &str) -> Result<Option<PendingTradeRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, signal_json, status, created_at, expires_at, acted_at
             FROM pending_trades WHERE id = ?1",
            )
            .context("Failed to prepare pending trade query")?;
        let row = stmt
            .query_row([id], |row| {
                Ok(PendingTradeRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    signal_json: row.get(2)?,
                    status: row.get(3)?,
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                    expires_at: parse_ts(&row.get::<_, String>(5)?),
                    acted_at: row.get::<_, Option<String>>(6)?.map(|s| parse_ts(&s)),
                })
            })
            .ok();
        Ok(row)
    }

    /// Compare-and-swap on pending status. Returns false when the row was
    /// not in `from`; the caller reports a conflict instead of acting twice.
    pub fn cas_pending_status(
        &self,
        id: &str,
        from: PendingStatus,
        to: PendingStatus,
        acted_at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self
            .conn()
            .execute(
                "UPDATE pending_trades SET status = ?1, acted_at = ?2
             WHERE id = ?3 AND status = ?4",
                rusqlite::params![to.as_str(), ts(acted_at), id, from.as_str()],
            )
            .context("Failed to CAS pending trade status")?;
        Ok(n > 0)
    }

    /// Sweep PENDING rows whose TTL has lapsed. Returns the expired count.
    pub fn expire_pending_trades(&self, now: DateTime<Utc>) -> Result<usize> {
        let n = self
            .conn()
            .execute(
                "UPDATE pending_trades SET status = 'EXPIRED', acted_at = ?1
             WHERE status = 'PENDING' AND expires_at <= ?1",
                rusqlite::params![ts(now)],
            )
            .context("Failed to expire pending trades")?;
        Ok(n)
    }

    pub fn pending_trades_for_user(&self, user_id: &str) -> Result<Vec<PendingTradeRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, signal_json, status, created_at, expires_at, acted_at
             FROM pending_trades WHERE user_id = ?1 AND status = 'PENDING'
             ORDER BY created_at",
            )
            .context("Failed to prepare pending trades query")?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok(PendingTradeRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    signal_json: row.get(2)?,
                    status: row.get(3)?,
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                    expires_at: parse_ts(&row.get::<_, String>(5)?),
                    acted_at: row.get::<_, Option<String>>(6)?.map(|s| parse_ts(&s)),
                })
            })
            .context("Failed to query pending trades")?;
        let mut pending = Vec::new();
        for row in rows {
            pending.push(row.context("Failed to read pending trade row")?);
        }
        Ok(pending)
    }

    // ── Grid cache ─────────────────────────────────────────────────────

    pub fn get_forecast_grid(&self, city: &str) -> Result<Option<GridCacheRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT city, grid_id, grid_x, grid_y, forecast_url
             FROM forecast_grids WHERE city = ?1",
            )
            .context("Failed to prepare grid query")?;
        let row = stmt
            .query_row([city], |row| {
                Ok(GridCacheRow {
                    city: row.get(0)?,
                    grid_id: row.get(1)?,
                    grid_x: row.get(2)?,
                    grid_y: row.get(3)?,
                    forecast_url: row.get(4)?,
                })
            })
            .ok();
        Ok(row)
    }

    pub fn put_forecast_grid(&self, grid: &GridCacheRow) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO forecast_grids (city, grid_id, grid_x, grid_y, forecast_url)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(city) DO UPDATE SET
                grid_id = excluded.grid_id,
                grid_x = excluded.grid_x,
                grid_y = excluded.grid_y,
                forecast_url = excluded.forecast_url,
                updated_at = datetime('now')",
                rusqlite::params![
                    grid.city,
                    grid.grid_id,
                    grid.grid_x,
                    grid.grid_y,
                    grid.forecast_url
                ],
            )
            .context("Failed to store forecast grid")?;
        Ok(())
    }

    // ── Operational log ────────────────────────────────────────────────

    pub fn log_event(
        &self,
        level: &str,
        module: &str,
        message: &str,
        data_json: Option<&str>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO log_entries (level, module, message, data_json)
             VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![level, module, message, data_json],
            )
            .context("Failed to write log entry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn insert_test_user(db: &Database, id: &str) {
        db.upsert_user(id, "key-id-1", "encrypted-blob", "{}").unwrap();
    }

    fn sample_trade<'a>(id: &'a str, user: &'a str) -> NewTrade<'a> {
        NewTrade {
            id,
            user_id: user,
            city: "NYC",
            target_date: date(2026, 2, 18),
            trade_day: date(2026, 2, 18),
            bracket_ticker: "KXHIGHNY-26FEB18-B53",
            bracket_label: "52-54°",
            side: "yes",
            entry_price_cents: 22,
            quantity: 1,
            model_prob: 0.26,
            market_prob: 0.22,
            ev_at_entry: 0.04,
            confidence: "MEDIUM",
            exchange_order_id: Some("ord-1"),
            status: TradeStatus::Open,
            weather_snapshot_json: "[]",
            prediction_snapshot_json: "{}",
        }
    }

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for expected in [
            "users",
            "weather_forecasts",
            "predictions",
            "trades",
            "settlements",
            "pending_trades",
            "log_entries",
            "forecast_grids",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_user_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user("u1", "key-a", "cipher-a", "{}").unwrap();
        db.upsert_user("u1", "key-b", "cipher-b", "{\"kelly_cap\":0.1}")
            .unwrap();

        let user = db.get_user("u1").unwrap().unwrap();
        assert_eq!(user.api_key_id, "key-b");
        assert_eq!(user.encrypted_private_key, "cipher-b");
        assert_eq!(db.list_users().unwrap().len(), 1);
        assert!(db.get_user("missing").unwrap().is_none());
    }

    #[test]
    fn test_forecast_write_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let fetched = at(2026, 2, 18, 12, 0);
        let inserted = db
            .insert_forecast("NYC", date(2026, 2, 18), "NWS", 55.0, "2026-02-18T06:00:00Z", "{}", fetched)
            .unwrap();
        assert!(inserted);

        // Same uniqueness key: ignored, original row survives
        let again = db
            .insert_forecast("NYC", date(2026, 2, 18), "NWS", 99.0, "2026-02-18T06:00:00Z", "{}", fetched)
            .unwrap();
        assert!(!again);

        let rows = db.newest_forecasts("NYC", date(2026, 2, 18)).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].predicted_high_f - 55.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_newest_forecasts_latest_per_source() {
        let db = Database::open_in_memory().unwrap();
        let d = date(2026, 2, 18);
        db.insert_forecast("NYC", d, "NWS", 54.0, "run-a", "{}", at(2026, 2, 18, 6, 0))
            .unwrap();
        db.insert_forecast("NYC", d, "NWS", 55.0, "run-b", "{}", at(2026, 2, 18, 12, 0))
            .unwrap();
        db.insert_forecast("NYC", d, "ECMWF", 53.0, "run-a", "{}", at(2026, 2, 18, 9, 0))
            .unwrap();

        let rows = db.newest_forecasts("NYC", d).unwrap();
        assert_eq!(rows.len(), 2);
        let nws = rows.iter().find(|r| r.source == "NWS").unwrap();
        assert!((nws.predicted_high_f - 55.0).abs() < f64::EPSILON);

        let newest = db.newest_forecast_at("NYC", d).unwrap().unwrap();
        assert_eq!(newest, at(2026, 2, 18, 12, 0));
        assert!(db.newest_forecast_at("CHI", d).unwrap().is_none());
    }

    #[test]
    fn test_prediction_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let d = date(2026, 2, 18);
        db.insert_prediction("NYC", d, 54.1, "[]", "MEDIUM", "[\"NWS\"]", 2.0, 3.0, at(2026, 2, 18, 12, 0))
            .unwrap();
        db.insert_prediction("NYC", d, 54.5, "[]", "HIGH", "[\"NWS\",\"ECMWF\"]", 1.0, 2.5, at(2026, 2, 18, 13, 0))
            .unwrap();

        let latest = db.latest_prediction("NYC", d).unwrap().unwrap();
        assert!((latest.ensemble_high_f - 54.5).abs() < f64::EPSILON);
        assert_eq!(latest.confidence, "HIGH");
        assert!(db.latest_prediction("CHI", d).unwrap().is_none());
    }

    #[test]
    fn test_error_samples_by_season() {
        let db = Database::open_in_memory().unwrap();
        // January (winter) pair: error = 51.0 - 54.0 = -3.0
        db.insert_prediction("NYC", date(2026, 1, 10), 54.0, "[]", "LOW", "[]", 2.0, 3.0, at(2026, 1, 10, 12, 0))
            .unwrap();
        db.insert_settlement("NYC", date(2026, 1, 10), 51.0, "NWS_CLI", "{}", at(2026, 1, 11, 13, 0))
            .unwrap();
        // July (summer) pair: should not appear in winter samples
        db.insert_prediction("NYC", date(2026, 7, 10), 88.0, "[]", "LOW", "[]", 2.0, 3.0, at(2026, 7, 10, 12, 0))
            .unwrap();
        db.insert_settlement("NYC", date(2026, 7, 10), 90.0, "NWS_CLI", "{}", at(2026, 7, 11, 13, 0))
            .unwrap();

        let winter = db.error_samples("NYC", [12, 1, 2]).unwrap();
        assert_eq!(winter.len(), 1);
        assert!((winter[0] - (-3.0)).abs() < 1e-9);

        let summer = db.error_samples("NYC", [6, 7, 8]).unwrap();
        assert_eq!(summer.len(), 1);
        assert!((summer[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_trade_insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        db.insert_trade(&sample_trade("t1", "u1")).unwrap();

        let trade = db.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.bracket_ticker, "KXHIGHNY-26FEB18-B53");
        assert_eq!(trade.entry_price_cents, 22);
        assert_eq!(trade.status, "OPEN");
        assert!(trade.settlement_temp_f.is_none());
        assert!(trade.pnl_cents.is_none());
    }

    #[test]
    fn test_settle_trade_at_most_once() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        db.insert_trade(&sample_trade("t1", "u1")).unwrap();

        let first = db
            .settle_trade("t1", TradeStatus::Won, 53.4, 70, "won it", at(2026, 2, 19, 13, 0), date(2026, 2, 19))
            .unwrap();
        assert!(first);

        // Duplicate settlement message: status no longer OPEN, no-op
        let second = db
            .settle_trade("t1", TradeStatus::Lost, 53.4, -22, "dup", at(2026, 2, 19, 14, 0), date(2026, 2, 19))
            .unwrap();
        assert!(!second);

        let trade = db.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.status, "WON");
        assert_eq!(trade.pnl_cents, Some(70));
        // Settlement fields are non-null together once terminal
        assert!(trade.settlement_temp_f.is_some());
        assert!(trade.settled_at.is_some());
        assert!(trade.postmortem.is_some());
    }

    #[test]
    fn test_resolve_uncertain_trade() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        let mut t = sample_trade("t1", "u1");
        t.status = TradeStatus::Uncertain;
        t.exchange_order_id = None;
        db.insert_trade(&t).unwrap();

        assert!(db
            .resolve_uncertain_trade("t1", TradeStatus::Open, Some("ord-9"))
            .unwrap());
        let trade = db.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.status, "OPEN");
        assert_eq!(trade.exchange_order_id.as_deref(), Some("ord-9"));

        // Second resolution finds nothing UNCERTAIN
        assert!(!db
            .resolve_uncertain_trade("t1", TradeStatus::Cancelled, None)
            .unwrap());
    }

    #[test]
    fn test_daily_exposure_excludes_cancelled() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        db.insert_trade(&sample_trade("t1", "u1")).unwrap(); // 22 * 1
        let mut t2 = sample_trade("t2", "u1");
        t2.entry_price_cents = 30;
        t2.quantity = 3;
        db.insert_trade(&t2).unwrap(); // 90
        let mut t3 = sample_trade("t3", "u1");
        t3.status = TradeStatus::Cancelled;
        t3.entry_price_cents = 50;
        db.insert_trade(&t3).unwrap(); // excluded

        let exposure = db.daily_exposure_cents("u1", date(2026, 2, 18)).unwrap();
        assert_eq!(exposure, 22 + 90);
        assert_eq!(db.daily_exposure_cents("u1", date(2026, 2, 19)).unwrap(), 0);
    }

    #[test]
    fn test_daily_realized_pnl() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        db.insert_trade(&sample_trade("t1", "u1")).unwrap();
        db.insert_trade(&sample_trade("t2", "u1")).unwrap();
        db.settle_trade("t1", TradeStatus::Won, 53.4, 70, "won", at(2026, 2, 19, 13, 0), date(2026, 2, 19))
            .unwrap();
        db.settle_trade("t2", TradeStatus::Lost, 49.0, -22, "lost", at(2026, 2, 19, 13, 0), date(2026, 2, 19))
            .unwrap();

        assert_eq!(db.daily_realized_pnl_cents("u1", date(2026, 2, 19)).unwrap(), 48);
        assert_eq!(db.daily_realized_pnl_cents("u1", date(2026, 2, 18)).unwrap(), 0);
    }

    #[test]
    fn test_consecutive_losses_reset_by_win() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        for (id, status, hour) in [
            ("t1", TradeStatus::Lost, 10),
            ("t2", TradeStatus::Won, 11),
            ("t3", TradeStatus::Lost, 12),
            ("t4", TradeStatus::Lost, 13),
        ] {
            db.insert_trade(&sample_trade(id, "u1")).unwrap();
            db.settle_trade(id, status, 50.0, if status == TradeStatus::Won { 70 } else { -22 }, "x", at(2026, 2, 19, hour, 0), date(2026, 2, 19))
                .unwrap();
        }

        // Most recent two are losses; the win before them stops the run
        assert_eq!(db.consecutive_losses("u1").unwrap(), 2);
        assert_eq!(
            db.last_loss_at("u1").unwrap().unwrap(),
            at(2026, 2, 19, 13, 0)
        );
    }

    #[test]
    fn test_consecutive_losses_empty_ledger() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        assert_eq!(db.consecutive_losses("u1").unwrap(), 0);
        assert!(db.last_loss_at("u1").unwrap().is_none());
    }

    #[test]
    fn test_settlement_write_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let d = date(2026, 2, 18);
        assert!(db
            .insert_settlement("NYC", d, 53.4, "NWS_CLI", "{}", at(2026, 2, 19, 13, 0))
            .unwrap());
        // Duplicate rejected by the unique (city, target_date) key
        assert!(!db
            .insert_settlement("NYC", d, 99.0, "NWS_CLI", "{}", at(2026, 2, 19, 14, 0))
            .unwrap());

        let settlement = db.get_settlement("NYC", d).unwrap().unwrap();
        assert!((settlement.actual_high_f - 53.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pending_trade_cas_transitions() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        let created = at(2026, 2, 18, 12, 0);
        db.insert_pending_trade("p1", "u1", "{\"city\":\"NYC\"}", created, created + chrono::Duration::minutes(30))
            .unwrap();

        let acted = at(2026, 2, 18, 12, 5);
        assert!(db
            .cas_pending_status("p1", PendingStatus::Pending, PendingStatus::Approved, acted)
            .unwrap());
        // Double-approve: CAS fails, caller raises conflict
        assert!(!db
            .cas_pending_status("p1", PendingStatus::Pending, PendingStatus::Approved, acted)
            .unwrap());
        assert!(db
            .cas_pending_status("p1", PendingStatus::Approved, PendingStatus::Executed, acted)
            .unwrap());

        let row = db.get_pending_trade("p1").unwrap().unwrap();
        assert_eq!(row.status, "EXECUTED");
    }

    #[test]
    fn test_expire_pending_trades_sweep() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        let t0 = at(2026, 2, 18, 12, 0);
        db.insert_pending_trade("p1", "u1", "{}", t0, t0 + chrono::Duration::minutes(30))
            .unwrap();
        db.insert_pending_trade("p2", "u1", "{}", t0, t0 + chrono::Duration::minutes(90))
            .unwrap();

        // Sweep at t+35min: only p1 has lapsed
        let expired = db.expire_pending_trades(t0 + chrono::Duration::minutes(35)).unwrap();
        assert_eq!(expired, 1);
        assert_eq!(db.get_pending_trade("p1").unwrap().unwrap().status, "EXPIRED");
        assert_eq!(db.get_pending_trade("p2").unwrap().unwrap().status, "PENDING");

        // Terminal state: a later approve CAS fails
        assert!(!db
            .cas_pending_status("p1", PendingStatus::Pending, PendingStatus::Approved, t0)
            .unwrap());
    }

    #[test]
    fn test_pending_trades_for_user_only_pending() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        let t0 = at(2026, 2, 18, 12, 0);
        db.insert_pending_trade("p1", "u1", "{}", t0, t0 + chrono::Duration::minutes(30))
            .unwrap();
        db.insert_pending_trade("p2", "u1", "{}", t0, t0 + chrono::Duration::minutes(30))
            .unwrap();
        db.cas_pending_status("p2", PendingStatus::Pending, PendingStatus::Rejected, t0)
            .unwrap();

        let pending = db.pending_trades_for_user("u1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "p1");
    }

    #[test]
    fn test_grid_cache_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_forecast_grid("NYC").unwrap().is_none());

        db.put_forecast_grid(&GridCacheRow {
            city: "NYC".into(),
            grid_id: "OKX".into(),
            grid_x: 33,
            grid_y: 37,
            forecast_url: "https://api.weather.gov/gridpoints/OKX/33,37/forecast".into(),
        })
        .unwrap();

        let grid = db.get_forecast_grid("NYC").unwrap().unwrap();
        assert_eq!(grid.grid_id, "OKX");
        assert_eq!(grid.grid_x, 33);

        // Upsert replaces
        db.put_forecast_grid(&GridCacheRow {
            city: "NYC".into(),
            grid_id: "OKX".into(),
            grid_x: 34,
            grid_y: 38,
            forecast_url: "https://api.weather.gov/gridpoints/OKX/34,38/forecast".into(),
        })
        .unwrap();
        assert_eq!(db.get_forecast_grid("NYC").unwrap().unwrap().grid_x, 34);
    }

    #[test]
    fn test_trades_with_status_filter() {
        let db = Database::open_in_memory().unwrap();
        insert_test_user(&db, "u1");
        db.insert_trade(&sample_trade("t1", "u1")).unwrap();
        db.insert_trade(&sample_trade("t2", "u1")).unwrap();
        db.settle_trade("t2", TradeStatus::Won, 53.4, 70, "x", at(2026, 2, 19, 13, 0), date(2026, 2, 19))
            .unwrap();

        let open = db
            .trades_with_status("NYC", date(2026, 2, 18), TradeStatus::Open)
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "t1");

        let won = db
            .trades_for_user_with_status("u1", TradeStatus::Won)
            .unwrap();
        assert_eq!(won.len(), 1);
        assert_eq!(won[0].id, "t2");
    }

    #[test]
    fn test_log_event() {
        let db = Database::open_in_memory().unwrap();
        db.log_event("WARN", "risk", "deny: StaleData", Some("{\"city\":\"NYC\"}"))
            .unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM log_entries WHERE module = 'risk'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
