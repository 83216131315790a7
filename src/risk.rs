use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, TradingMode};
use crate::db::Database;
use crate::errors::{context_insert, ErrorContext};
use crate::ev_scanner::TradeSignal;

/// First deny short-circuits; the reason lands in logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    StaleData,
    MinEvNotMet,
    SizeCap,
    ExposureCap,
    DailyLossCap,
    Cooldown,
    ConsecutiveLossCap,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::StaleData => "StaleData",
            DenyReason::MinEvNotMet => "MinEvNotMet",
            DenyReason::SizeCap => "SizeCap",
            DenyReason::ExposureCap => "ExposureCap",
            DenyReason::DailyLossCap => "DailyLossCap",
            DenyReason::Cooldown => "Cooldown",
            DenyReason::ConsecutiveLossCap => "ConsecutiveLossCap",
        }
    }
}

#[derive(Debug)]
pub enum Decision {
    Allow,
    Deny {
        reason: DenyReason,
        context: ErrorContext,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Effective limits for one user: config defaults overlaid with the user's
/// settings blob.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub freshness_cap_minutes: i64,
    pub min_ev_threshold: f64,
    pub max_trade_size_cents: i64,
    pub max_daily_exposure_cents: i64,
    pub daily_loss_limit_cents: i64,
    pub cooldown_minutes: i64,
    pub consecutive_loss_limit: u32,
}

/// Per-user overrides stored in `users.settings_json`. Absent fields fall
/// back to config defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub trading_mode: Option<TradingMode>,
    #[serde(default)]
    pub max_trade_size_cents: Option<i64>,
    #[serde(default)]
    pub daily_loss_limit_cents: Option<i64>,
    #[serde(default)]
    pub max_daily_exposure_cents: Option<i64>,
    #[serde(default)]
    pub min_ev_threshold: Option<f64>,
    #[serde(default)]
    pub cooldown_minutes: Option<i64>,
    #[serde(default)]
    pub consecutive_loss_limit: Option<u32>,
    #[serde(default)]
    pub approval_window_minutes: Option<i64>,
    #[serde(default)]
    pub enabled_cities: Option<Vec<String>>,
}

impl UserSettings {
    pub fn parse(settings_json: &str) -> UserSettings {
        serde_json::from_str(settings_json).unwrap_or_else(|e| {
            tracing::warn!("Unparseable user settings ({}), using defaults", e);
            UserSettings::default()
        })
    }

    pub fn limits(&self, config: &Config) -> RiskLimits {
        RiskLimits {
            freshness_cap_minutes: config.freshness_cap_minutes,
            min_ev_threshold: self
                .min_ev_threshold
                .unwrap_or(config.default_min_ev_threshold),
            max_trade_size_cents: self
                .max_trade_size_cents
                .unwrap_or(config.default_max_trade_size_cents),
            max_daily_exposure_cents: self
                .max_daily_exposure_cents
                .unwrap_or(config.default_max_daily_exposure_cents),
            daily_loss_limit_cents: self
                .daily_loss_limit_cents
                .unwrap_or(config.default_daily_loss_limit_cents),
            cooldown_minutes: self.cooldown_minutes.unwrap_or(config.default_cooldown_minutes),
            consecutive_loss_limit: self
                .consecutive_loss_limit
                .unwrap_or(config.default_consecutive_loss_limit),
        }
    }

    pub fn trading_mode(&self, config: &Config) -> TradingMode {
        self.trading_mode.unwrap_or(config.default_trading_mode)
    }

    pub fn approval_window_minutes(&self, config: &Config) -> i64 {
        self.approval_window_minutes
            .unwrap_or(config.approval_window_minutes)
    }

    pub fn city_enabled(&self, code: &str) -> bool {
        match &self.enabled_cities {
            None => true,
            Some(cities) => cities.iter().any(|c| c == code),
        }
    }
}

/// Risk state recomputed from the trade ledger at the start of each cycle;
/// cached (and advanced) only within the cycle, so no in-memory authority
/// can drift.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub consecutive_losses: u32,
    pub last_loss_at: Option<DateTime<Utc>>,
    pub daily_realized_pnl_cents: i64,
    pub daily_exposure_cents: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl RiskState {
    pub fn load(
        db: &Database,
        user_id: &str,
        trading_day: NaiveDate,
        cooldown_minutes: i64,
    ) -> Result<RiskState> {
        let consecutive_losses = db.consecutive_losses(user_id)?;
        let last_loss_at = db.last_loss_at(user_id)?;
        let cooldown_until =
            last_loss_at.map(|at| at + ChronoDuration::minutes(cooldown_minutes));
        Ok(RiskState {
            consecutive_losses,
            last_loss_at,
            daily_realized_pnl_cents: db.daily_realized_pnl_cents(user_id, trading_day)?,
            daily_exposure_cents: db.daily_exposure_cents(user_id, trading_day)?,
            cooldown_until,
        })
    }

    /// Advance the within-cycle exposure cache after an accepted order.
    pub fn record_open(&mut self, cost_cents: i64) {
        self.daily_exposure_cents += cost_cents;
    }
}

/// The single authoritative guard. Every order placement is preceded by an
/// `allow` call; there is no out-of-band path. Pure: no I/O, no suspension.
pub struct RiskController {
    pub limits: RiskLimits,
}

impl RiskController {
    pub fn new(limits: RiskLimits) -> Self {
        RiskController { limits }
    }

    pub fn allow(
        &self,
        signal: &TradeSignal,
        freshness_age_minutes: Option<i64>,
        state: &RiskState,
        now: DateTime<Utc>,
    ) -> Decision {
        let mut ctx = ErrorContext::new();
        context_insert(&mut ctx, "city", signal.city.clone());
        context_insert(&mut ctx, "ticker", signal.bracket_ticker.clone());
        context_insert(&mut ctx, "side", signal.side.to_string());

        // 1. Freshness
        match freshness_age_minutes {
            Some(age) if age <= self.limits.freshness_cap_minutes => {}
            age => {
                context_insert(
                    &mut ctx,
                    "age_minutes",
                    age.map_or("none".to_string(), |a| a.to_string()),
                );
                context_insert(
                    &mut ctx,
                    "freshness_cap_minutes",
                    self.limits.freshness_cap_minutes.to_string(),
                );
                return Decision::Deny {
                    reason: DenyReason::StaleData,
                    context: ctx,
                };
            }
        }

        // 2. EV threshold
        if signal.ev < self.limits.min_ev_threshold {
            context_insert(&mut ctx, "ev", format!("{:.4}", signal.ev));
            context_insert(
                &mut ctx,
                "min_ev_threshold",
                format!("{:.4}", self.limits.min_ev_threshold),
            );
            return Decision::Deny {
                reason: DenyReason::MinEvNotMet,
                context: ctx,
            };
        }

        // 3. Trade-size cap
        let cost = signal.cost_cents();
        if cost > self.limits.max_trade_size_cents {
            context_insert(&mut ctx, "cost_cents", cost.to_string());
            context_insert(
                &mut ctx,
                "max_trade_size_cents",
                self.limits.max_trade_size_cents.to_string(),
            );
            return Decision::Deny {
                reason: DenyReason::SizeCap,
                context: ctx,
            };
        }

        // 4. Daily exposure
        if state.daily_exposure_cents + cost > self.limits.max_daily_exposure_cents {
            context_insert(
                &mut ctx,
                "daily_exposure_cents",
                state.daily_exposure_cents.to_string(),
            );
            context_insert(&mut ctx, "cost_cents", cost.to_string());
            context_insert(
                &mut ctx,
                "max_daily_exposure_cents",
                self.limits.max_daily_exposure_cents.to_string(),
            );
            return Decision::Deny {
                reason: DenyReason::ExposureCap,
                context: ctx,
            };
        }

        // 5. Daily loss limit (blocks until the next standard-time midnight:
        // realized P&L is keyed by settlement day)
        let realized_loss = (-state.daily_realized_pnl_cents).max(0);
        if realized_loss >= self.limits.daily_loss_limit_cents {
            context_insert(&mut ctx, "realized_loss_cents", realized_loss.to_string());
            context_insert(
                &mut ctx,
                "daily_loss_limit_cents",
                self.limits.daily_loss_limit_cents.to_string(),
            );
            return Decision::Deny {
                reason: DenyReason::DailyLossCap,
                context: ctx,
            };
        }

        // 6. Cooldown
        if let Some(until) = state.cooldown_until {
            if until > now {
                context_insert(&mut ctx, "cooldown_until", until.to_rfc3339());
                return Decision::Deny {
                    reason: DenyReason::Cooldown,
                    context: ctx,
                };
            }
        }

        // 7. Consecutive losses (until a WIN or manual reset)
        if state.consecutive_losses >= self.limits.consecutive_loss_limit {
            context_insert(
                &mut ctx,
                "consecutive_losses",
                state.consecutive_losses.to_string(),
            );
            context_insert(
                &mut ctx,
                "consecutive_loss_limit",
                self.limits.consecutive_loss_limit.to_string(),
            );
            return Decision::Deny {
                reason: DenyReason::ConsecutiveLossCap,
                context: ctx,
            };
        }

        Decision::Allow
    }
}
