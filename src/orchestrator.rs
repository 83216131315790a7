use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::approval::{ApprovalQueue, PendingPayload};
use crate::cities::{city_by_code, CITIES};
use crate::config::{Config, TradingMode};
use crate::db::{Database, TradeStatus};
use crate::errors::AgentError;
use crate::ev_scanner::{rank_signals, settle_pnl_cents, EvScanner, FeeSchedule, TradeSignal};
use crate::executor::{Executor, TradeContext};
use crate::forecast::forecast_age_minutes;
use crate::kalshi::client::KalshiClient;
use crate::kalshi::contains_bounds;
use crate::position_sizer::PositionSizer;
use crate::prediction::{BracketPrediction, PredictionEngine, SnapshotForecast};
use crate::risk::{Decision, RiskController, RiskState, UserSettings};
use crate::settlement::SettlementObserved;

/// The risk day (exposure and realized-loss buckets) runs on Eastern
/// standard time, the earliest market close of the four cities.
pub fn trading_day(now: DateTime<Utc>) -> NaiveDate {
    let eastern_standard = FixedOffset::east_opt(-5 * 3600).expect("static offset");
    now.with_timezone(&eastern_standard).date_naive()
}

#[derive(Debug, Default, Clone)]
pub struct CycleSummary {
    pub cities_scanned: usize,
    pub signals: usize,
    pub placed: usize,
    pub enqueued: usize,
    pub denied: usize,
}

struct CityWork {
    age_minutes: Option<i64>,
    context: TradeContext,
    weather_snapshot: Vec<SnapshotForecast>,
    prediction: BracketPrediction,
}

/// Drives one user's trade cycle: predictions + order books in, guarded
/// orders (or queued approvals) out. Cycles for a user are serialized by
/// the caller; this type holds no cross-cycle mutable state.
pub struct Orchestrator {
    db: Arc<Database>,
    exchange: Arc<KalshiClient>,
    executor: Executor,
    queue: ApprovalQueue,
    engine: PredictionEngine,
    config: Config,
    user_id: String,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        exchange: Arc<KalshiClient>,
        engine: PredictionEngine,
        config: Config,
        user_id: String,
    ) -> Self {
        let executor = Executor::new(db.clone(), exchange.clone(), config.is_paper());
        let queue = ApprovalQueue::new(db.clone());
        Orchestrator {
            db,
            exchange,
            executor,
            queue,
            engine,
            config,
            user_id,
        }
    }

    pub fn approval_queue(&self) -> &ApprovalQueue {
        &self.queue
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    fn fees(&self) -> FeeSchedule {
        FeeSchedule {
            trade_fee_rate: self.config.trade_fee_rate,
            settlement_fee_rate: self.config.settlement_fee_rate,
        }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleSummary, AgentError> {
        // Partial state from an ambiguous placement must be resolved before
        // any new order; an unreconcilable ledger fails the cycle closed.
        self.executor.reconcile_uncertain(&self.user_id).await?;

        let user = self
            .db
            .get_user(&self.user_id)
            .map_err(|e| AgentError::Invariant(format!("user read failed: {}", e)))?
            .ok_or_else(|| AgentError::Invariant(format!("unknown user {}", self.user_id)))?;
        let settings = UserSettings::parse(&user.settings_json);
        let limits = settings.limits(&self.config);
        let mode = settings.trading_mode(&self.config);
        let approval_window = settings.approval_window_minutes(&self.config);
        let day = trading_day(now);

        let controller = RiskController::new(limits);
        let mut state = RiskState::load(
            &self.db,
            &self.user_id,
            day,
            controller.limits.cooldown_minutes,
        )
        .map_err(|e| AgentError::Invariant(format!("risk state load failed: {}", e)))?;

        let balance_cents = self.exchange.get_balance().await?;
        let scanner = EvScanner::new(controller.limits.min_ev_threshold, self.fees());
        let sizer = PositionSizer::new(self.config.kelly_cap, controller.limits.max_trade_size_cents);

        let mut summary = CycleSummary::default();
        let mut work: HashMap<String, CityWork> = HashMap::new();
        let mut signals: Vec<TradeSignal> = Vec::new();

        for city in CITIES {
            if !settings.city_enabled(city.code) {
                continue;
            }
            let target_date = city.local_date(now);

            let forecasts = match self.db.newest_forecasts(city.code, target_date) {
                Ok(rows) if !rows.is_empty() => rows,
                Ok(_) => {
                    info!("No forecasts for {} {}, skipping", city.code, target_date);
                    continue;
                }
                Err(e) => {
                    warn!("Forecast read failed for {}: {}", city.code, e);
                    continue;
                }
            };
            let age_minutes = forecast_age_minutes(&self.db, city.code, target_date, now)
                .unwrap_or(None);

            let event = match self.exchange.list_events_for(city, target_date).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!("No event listed for {} {}, skipping", city.code, target_date);
                    continue;
                }
                Err(e) => {
                    warn!("Event fetch failed for {}: {}", city.code, e);
                    continue;
                }
            };

            let prediction = match self.engine.predict(
                &self.db,
                city.code,
                target_date,
                &forecasts,
                &event.brackets,
                now,
            ) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Prediction failed for {}: {}", city.code, e);
                    continue;
                }
            };
            self.persist_prediction(&prediction);
            summary.cities_scanned += 1;

            let mut city_signals = scanner.scan(&prediction, &event.brackets);
            city_signals.retain_mut(|signal| !sizer.size_signal(signal, balance_cents).is_rejected());

            let weather_snapshot = SnapshotForecast::from_rows(&forecasts);
            work.insert(
                city.code.to_string(),
                CityWork {
                    age_minutes,
                    context: TradeContext {
                        trade_day: day,
                        weather_snapshot_json: serde_json::to_string(&weather_snapshot)
                            .unwrap_or_else(|_| "[]".into()),
                        prediction_snapshot_json: serde_json::to_string(&prediction)
                            .unwrap_or_else(|_| "{}".into()),
                    },
                    weather_snapshot,
                    prediction,
                },
            );
            signals.extend(city_signals);
        }

        rank_signals(&mut signals);
        summary.signals = signals.len();

        for signal in signals {
            let Some(city_work) = work.get(&signal.city) else {
                continue;
            };
            match controller.allow(&signal, city_work.age_minutes, &state, now) {
                Decision::Deny { reason, context } => {
                    warn!(
                        "Risk deny {} on {} {}: {:?}",
                        reason.as_str(),
                        signal.bracket_ticker,
                        signal.side,
                        context
                    );
                    let _ = self.db.log_event(
                        "WARN",
                        "risk",
                        &format!("deny: {}", reason.as_str()),
                        serde_json::to_string(&context).ok().as_deref(),
                    );
                    summary.denied += 1;
                }
                Decision::Allow => {
                    if mode == TradingMode::Auto {
                        match self
                            .executor
                            .execute(&self.user_id, &signal, &city_work.context)
                            .await
                        {
                            Ok(outcome) => {
                                state.record_open(signal.cost_cents());
                                summary.placed += 1;
                                info!(
                                    "Cycle placed {} ({} {})",
                                    outcome.trade_id, signal.bracket_ticker, signal.side
                                );
                            }
                            Err(e) => {
                                warn!("Order placement failed for {}: {}", signal.bracket_ticker, e);
                                let _ = self.db.log_event(
                                    "WARN",
                                    "orchestrator",
                                    "placement-failed",
                                    Some(
                                        &serde_json::json!({
                                            "ticker": signal.bracket_ticker,
                                            "error_kind": e.kind(),
                                        })
                                        .to_string(),
                                    ),
                                );
                            }
                        }
                    } else {
                        let payload = PendingPayload {
                            trade_day: day,
                            weather_snapshot: city_work.weather_snapshot.clone(),
                            prediction_snapshot: city_work.prediction.clone(),
                            signal: signal.clone(),
                        };
                        match self.queue.enqueue(&self.user_id, &payload, approval_window, now) {
                            Ok(_) => {
                                // Reserve budget within this cycle so a burst of
                                // approvals cannot overshoot the exposure cap
                                state.record_open(signal.cost_cents());
                                summary.enqueued += 1;
                            }
                            Err(e) => warn!("Enqueue failed for {}: {}", signal.bracket_ticker, e),
                        }
                    }
                }
            }
        }

        info!(
            "Cycle complete for {}: {} cities, {} signals, {} placed, {} enqueued, {} denied",
            self.user_id,
            summary.cities_scanned,
            summary.signals,
            summary.placed,
            summary.enqueued,
            summary.denied,
        );
        Ok(summary)
    }

    fn persist_prediction(&self, prediction: &BracketPrediction) {
        let probs_json = serde_json::to_string(&prediction.brackets).unwrap_or_else(|_| "[]".into());
        let sources_json =
            serde_json::to_string(&prediction.source_names).unwrap_or_else(|_| "[]".into());
        if let Err(e) = self.db.insert_prediction(
            &prediction.city,
            prediction.target_date,
            prediction.ensemble_high_f,
            &probs_json,
            prediction.confidence.as_str(),
            &sources_json,
            prediction.forecast_spread_f,
            prediction.error_std_f,
            prediction.generated_at,
        ) {
            warn!("Failed to persist prediction for {}: {}", prediction.city, e);
        }
    }

    /// Closeout loop: settle every OPEN trade on the observed (city, date).
    /// Duplicate observations are no-ops via the ledger's status guard.
    pub async fn on_settlement(
        &self,
        observed: &SettlementObserved,
        now: DateTime<Utc>,
    ) -> Result<usize, AgentError> {
        let Some(city) = city_by_code(&observed.city) else {
            return Err(AgentError::Invariant(format!(
                "settlement for unknown city {}",
                observed.city
            )));
        };
        let trades = self
            .db
            .trades_with_status(&observed.city, observed.target_date, TradeStatus::Open)
            .map_err(|e| AgentError::Invariant(format!("ledger read failed: {}", e)))?;

        let fees = self.fees();
        let settled_day = city.local_date(now);
        let mut closed = 0;

        for trade in trades {
            let bounds = serde_json::from_str::<BracketPrediction>(&trade.prediction_snapshot_json)
                .ok()
                .and_then(|p| {
                    p.brackets
                        .iter()
                        .find(|b| b.ticker == trade.bracket_ticker)
                        .map(|b| (b.lower_bound_f, b.upper_bound_f))
                });
            let Some((lower, upper)) = bounds else {
                warn!(
                    "Trade {} snapshot lacks bracket bounds; leaving OPEN",
                    trade.id
                );
                continue;
            };

            let hit = contains_bounds(lower, upper, observed.actual_high_f);
            let won = match trade.side.as_str() {
                "yes" => hit,
                _ => !hit,
            };
            let pnl_cents = settle_pnl_cents(won, trade.entry_price_cents, trade.quantity, &fees);
            let narrative =
                crate::prediction::postmortem_narrative(&trade, observed.actual_high_f, won, pnl_cents);

            let status = if won { TradeStatus::Won } else { TradeStatus::Lost };
            let changed = self
                .db
                .settle_trade(
                    &trade.id,
                    status,
                    observed.actual_high_f,
                    pnl_cents,
                    &narrative,
                    now,
                    settled_day,
                )
                .map_err(|e| AgentError::Invariant(format!("settle write failed: {}", e)))?;
            if changed {
                closed += 1;
                info!(
                    "Settled trade {} {} ({:+}¢): {}",
                    trade.id,
                    status.as_str(),
                    pnl_cents,
                    narrative
                );
                let _ = self.db.log_event(
                    "INFO",
                    "settlement",
                    &format!("trade {} {}", trade.id, status.as_str()),
                    Some(&serde_json::json!({"pnl_cents": pnl_cents}).to_string()),
                );
            }
        }
        Ok(closed)
    }
}
