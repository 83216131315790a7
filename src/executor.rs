use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{Database, NewTrade, TradeStatus};
use crate::errors::AgentError;
use crate::ev_scanner::TradeSignal;
use crate::kalshi::client::KalshiClient;
use crate::kalshi::OrderRequest;

/// Frozen context persisted with the trade for audit: the forecasts and
/// prediction that justified it, plus the exposure day.
#[derive(Debug, Clone)]
pub struct TradeContext {
    pub trade_day: NaiveDate,
    pub weather_snapshot_json: String,
    pub prediction_snapshot_json: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub trade_id: String,
    pub exchange_order_id: Option<String>,
    pub status: TradeStatus,
}

/// Places sized orders and records the trade. Development routes to paper
/// fills; production sends signed orders through the exchange client.
pub struct Executor {
    db: Arc<Database>,
    client: Arc<KalshiClient>,
    paper: bool,
}

impl Executor {
    pub fn new(db: Arc<Database>, client: Arc<KalshiClient>, paper: bool) -> Self {
        Executor { db, client, paper }
    }

    /// Place the order and persist the TradeRecord.
    ///
    /// An ambiguous placement failure (transport error after send) is NOT
    /// retried: the trade is recorded UNCERTAIN and reconciled from
    /// positions before the next cycle trades. Clean rejections surface as
    /// errors and record nothing.
    pub async fn execute(
        &self,
        user_id: &str,
        signal: &TradeSignal,
        context: &TradeContext,
    ) -> Result<ExecutionOutcome, AgentError> {
        let trade_id = uuid::Uuid::new_v4().to_string();

        if self.paper {
            let order_id = format!("paper-{}", trade_id);
            self.record_trade(&trade_id, user_id, signal, context, Some(&order_id), TradeStatus::Open)?;
            info!(
                "PAPER TRADE: {} {} x{} @ {}¢ ({})",
                signal.side, signal.bracket_ticker, signal.quantity, signal.limit_price_cents, trade_id,
            );
            return Ok(ExecutionOutcome {
                trade_id,
                exchange_order_id: Some(order_id),
                status: TradeStatus::Open,
            });
        }

        let order = OrderRequest {
            ticker: signal.bracket_ticker.clone(),
            side: signal.side,
            price_cents: signal.limit_price_cents,
            quantity: signal.quantity,
            client_order_id: trade_id.clone(),
        };

        match self.client.place_order(&order).await {
            Ok(resp) => {
                self.record_trade(
                    &trade_id,
                    user_id,
                    signal,
                    context,
                    Some(&resp.order_id),
                    TradeStatus::Open,
                )?;
                info!(
                    "LIVE TRADE: {} {} x{} @ {}¢ order_id={}",
                    signal.side,
                    signal.bracket_ticker,
                    signal.quantity,
                    signal.limit_price_cents,
                    resp.order_id,
                );
                Ok(ExecutionOutcome {
                    trade_id,
                    exchange_order_id: Some(resp.order_id),
                    status: TradeStatus::Open,
                })
            }
            Err(AgentError::Connection(msg)) => {
                // Timeout after send: the order may or may not exist
                warn!(
                    "Ambiguous placement for {} ({}); recording UNCERTAIN",
                    signal.bracket_ticker, msg
                );
                self.record_trade(&trade_id, user_id, signal, context, None, TradeStatus::Uncertain)?;
                Ok(ExecutionOutcome {
                    trade_id,
                    exchange_order_id: None,
                    status: TradeStatus::Uncertain,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn record_trade(
        &self,
        trade_id: &str,
        user_id: &str,
        signal: &TradeSignal,
        context: &TradeContext,
        exchange_order_id: Option<&str>,
        status: TradeStatus,
    ) -> Result<(), AgentError> {
        self.db
            .insert_trade(&NewTrade {
                id: trade_id,
                user_id,
                city: &signal.city,
                target_date: signal.target_date,
                trade_day: context.trade_day,
                bracket_ticker: &signal.bracket_ticker,
                bracket_label: &signal.bracket_label,
                side: &signal.side.to_string(),
                entry_price_cents: signal.limit_price_cents,
                quantity: signal.quantity,
                model_prob: signal.model_probability,
                market_prob: signal.market_probability,
                ev_at_entry: signal.ev,
                confidence: signal.confidence.as_str(),
                exchange_order_id,
                status,
                weather_snapshot_json: &context.weather_snapshot_json,
                prediction_snapshot_json: &context.prediction_snapshot_json,
            })
            .map_err(|e| AgentError::Invariant(format!("failed to persist trade: {}", e)))
    }

    /// Resolve UNCERTAIN trades against live positions: a resting position
    /// on the ticker means the order went through.
    pub async fn reconcile_uncertain(&self, user_id: &str) -> Result<usize, AgentError> {
        let uncertain = self
            .db
            .trades_for_user_with_status(user_id, TradeStatus::Uncertain)
            .map_err(|e| AgentError::Invariant(format!("ledger read failed: {}", e)))?;
        if uncertain.is_empty() {
            return Ok(0);
        }

        let positions = self.client.get_positions().await?;
        let mut resolved = 0;
        for trade in uncertain {
            let held = positions
                .iter()
                .any(|p| p.ticker == trade.bracket_ticker && p.position != 0);
            let status = if held { TradeStatus::Open } else { TradeStatus::Cancelled };
            let changed = self
                .db
                .resolve_uncertain_trade(&trade.id, status, None)
                .map_err(|e| AgentError::Invariant(format!("reconcile write failed: {}", e)))?;
            if changed {
                info!(
                    "Reconciled uncertain trade {} → {}",
                    trade.id,
                    status.as_str()
                );
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}
