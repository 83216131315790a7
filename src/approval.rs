use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{Database, PendingStatus, PendingTradeRow};
use crate::errors::AgentError;
use crate::ev_scanner::TradeSignal;
use crate::executor::{ExecutionOutcome, Executor, TradeContext};
use crate::prediction::{BracketPrediction, SnapshotForecast};

/// What a pending trade carries: the signal plus the frozen snapshots that
/// justified it, so an approval minutes later records the same audit trail
/// an auto-executed trade would.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPayload {
    pub signal: TradeSignal,
    pub trade_day: NaiveDate,
    pub weather_snapshot: Vec<SnapshotForecast>,
    pub prediction_snapshot: BracketPrediction,
}

/// Durable manual-approval queue. Transitions are CAS-guarded in the
/// database: exactly one terminal transition per id, and never two order
/// placements for the same pending trade.
pub struct ApprovalQueue {
    db: Arc<Database>,
}

impl ApprovalQueue {
    pub fn new(db: Arc<Database>) -> Self {
        ApprovalQueue { db }
    }

    /// Queue a signal for manual approval. TTL starts now.
    pub fn enqueue(
        &self,
        user_id: &str,
        payload: &PendingPayload,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let signal_json = serde_json::to_string(payload)
            .map_err(|e| AgentError::Invariant(format!("unserializable payload: {}", e)))?;
        self.db
            .insert_pending_trade(
                &id,
                user_id,
                &signal_json,
                now,
                now + ChronoDuration::minutes(window_minutes),
            )
            .map_err(|e| AgentError::Invariant(format!("enqueue failed: {}", e)))?;
        info!(
            "Enqueued pending trade {} ({} {} x{} @ {}¢, expires in {}m)",
            id,
            payload.signal.side,
            payload.signal.bracket_ticker,
            payload.signal.quantity,
            payload.signal.limit_price_cents,
            window_minutes,
        );
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingTradeRow>, AgentError> {
        self.db
            .get_pending_trade(id)
            .map_err(|e| AgentError::Invariant(format!("queue read failed: {}", e)))
    }

    pub fn list_pending(&self, user_id: &str) -> Result<Vec<PendingTradeRow>, AgentError> {
        self.db
            .pending_trades_for_user(user_id)
            .map_err(|e| AgentError::Invariant(format!("queue read failed: {}", e)))
    }

    /// Approve and execute. A second approve (or an approve after expiry)
    /// returns a conflict, never a second order.
    pub async fn approve(
        &self,
        id: &str,
        executor: &Executor,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, AgentError> {
        let row = self
            .get(id)?
            .ok_or_else(|| AgentError::Conflict(format!("no pending trade {}", id)))?;

        // Lapsed TTL beats a racing approve even before the sweeper runs
        if row.status == PendingStatus::Pending.as_str() && row.expires_at <= now {
            let _ = self.cas(id, PendingStatus::Pending, PendingStatus::Expired, now)?;
            return Err(AgentError::Conflict(format!("pending trade {} expired", id)));
        }

        if !self.cas(id, PendingStatus::Pending, PendingStatus::Approved, now)? {
            return Err(AgentError::Conflict(format!(
                "pending trade {} is {} (not PENDING)",
                id, row.status
            )));
        }

        let payload: PendingPayload = serde_json::from_str(&row.signal_json)
            .map_err(|e| AgentError::Invariant(format!("corrupt pending payload: {}", e)))?;
        let context = TradeContext {
            trade_day: payload.trade_day,
            weather_snapshot_json: serde_json::to_string(&payload.weather_snapshot)
                .unwrap_or_else(|_| "[]".into()),
            prediction_snapshot_json: serde_json::to_string(&payload.prediction_snapshot)
                .unwrap_or_else(|_| "{}".into()),
        };

        match executor.execute(&row.user_id, &payload.signal, &context).await {
            Ok(outcome) => {
                self.cas(id, PendingStatus::Approved, PendingStatus::Executed, now)?;
                info!("Pending trade {} executed as {}", id, outcome.trade_id);
                Ok(outcome)
            }
            Err(e) => {
                // Clean failure: no order exists. One terminal transition.
                warn!("Pending trade {} rejected by exchange: {}", id, e);
                self.cas(id, PendingStatus::Approved, PendingStatus::Rejected, now)?;
                let _ = self.db.log_event(
                    "WARN",
                    "approval",
                    "rejected-by-exchange",
                    Some(&serde_json::json!({"id": id, "error": e.to_string()}).to_string()),
                );
                Err(e)
            }
        }
    }

    /// CAS PENDING → REJECTED. Conflict if the trade already left PENDING.
    pub fn reject(&self, id: &str, now: DateTime<Utc>) -> Result<(), AgentError> {
        let row = self
            .get(id)?
            .ok_or_else(|| AgentError::Conflict(format!("no pending trade {}", id)))?;
        if !self.cas(id, PendingStatus::Pending, PendingStatus::Rejected, now)? {
            return Err(AgentError::Conflict(format!(
                "pending trade {} is {} (not PENDING)",
                id, row.status
            )));
        }
        info!("Pending trade {} rejected", id);
        Ok(())
    }

    /// Periodic sweep: PENDING past its TTL becomes EXPIRED.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, AgentError> {
        let expired = self
            .db
            .expire_pending_trades(now)
            .map_err(|e| AgentError::Invariant(format!("sweep failed: {}", e)))?;
        if expired > 0 {
            info!("Expired {} pending trade(s)", expired);
        }
        Ok(expired)
    }

    fn cas(
        &self,
        id: &str,
        from: PendingStatus,
        to: PendingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, AgentError> {
        self.db
            .cas_pending_status(id, from, to, now)
            .map_err(|e| AgentError::Invariant(format!("status CAS failed: {}", e)))
    }
}
