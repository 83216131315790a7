use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::kalshi::{Bracket, MarketStatus, OrderSide};
use crate::prediction::{BracketPrediction, Confidence};

/// Ephemeral trade signal; lives at most one cycle. Quantity and cost are
/// filled in by the sizer before the risk guard sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub city: String,
    pub target_date: NaiveDate,
    pub bracket_ticker: String,
    pub bracket_label: String,
    pub side: OrderSide,
    pub model_probability: f64,
    pub market_probability: f64,
    pub ev: f64,
    pub confidence: Confidence,
    pub reasoning: String,
    pub quantity: i64,
    pub limit_price_cents: i64,
}

impl TradeSignal {
    pub fn cost_cents(&self) -> i64 {
        self.quantity * self.limit_price_cents
    }
}

/// Fee schedule, parameterized pending the exchange's published formula.
/// `side` is part of the contract even though the current schedule is
/// side-symmetric (the price is already side-relative).
#[derive(Debug, Clone, Copy)]
pub struct FeeSchedule {
    pub trade_fee_rate: f64,
    pub settlement_fee_rate: f64,
}

impl FeeSchedule {
    /// Trade-time fee in cents: ceil(rate × quantity × 100).
    pub fn trade_fee_cents(&self, quantity: i64) -> i64 {
        (self.trade_fee_rate * quantity as f64 * 100.0).ceil() as i64
    }

    /// Settlement fee on a winning position's profit.
    pub fn settlement_fee_cents(&self, profit_cents: i64) -> i64 {
        (self.settlement_fee_rate * profit_cents as f64).ceil() as i64
    }

    /// Total fees for a position entered at `price_cents`, assuming a win.
    pub fn fees(&self, price_cents: i64, quantity: i64, _side: OrderSide) -> i64 {
        let profit_if_win = (100 - price_cents) * quantity;
        self.trade_fee_cents(quantity) + self.settlement_fee_cents(profit_if_win)
    }

    /// Expected fee drag per $1 notional for one contract: the trade fee
    /// plus the settlement fee weighted by the win probability.
    pub fn ev_drag(&self, price_cents: i64, win_prob: f64) -> f64 {
        let trade_fee = self.trade_fee_rate * 100.0;
        let settlement = self.settlement_fee_rate * (100 - price_cents) as f64 * win_prob;
        (trade_fee + settlement) / 100.0
    }
}

/// Realized P&L at settlement, recomputable from the snapshot: side
/// outcome, entry price, quantity, and the fee schedule determine it.
pub fn settle_pnl_cents(
    won: bool,
    entry_price_cents: i64,
    quantity: i64,
    fees: &FeeSchedule,
) -> i64 {
    if won {
        let profit = (100 - entry_price_cents) * quantity;
        profit - fees.trade_fee_cents(quantity) - fees.settlement_fee_cents(profit)
    } else {
        -entry_price_cents * quantity - fees.trade_fee_cents(quantity)
    }
}

/// Scans every active (bracket, side) offer against the model's bracket
/// probabilities and emits signals whose EV net of fees clears the
/// threshold.
pub struct EvScanner {
    pub min_ev_threshold: f64,
    pub fees: FeeSchedule,
}

impl EvScanner {
    pub fn new(min_ev_threshold: f64, fees: FeeSchedule) -> Self {
        EvScanner {
            min_ev_threshold,
            fees,
        }
    }

    /// All signals for one city's event. Sides with no resting ask are
    /// rejected; closed and settled brackets are skipped.
    pub fn scan(&self, prediction: &BracketPrediction, brackets: &[Bracket]) -> Vec<TradeSignal> {
        let mut signals = Vec::new();

        for bracket in brackets {
            if bracket.status != MarketStatus::Active {
                continue;
            }
            let Some(prob) = prediction
                .brackets
                .iter()
                .find(|p| p.ticker == bracket.ticker)
                .map(|p| p.probability)
            else {
                continue;
            };

            if let Some(yes_ask) = bracket.yes_ask_cents {
                self.evaluate_side(
                    prediction,
                    bracket,
                    OrderSide::Yes,
                    prob,
                    prob,
                    yes_ask,
                    yes_ask as f64 / 100.0,
                    &mut signals,
                );
            }
            if let Some(no_ask) = bracket.no_ask_cents {
                // Symmetric: the no quote implies a bracket probability of
                // (100 − no_ask)/100
                self.evaluate_side(
                    prediction,
                    bracket,
                    OrderSide::No,
                    prob,
                    1.0 - prob,
                    no_ask,
                    (100 - no_ask) as f64 / 100.0,
                    &mut signals,
                );
            }
        }

        info!(
            "EV scan {} {}: {} signal(s) above {:.0}% threshold",
            prediction.city,
            prediction.target_date,
            signals.len(),
            self.min_ev_threshold * 100.0,
        );
        signals
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_side(
        &self,
        prediction: &BracketPrediction,
        bracket: &Bracket,
        side: OrderSide,
        model_prob: f64,
        win_prob: f64,
        ask_cents: i64,
        market_prob: f64,
        signals: &mut Vec<TradeSignal>,
    ) {
        let gross_ev = win_prob - ask_cents as f64 / 100.0;
        let ev_net = gross_ev - self.fees.ev_drag(ask_cents, win_prob);

        if ev_net < self.min_ev_threshold {
            debug!(
                "No edge on {} {}: ev_net={:.3} < {:.3}",
                bracket.ticker, side, ev_net, self.min_ev_threshold
            );
            return;
        }

        signals.push(TradeSignal {
            city: prediction.city.clone(),
            target_date: prediction.target_date,
            bracket_ticker: bracket.ticker.clone(),
            bracket_label: bracket.label.clone(),
            side,
            model_probability: model_prob,
            market_probability: market_prob,
            ev: ev_net,
            confidence: prediction.confidence,
            reasoning: format!(
                "model {:.1}% vs market {:.1}% on {} {} (ensemble {:.1}°F, σ {:.1}°F)",
                model_prob * 100.0,
                market_prob * 100.0,
                side,
                bracket.label,
                prediction.ensemble_high_f,
                prediction.error_std_f,
            ),
            quantity: 0,
            limit_price_cents: ask_cents,
        });
    }
}

/// Competition order for a shared budget: EV descending, confidence
/// breaking ties, city alphabetically breaking those.
pub fn rank_signals(signals: &mut [TradeSignal]) {
    signals.sort_by(|a, b| {
        b.ev
            .partial_cmp(&a.ev)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.confidence.rank().cmp(&a.confidence.rank()))
            .then_with(|| a.city.cmp(&b.city))
    });
}
