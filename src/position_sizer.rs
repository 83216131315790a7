use tracing::info;

use crate::ev_scanner::TradeSignal;
use crate::kalshi::OrderSide;

/// Kelly-fraction sizer, capped to avoid ruin and to the per-trade limit.
pub struct PositionSizer {
    pub kelly_cap: f64,
    pub max_trade_size_cents: i64,
}

#[derive(Debug, Clone)]
pub struct SizingResult {
    pub raw_kelly: f64,
    pub capped_kelly: f64,
    pub quantity: i64,
    pub cost_cents: i64,
    pub reject_reason: Option<String>,
}

impl SizingResult {
    pub fn is_rejected(&self) -> bool {
        self.reject_reason.is_some()
    }

    fn rejected(reason: &str) -> Self {
        SizingResult {
            raw_kelly: 0.0,
            capped_kelly: 0.0,
            quantity: 0,
            cost_cents: 0,
            reject_reason: Some(reason.to_string()),
        }
    }
}

impl PositionSizer {
    pub fn new(kelly_cap: f64, max_trade_size_cents: i64) -> Self {
        PositionSizer {
            kelly_cap,
            max_trade_size_cents,
        }
    }

    /// Kelly fraction for a binary contract:
    ///   b  = (100 − price) / price
    ///   f* = (b·p − q) / b,  q = 1 − p
    /// clamped to [0, kelly_cap], then to the per-trade cap and balance.
    /// Quantity is the floor of sized capital over price; a result below
    /// one contract drops the signal.
    pub fn size(&self, win_prob: f64, price_cents: i64, balance_cents: i64) -> SizingResult {
        if !(1..=99).contains(&price_cents) {
            return SizingResult::rejected("price outside [1, 99]");
        }
        if balance_cents <= 0 {
            return SizingResult::rejected("no balance");
        }

        let price = price_cents as f64 / 100.0;
        let b = (1.0 - price) / price;
        let q = 1.0 - win_prob;
        let raw_kelly = (b * win_prob - q) / b;

        if raw_kelly <= 0.0 {
            return SizingResult::rejected("non-positive Kelly fraction");
        }

        let capped_kelly = raw_kelly.min(self.kelly_cap);
        let sized_cents = ((capped_kelly * balance_cents as f64) as i64)
            .min(self.max_trade_size_cents)
            .min(balance_cents);

        let quantity = sized_cents / price_cents;
        if quantity < 1 {
            return SizingResult::rejected("sized below one contract");
        }

        SizingResult {
            raw_kelly,
            capped_kelly,
            quantity,
            cost_cents: quantity * price_cents,
            reject_reason: None,
        }
    }

    /// Size a scanned signal in place. The win probability is
    /// side-relative: the bracket probability for yes, its complement for
    /// no.
    pub fn size_signal(&self, signal: &mut TradeSignal, balance_cents: i64) -> SizingResult {
        let win_prob = match signal.side {
            OrderSide::Yes => signal.model_probability,
            OrderSide::No => 1.0 - signal.model_probability,
        };
        let result = self.size(win_prob, signal.limit_price_cents, balance_cents);
        if let Some(reason) = &result.reject_reason {
            info!(
                "Dropped {} {} signal: {}",
                signal.bracket_ticker, signal.side, reason
            );
        } else {
            signal.quantity = result.quantity;
            info!(
                "Sized {} {}: kelly={:.3} capped={:.3} → {} @ {}¢ ({}¢)",
                signal.bracket_ticker,
                signal.side,
                result.raw_kelly,
                result.capped_kelly,
                result.quantity,
                signal.limit_price_cents,
                result.cost_cents,
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::Confidence;
    use chrono::NaiveDate;

    #[test]
    fn test_kelly_formula() {
        let sizer = PositionSizer::new(1.0, i64::MAX);
        // p=0.6 at 50¢: b=1, f = (0.6 - 0.4)/1 = 0.2 → 20% of $100
        let result = sizer.size(0.6, 50, 10_000);
        assert!(!result.is_rejected());
        assert!((result.raw_kelly - 0.2).abs() < 1e-12);
        // 2000¢ at 50¢ → 40 contracts
        assert_eq!(result.quantity, 40);
        assert_eq!(result.cost_cents, 2000);
    }

    #[test]
    fn test_kelly_cap_applies() {
        let sizer = PositionSizer::new(0.25, i64::MAX);
        // p=0.9 at 50¢: f = 0.8, capped to 0.25
        let result = sizer.size(0.9, 50, 10_000);
        assert!((result.raw_kelly - 0.8).abs() < 1e-12);
        assert!((result.capped_kelly - 0.25).abs() < 1e-12);
        assert_eq!(result.cost_cents, 2500);
    }

    #[test]
    fn test_trade_size_cap_applies() {
        let sizer = PositionSizer::new(1.0, 1000);
        let result = sizer.size(0.9, 50, 100_000);
        // Kelly wants 80000¢ but the per-trade cap is 1000¢
        assert_eq!(result.cost_cents, 1000);
        assert_eq!(result.quantity, 20);
    }

    #[test]
    fn test_negative_kelly_rejected() {
        let sizer = PositionSizer::new(0.25, 1000);
        // p=0.2 at 50¢ has no edge
        let result = sizer.size(0.2, 50, 10_000);
        assert!(result.is_rejected());
        assert!(result.reject_reason.unwrap().contains("Kelly"));
    }

    #[test]
    fn test_minimum_one_contract() {
        let sizer = PositionSizer::new(0.25, 1000);
        // Small balance: kelly sizes below one 80¢ contract
        let result = sizer.size(0.85, 80, 100);
        assert!(result.is_rejected());
        assert!(result.reject_reason.unwrap().contains("one contract"));

        // Seed-scenario sizing: p≈0.246 at 22¢ with a $10 balance → 1 contract
        let sizer = PositionSizer::new(0.25, 1000);
        let result = sizer.size(0.246, 22, 1000);
        assert!(!result.is_rejected());
        assert_eq!(result.quantity, 1);
        assert_eq!(result.cost_cents, 22);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let sizer = PositionSizer::new(0.25, 1000);
        assert!(sizer.size(0.5, 0, 1000).is_rejected());
        assert!(sizer.size(0.5, 100, 1000).is_rejected());
        assert!(sizer.size(0.5, 50, 0).is_rejected());
    }

    #[test]
    fn test_never_exceeds_balance() {
        let sizer = PositionSizer::new(1.0, i64::MAX);
        let result = sizer.size(0.99, 10, 55);
        assert!(!result.is_rejected());
        assert!(result.cost_cents <= 55);
    }

    #[test]
    fn test_size_signal_no_side_uses_complement() {
        let sizer = PositionSizer::new(1.0, i64::MAX);
        let mut signal = TradeSignal {
            city: "NYC".into(),
            target_date: NaiveDate::from_ymd_opt(2026, 2, 18).unwrap(),
            bracket_ticker: "B54".into(),
            bracket_label: "52-54°".into(),
            side: crate::kalshi::OrderSide::No,
            model_probability: 0.10,
            market_probability: 0.18,
            ev: 0.08,
            confidence: Confidence::Medium,
            reasoning: String::new(),
            quantity: 0,
            limit_price_cents: 82,
        };
        let result = sizer.size_signal(&mut signal, 10_000);
        assert!(!result.is_rejected());
        // win prob 0.90 at 82¢: b=18/82, f = 0.9 − 0.1/b ≈ 0.4444
        assert!((result.raw_kelly - 0.4444).abs() < 0.001);
        assert_eq!(signal.quantity, result.quantity);
    }
}
