pub mod auth;
pub mod client;
pub mod ws;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// Contract side. Wire format is lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Yes,
    No,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Yes => write!(f, "yes"),
            OrderSide::No => write!(f, "no"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Closed,
    Settled,
    #[serde(other)]
    Other,
}

/// One temperature bracket market. Exactly one of the event's brackets has
/// `lower_bound_f = None` (bottom edge) and one has `upper_bound_f = None`
/// (top edge); published bounds are kept exactly as returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bracket {
    pub ticker: String,
    pub lower_bound_f: Option<f64>,
    pub upper_bound_f: Option<f64>,
    pub label: String,
    pub status: MarketStatus,
    pub yes_bid_cents: Option<i64>,
    pub yes_ask_cents: Option<i64>,
    pub no_bid_cents: Option<i64>,
    pub no_ask_cents: Option<i64>,
    pub last_price_cents: Option<i64>,
    pub close_time_utc: Option<DateTime<Utc>>,
}

impl Bracket {
    /// Whether the settlement temperature lands in this bracket.
    pub fn contains(&self, temp_f: f64) -> bool {
        contains_bounds(self.lower_bound_f, self.upper_bound_f, temp_f)
    }
}

/// Containment against raw strike bounds (edge brackets are half-open).
pub fn contains_bounds(lower: Option<f64>, upper: Option<f64>, temp_f: f64) -> bool {
    match (lower, upper) {
        (None, Some(u)) => temp_f <= u,
        (Some(l), None) => temp_f >= l,
        (Some(l), Some(u)) => temp_f >= l && temp_f <= u,
        (None, None) => false,
    }
}

/// A daily-high event with its bracket markets, sorted bottom edge first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub event_ticker: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub brackets: Vec<Bracket>,
}

/// Order-book levels as (price_cents, quantity).
#[derive(Debug, Clone, Default)]
pub struct Orderbook {
    pub yes_levels: Vec<(i64, i64)>,
    pub no_levels: Vec<(i64, i64)>,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub ticker: String,
    pub side: OrderSide,
    pub price_cents: i64,
    pub quantity: i64,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    pub ticker: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub market_exposure: i64,
}

/// Validate a wire price: integer cents in [1, 99]. Everything the adapter
/// sends or accepts passes through here; dollar conversion happens only at
/// display/persistence points as a divide by 100.
pub fn validate_price_cents(price_cents: i64) -> Result<i64, AgentError> {
    if !(1..=99).contains(&price_cents) {
        return Err(AgentError::Invariant(format!(
            "price {} cents outside [1, 99]",
            price_cents
        )));
    }
    Ok(price_cents)
}

fn format_temp(v: f64) -> String {
    if (v - v.round()).abs() < 1e-9 {
        format!("{}", v.round() as i64)
    } else {
        format!("{}", v)
    }
}

/// Deterministic label from strike bounds: `(floor, cap)` → middle,
/// `(none, cap)` → bottom edge, `(floor, none)` → top edge.
pub fn bracket_label(lower: Option<f64>, upper: Option<f64>) -> String {
    match (lower, upper) {
        (None, Some(cap)) => format!("Below {}°", format_temp(cap + 1.0)),
        (Some(floor), None) => format!("{}° or above", format_temp(floor)),
        (Some(floor), Some(cap)) => format!("{}-{}°", format_temp(floor), format_temp(cap)),
        (None, None) => "unbounded".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bracket(lower: Option<f64>, upper: Option<f64>) -> Bracket {
        Bracket {
            ticker: "T".into(),
            lower_bound_f: lower,
            upper_bound_f: upper,
            label: bracket_label(lower, upper),
            status: MarketStatus::Active,
            yes_bid_cents: None,
            yes_ask_cents: None,
            no_bid_cents: None,
            no_ask_cents: None,
            last_price_cents: None,
            close_time_utc: None,
        }
    }

    #[test]
    fn test_bracket_labels() {
        assert_eq!(bracket_label(None, Some(47.0)), "Below 48°");
        assert_eq!(bracket_label(Some(58.0), None), "58° or above");
        assert_eq!(bracket_label(Some(52.0), Some(54.0)), "52-54°");
        // Fractional bounds print as published
        assert_eq!(bracket_label(Some(52.5), Some(53.5)), "52.5-53.5°");
    }

    #[test]
    fn test_bracket_containment() {
        let bottom = bracket(None, Some(47.0));
        assert!(bottom.contains(40.0));
        assert!(bottom.contains(47.0));
        assert!(!bottom.contains(47.5));

        let middle = bracket(Some(52.0), Some(54.0));
        assert!(middle.contains(52.0));
        assert!(middle.contains(53.4));
        assert!(middle.contains(54.0));
        assert!(!middle.contains(54.5));
        assert!(!middle.contains(51.9));

        let top = bracket(Some(58.0), None);
        assert!(top.contains(58.0));
        assert!(top.contains(90.0));
        assert!(!top.contains(57.9));
    }

    #[test]
    fn test_price_validation_bounds() {
        assert!(validate_price_cents(1).is_ok());
        assert!(validate_price_cents(99).is_ok());
        assert!(validate_price_cents(0).is_err());
        assert!(validate_price_cents(100).is_err());
        assert!(validate_price_cents(-5).is_err());
    }

    #[test]
    fn test_order_side_wire_format() {
        assert_eq!(serde_json::to_string(&OrderSide::Yes).unwrap(), "\"yes\"");
        assert_eq!(OrderSide::No.to_string(), "no");
    }
}
