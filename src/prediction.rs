use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;

use crate::cities::Season;
use crate::db::{Database, ForecastRow, TradeRow};
use crate::errors::AgentError;
use crate::kalshi::Bracket;

/// Static ensemble weights by source; unknown sources get the default.
const SOURCE_WEIGHTS: &[(&str, f64)] = &[
    ("NWS", 0.35),
    ("ECMWF", 0.30),
    ("GFS", 0.20),
    ("ICON", 0.10),
    ("GEM", 0.05),
];
const DEFAULT_SOURCE_WEIGHT: f64 = 0.05;

/// Sample count below which the hard-coded (city, season) table is used.
const MIN_CALIBRATION_SAMPLES: usize = 30;

/// Conservative fallback error std devs by (city, season): wider
/// distributions yield fewer trades when calibration data is missing.
const FALLBACK_ERROR_STD: &[(&str, [f64; 4])] = &[
    // [winter, spring, summer, fall]
    ("NYC", [3.0, 3.2, 2.8, 3.0]),
    ("CHI", [3.8, 3.6, 3.0, 3.4]),
    ("MIA", [2.2, 2.0, 1.8, 2.0]),
    ("AUS", [3.4, 3.2, 2.4, 3.0]),
];
const DEFAULT_FALLBACK_STD: f64 = 3.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LOW")]
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Confidence::High => 2,
            Confidence::Medium => 1,
            Confidence::Low => 0,
        }
    }

    pub fn parse(s: &str) -> Option<Confidence> {
        match s {
            "HIGH" => Some(Confidence::High),
            "MEDIUM" => Some(Confidence::Medium),
            "LOW" => Some(Confidence::Low),
            _ => None,
        }
    }
}

/// Probability assigned to one bracket, aligned with the event's brackets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketProb {
    pub ticker: String,
    pub lower_bound_f: Option<f64>,
    pub upper_bound_f: Option<f64>,
    pub label: String,
    pub probability: f64,
}

/// Immutable snapshot of one prediction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketPrediction {
    pub city: String,
    pub target_date: NaiveDate,
    pub ensemble_high_f: f64,
    pub forecast_spread_f: f64,
    pub error_std_f: f64,
    pub confidence: Confidence,
    pub source_names: Vec<String>,
    pub brackets: Vec<BracketProb>,
    pub generated_at: DateTime<Utc>,
}

/// Frozen copy of the forecast set that justified a trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotForecast {
    pub source: String,
    pub predicted_high_f: f64,
    pub model_run_ts: String,
}

impl SnapshotForecast {
    pub fn from_rows(rows: &[ForecastRow]) -> Vec<SnapshotForecast> {
        rows.iter()
            .map(|r| SnapshotForecast {
                source: r.source.clone(),
                predicted_high_f: r.predicted_high_f,
                model_run_ts: r.model_run_ts.clone(),
            })
            .collect()
    }
}

/// Offline model artifact: per-city bias corrections produced by the
/// training subsystem. `{ "cities": { "NYC": { "bias_f": -0.4 } } }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MlArtifact {
    #[serde(default)]
    pub cities: HashMap<String, CityBias>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CityBias {
    pub bias_f: f64,
}

impl MlArtifact {
    pub fn load(path: &str) -> Result<MlArtifact> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model artifact: {}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse model artifact: {}", path))
    }

    pub fn bias_for(&self, city: &str) -> f64 {
        self.cities.get(city).map(|c| c.bias_f).unwrap_or(0.0)
    }
}

pub fn source_weight(source: &str) -> f64 {
    SOURCE_WEIGHTS
        .iter()
        .find(|(name, _)| *name == source)
        .map(|(_, w)| *w)
        .unwrap_or(DEFAULT_SOURCE_WEIGHT)
}

#[derive(Debug, Clone)]
pub struct EnsembleStats {
    pub mean_f: f64,
    pub spread_f: f64,
    pub sources: Vec<String>,
}

/// Weighted mean over the newest forecast per source. Single-source input
/// is valid (full weight); empty input is an error.
pub fn weighted_ensemble(forecasts: &[ForecastRow]) -> Result<EnsembleStats, AgentError> {
    if forecasts.is_empty() {
        return Err(AgentError::Invariant("ensemble over empty forecast set".into()));
    }
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut min_t = f64::INFINITY;
    let mut max_t = f64::NEG_INFINITY;
    let mut sources = Vec::with_capacity(forecasts.len());

    for f in forecasts {
        let w = source_weight(&f.source);
        weighted_sum += w * f.predicted_high_f;
        weight_total += w;
        min_t = min_t.min(f.predicted_high_f);
        max_t = max_t.max(f.predicted_high_f);
        sources.push(f.source.clone());
    }

    Ok(EnsembleStats {
        mean_f: weighted_sum / weight_total,
        spread_f: max_t - min_t,
        sources,
    })
}

fn sample_std(samples: &[f64]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

pub fn fallback_error_std(city: &str, season: Season) -> f64 {
    let idx = match season {
        Season::Winter => 0,
        Season::Spring => 1,
        Season::Summer => 2,
        Season::Fall => 3,
    };
    FALLBACK_ERROR_STD
        .iter()
        .find(|(code, _)| *code == city)
        .map(|(_, stds)| stds[idx])
        .unwrap_or(DEFAULT_FALLBACK_STD)
}

/// Historical error std for (city, season); falls back to the table until
/// enough settlement pairs accumulate.
pub fn error_std(db: &Database, city: &str, season: Season) -> Result<f64> {
    let samples = db.error_samples(city, season.months())?;
    if samples.len() >= MIN_CALIBRATION_SAMPLES {
        Ok(sample_std(&samples))
    } else {
        Ok(fallback_error_std(city, season))
    }
}

/// Normal-CDF mass per bracket, clamped to [0,1] and renormalized to sum
/// exactly 1.0. Renormalization absorbs floating-point drift and any
/// micro-gaps between published bracket bounds.
pub fn bracket_probabilities(
    ensemble_f: f64,
    error_std_f: f64,
    brackets: &[Bracket],
) -> Result<Vec<f64>, AgentError> {
    if brackets.is_empty() {
        return Err(AgentError::Invariant("no brackets to price".into()));
    }
    let dist = Normal::new(ensemble_f, error_std_f.max(1e-6))
        .map_err(|e| AgentError::Invariant(format!("bad distribution parameters: {}", e)))?;

    let mut probs: Vec<f64> = brackets
        .iter()
        .map(|b| {
            let p = match (b.lower_bound_f, b.upper_bound_f) {
                (None, Some(u)) => dist.cdf(u),
                (Some(l), None) => 1.0 - dist.cdf(l),
                (Some(l), Some(u)) => dist.cdf(u) - dist.cdf(l),
                (None, None) => 0.0,
            };
            p.clamp(0.0, 1.0)
        })
        .collect();

    let total: f64 = probs.iter().sum();
    if total <= 0.0 {
        return Err(AgentError::Invariant(
            "bracket probabilities sum to zero".into(),
        ));
    }
    for p in probs.iter_mut() {
        *p /= total;
    }
    Ok(probs)
}

/// Integer confidence score (max 7) mapped to HIGH/MEDIUM/LOW. A
/// single-source ensemble is capped at MEDIUM: zero spread alone says
/// nothing about agreement.
pub fn confidence_score(
    spread_f: f64,
    error_std_f: f64,
    source_count: usize,
    data_age_minutes: i64,
) -> (i32, Confidence) {
    let mut score = 0;
    if spread_f <= 1.0 {
        score += 3;
    } else if spread_f <= 2.0 {
        score += 2;
    } else if spread_f <= 3.0 {
        score += 1;
    }
    if error_std_f <= 2.0 {
        score += 2;
    } else if error_std_f <= 3.0 {
        score += 1;
    }
    if source_count >= 4 {
        score += 1;
    }
    if data_age_minutes <= 60 {
        score += 1;
    } else if data_age_minutes > 120 {
        score -= 1;
    }

    let confidence = if score >= 5 && source_count >= 2 {
        Confidence::High
    } else if score >= 3 {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    (score, confidence)
}

/// Prediction engine: weighted ensemble → error-calibrated bracket vector.
pub struct PredictionEngine {
    ml: Option<MlArtifact>,
    ml_weight: f64,
}

impl PredictionEngine {
    pub fn new(ml: Option<MlArtifact>, ml_weight: f64) -> Self {
        PredictionEngine { ml, ml_weight }
    }

    pub fn predict(
        &self,
        db: &Database,
        city: &str,
        target_date: NaiveDate,
        forecasts: &[ForecastRow],
        brackets: &[Bracket],
        now: DateTime<Utc>,
    ) -> Result<BracketPrediction, AgentError> {
        let stats = weighted_ensemble(forecasts)?;

        let mut ensemble_f = stats.mean_f;
        if let Some(ml) = &self.ml {
            ensemble_f += self.ml_weight * ml.bias_for(city);
        }

        let season = Season::from_date(target_date);
        let error_std_f = error_std(db, city, season)
            .map_err(|e| AgentError::Invariant(format!("error std lookup failed: {}", e)))?;

        let probs = bracket_probabilities(ensemble_f, error_std_f, brackets)?;

        let data_age_minutes = forecasts
            .iter()
            .map(|f| (now - f.fetched_at).num_minutes())
            .min()
            .unwrap_or(i64::MAX);
        let (_, confidence) = confidence_score(
            stats.spread_f,
            error_std_f,
            stats.sources.len(),
            data_age_minutes,
        );

        let bracket_probs = brackets
            .iter()
            .zip(probs.iter())
            .map(|(b, p)| BracketProb {
                ticker: b.ticker.clone(),
                lower_bound_f: b.lower_bound_f,
                upper_bound_f: b.upper_bound_f,
                label: b.label.clone(),
                probability: *p,
            })
            .collect();

        Ok(BracketPrediction {
            city: city.to_string(),
            target_date,
            ensemble_high_f: ensemble_f,
            forecast_spread_f: stats.spread_f,
            error_std_f,
            confidence,
            source_names: stats.sources,
            brackets: bracket_probs,
            generated_at: now,
        })
    }
}

/// Deterministic narrative attached to a settled trade: entry terms, model
/// vs market, realized outcome, ensemble miss, and the closest source.
pub fn postmortem_narrative(trade: &TradeRow, actual_high_f: f64, won: bool, pnl_cents: i64) -> String {
    let outcome = if won { "WON" } else { "LOST" };
    let sign = if pnl_cents >= 0 { "+" } else { "" };

    let mut narrative = format!(
        "{} {}: bought {} {} at {}¢ for {} contract(s) (model {:.1}% vs market {:.1}%). \
         Official high {:.1}°F: {} ({}{}¢).",
        trade.city,
        trade.target_date,
        trade.side.to_uppercase(),
        trade.bracket_label,
        trade.entry_price_cents,
        trade.quantity,
        trade.model_prob * 100.0,
        trade.market_prob * 100.0,
        actual_high_f,
        outcome,
        sign,
        pnl_cents,
    );

    if let Ok(prediction) =
        serde_json::from_str::<BracketPrediction>(&trade.prediction_snapshot_json)
    {
        let miss = prediction.ensemble_high_f - actual_high_f;
        narrative.push_str(&format!(
            " Ensemble {:.1}°F missed by {}{:.1}°F.",
            prediction.ensemble_high_f,
            if miss >= 0.0 { "+" } else { "" },
            miss,
        ));
    }

    if let Ok(forecasts) =
        serde_json::from_str::<Vec<SnapshotForecast>>(&trade.weather_snapshot_json)
    {
        if let Some(closest) = forecasts.iter().min_by(|a, b| {
            (a.predicted_high_f - actual_high_f)
                .abs()
                .partial_cmp(&(b.predicted_high_f - actual_high_f).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            narrative.push_str(&format!(
                " Closest source was {} at {:.1}°F (off by {:.1}°F).",
                closest.source,
                closest.predicted_high_f,
                (closest.predicted_high_f - actual_high_f).abs(),
            ));
        }
    }

    narrative
}
