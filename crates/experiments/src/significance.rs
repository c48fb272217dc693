//! Per-strategy outcome aggregation and the effect-size significance gate.
//!
//! This is an effect-size and sample-size heuristic, not a hypothesis test:
//! two strategies are called different when the gap between the top two mean
//! scores exceeds `effect_size_threshold` pooled standard deviations and the
//! leader has more than `min_leading_sample_size` outcomes.

use pricing_core::config::SignificanceConfig;
use pricing_core::types::{Experiment, ExperimentAssignment, ListingOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy_id: String,
    pub sample_size: u64,
    pub avg_score: f64,
    pub avg_revenue_impact: f64,
    pub avg_velocity_change: f64,
    /// Population standard deviation of the score.
    pub score_stddev: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceReport {
    /// One entry per strategy, in experiment order, including strategies
    /// with no outcomes yet.
    pub strategies: Vec<StrategyResult>,
    pub leading_strategy: Option<String>,
    /// Infinite when the top two means differ and neither has any spread;
    /// serialized as `null` in that case.
    pub effect_size: Option<f64>,
    pub significant_difference: bool,
    pub confidence_threshold: f64,
}

#[derive(Default)]
struct Accumulator {
    scores: Vec<f64>,
    revenue: f64,
    velocity: f64,
}

pub struct SignificanceEvaluator {
    config: SignificanceConfig,
}

impl SignificanceEvaluator {
    pub fn new(config: SignificanceConfig) -> Self {
        Self { config }
    }

    /// Join outcomes to assignments and aggregate per strategy. Only
    /// outcomes recorded at or after the experiment start count. Missing
    /// score, revenue impact or velocity change are counted as 0 rather than
    /// dropped, so every joined row contributes to the sample size.
    pub fn evaluate(
        &self,
        experiment: &Experiment,
        assignments: &[ExperimentAssignment],
        outcomes: &[ListingOutcome],
    ) -> SignificanceReport {
        let strategy_of: HashMap<&str, &str> = assignments
            .iter()
            .map(|a| (a.listing_id.as_str(), a.strategy_id.as_str()))
            .collect();

        let mut acc: HashMap<&str, Accumulator> = HashMap::new();
        for outcome in outcomes {
            if let Some(start) = experiment.start_date {
                if outcome.recorded_at < start {
                    continue;
                }
            }
            let Some(strategy_id) = strategy_of.get(outcome.listing_id.as_str()) else {
                continue;
            };
            let entry = acc.entry(*strategy_id).or_default();
            entry.scores.push(finite_or_zero(outcome.score));
            entry.revenue += finite_or_zero(outcome.revenue_impact);
            entry.velocity += finite_or_zero(outcome.velocity_change);
        }

        let strategies: Vec<StrategyResult> = experiment
            .strategies
            .iter()
            .map(|s| match acc.get(s.id.as_str()) {
                Some(a) if !a.scores.is_empty() => {
                    let n = a.scores.len() as f64;
                    let mean = a.scores.iter().sum::<f64>() / n;
                    let variance = a.scores.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                    StrategyResult {
                        strategy_id: s.id.clone(),
                        sample_size: a.scores.len() as u64,
                        avg_score: mean,
                        avg_revenue_impact: a.revenue / n,
                        avg_velocity_change: a.velocity / n,
                        score_stddev: variance.sqrt(),
                    }
                }
                _ => StrategyResult {
                    strategy_id: s.id.clone(),
                    sample_size: 0,
                    avg_score: 0.0,
                    avg_revenue_impact: 0.0,
                    avg_velocity_change: 0.0,
                    score_stddev: 0.0,
                },
            })
            .collect();

        let mut ranked: Vec<&StrategyResult> =
            strategies.iter().filter(|s| s.sample_size > 0).collect();
        // Stable sort keeps experiment order among equal scores.
        ranked.sort_by(|a, b| b.avg_score.total_cmp(&a.avg_score));

        let leading_strategy = ranked.first().map(|s| s.strategy_id.clone());
        let (effect_size, significant_difference) = match ranked.as_slice() {
            [best, second, ..] => {
                let pooled =
                    ((best.score_stddev.powi(2) + second.score_stddev.powi(2)) / 2.0).sqrt();
                let gap = best.avg_score - second.avg_score;
                let effect = if pooled > f64::EPSILON {
                    Some(gap / pooled)
                } else if gap > 0.0 {
                    // Separated means with no spread.
                    Some(f64::INFINITY)
                } else {
                    None
                };
                let significant = effect.is_some_and(|e| {
                    e > self.config.effect_size_threshold
                        && best.sample_size > self.config.min_leading_sample_size
                });
                (effect, significant)
            }
            _ => (None, false),
        };

        SignificanceReport {
            strategies,
            leading_strategy,
            effect_size,
            significant_difference,
            confidence_threshold: experiment.confidence_threshold,
        }
    }
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}
