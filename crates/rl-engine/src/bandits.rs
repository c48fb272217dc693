//! Per-arm Beta posterior model: Gamma-ratio Beta sampling, posterior
//! updates and arm summaries for pricing-strategy experiments.

use pricing_core::types::BanditArm;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmStats {
    pub arm_id: String,
    pub visit_count: u64,
    pub avg_reward: f64,
    pub posterior_mean: f64,
    pub credible_interval_lower: f64,
    pub credible_interval_upper: f64,
    pub traffic_allocation: f64,
}

pub struct BanditStatistics;

impl BanditStatistics {
    /// θ ~ Beta(α, β) as G(α) / (G(α) + G(β)).
    pub fn sample_beta(rng: &mut impl Rng, alpha: f64, beta: f64) -> f64 {
        let x = Self::sample_gamma(rng, alpha);
        let y = Self::sample_gamma(rng, beta);
        if x + y <= 0.0 {
            return 0.5;
        }
        x / (x + y)
    }

    /// Marsaglia–Tsang squeeze for shape ≥ 1; shape < 1 is boosted via
    /// G(a) = G(a + 1) · U^(1/a).
    pub fn sample_gamma(rng: &mut impl Rng, shape: f64) -> f64 {
        if shape < 1.0 {
            let u: f64 = rng.gen();
            return Self::sample_gamma(rng, shape + 1.0) * u.powf(1.0 / shape);
        }

        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();

        loop {
            let x = Self::sample_standard_normal(rng);
            let v = 1.0 + c * x;
            if v <= 0.0 {
                continue;
            }
            let v = v * v * v;
            let u: f64 = rng.gen();

            if u < 1.0 - 0.0331 * (x * x) * (x * x) {
                return d * v;
            }
            if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
                return d * v;
            }
        }
    }

    /// Box–Muller transform.
    pub fn sample_standard_normal(rng: &mut impl Rng) -> f64 {
        // 1 - U keeps the log argument in (0, 1].
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    /// Fold one observed score into the arm. The score is clamped to
    /// `[0, 1]` and split into pseudo-successes and pseudo-failures, so
    /// alpha, beta and the visit count never decrease.
    pub fn observe(arm: &mut BanditArm, score: f64) {
        let s = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        arm.alpha += s;
        arm.beta += 1.0 - s;
        arm.visit_count += 1;
        arm.avg_reward += (score_or_zero(score) - arm.avg_reward) / arm.visit_count as f64;
    }

    pub fn summarize(arms: &[BanditArm]) -> Vec<ArmStats> {
        let total_visits: u64 = arms.iter().map(|a| a.visit_count).sum();

        arms.iter()
            .map(|arm| {
                let (a, b) = (arm.alpha, arm.beta);
                let mean = a / (a + b);
                let variance = (a * b) / ((a + b).powi(2) * (a + b + 1.0));
                let ci_width = 1.96 * variance.sqrt();
                let traffic = if total_visits > 0 {
                    arm.visit_count as f64 / total_visits as f64
                } else {
                    1.0 / arms.len() as f64
                };

                ArmStats {
                    arm_id: arm.arm_id.clone(),
                    visit_count: arm.visit_count,
                    avg_reward: arm.avg_reward,
                    posterior_mean: mean,
                    credible_interval_lower: (mean - ci_width).max(0.0),
                    credible_interval_upper: (mean + ci_width).min(1.0),
                    traffic_allocation: traffic,
                }
            })
            .collect()
    }
}

fn score_or_zero(score: f64) -> f64 {
    if score.is_finite() {
        score
    } else {
        0.0
    }
}
