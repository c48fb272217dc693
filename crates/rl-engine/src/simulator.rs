//! Offline training by simulated pricing episodes.
//!
//! Each episode walks one listing through at most `max_steps_per_episode`
//! price adjustments against a fixed-elasticity demand model, then applies the
//! Q-update for every transition it recorded.

use crate::q_policy::{log_failure, QPolicy};
use crate::state_encoder::StateEncoder;
use chrono::Utc;
use pricing_core::config::TrainingConfig;
use pricing_core::error::{PricingError, PricingResult};
use pricing_core::store::ListingProvider;
use pricing_core::types::{
    ListingFilter, ListingSnapshot, ListingStatus, PriceAction, Reward, RlFeatures, Transition,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const PRICE_HISTORY_LEN: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub episodes: usize,
    pub learning_rate: Option<f64>,
    pub discount_factor: Option<f64>,
    pub exploration_rate: Option<f64>,
    pub category_id: Option<String>,
    pub listing_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceSnapshot {
    pub episode: usize,
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
}

/// Heuristic diagnostics from the spread of recent episode rewards. These
/// are not a convergence proof.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergenceMetrics {
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    pub history: Vec<ConvergenceSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub best_episode_reward: f64,
    pub worst_episode_reward: f64,
    pub total_steps: usize,
    pub early_terminations: usize,
    pub q_table_size: usize,
    pub final_exploration_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingResult {
    pub episodes_completed: usize,
    pub avg_reward: f64,
    pub convergence_metrics: ConvergenceMetrics,
    pub model_performance: ModelPerformance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TrainingRun {
    pub result: TrainingResult,
    pub stopped: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub struct EpisodeSummary {
    pub listing_id: String,
    pub transitions: Vec<Transition>,
    pub total_reward: f64,
    pub terminated_early: bool,
}

/// Cancellation flag, deadline and progress counter shared with whoever
/// started the run. Checked between episodes.
#[derive(Debug, Clone, Default)]
pub struct TrainingControl {
    pub cancelled: Arc<AtomicBool>,
    pub deadline: Option<Instant>,
    pub episodes_completed: Arc<AtomicUsize>,
}

impl TrainingControl {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Default::default()
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimedOut),
            _ => None,
        }
    }
}

pub struct EpisodeSimulator {
    policy: Arc<QPolicy>,
    listings: Arc<dyn ListingProvider>,
    config: TrainingConfig,
    max_eligible_listings: usize,
}

impl EpisodeSimulator {
    pub fn new(
        policy: Arc<QPolicy>,
        listings: Arc<dyn ListingProvider>,
        config: TrainingConfig,
        max_eligible_listings: usize,
    ) -> Self {
        Self {
            policy,
            listings,
            config,
            max_eligible_listings,
        }
    }

    /// Run training to completion on the calling thread.
    pub fn train_model(
        &self,
        request: &TrainingRequest,
        rng: &mut impl Rng,
    ) -> PricingResult<TrainingResult> {
        Ok(self
            .train_with_control(request, &TrainingControl::default(), rng)?
            .result)
    }

    pub fn validate(&self, request: &TrainingRequest) -> PricingResult<()> {
        if request.episodes == 0 || request.episodes > self.config.max_episodes {
            return Err(PricingError::invalid(format!(
                "episodes must be in 1..={}, got {}",
                self.config.max_episodes, request.episodes
            )));
        }
        if let Some(lr) = request.learning_rate {
            if !(lr > 0.0 && lr <= 1.0) {
                return Err(PricingError::invalid("learning_rate must be in (0, 1]"));
            }
        }
        if let Some(df) = request.discount_factor {
            if !(0.0..=1.0).contains(&df) {
                return Err(PricingError::invalid("discount_factor must be in [0, 1]"));
            }
        }
        if let Some(er) = request.exploration_rate {
            if !(0.0..=1.0).contains(&er) {
                return Err(PricingError::invalid("exploration_rate must be in [0, 1]"));
            }
        }
        Ok(())
    }

    pub fn eligible_listings(
        &self,
        request: &TrainingRequest,
    ) -> PricingResult<Vec<ListingSnapshot>> {
        let listings = match &request.listing_ids {
            Some(ids) if !ids.is_empty() => {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(listing) = self.listings.get_listing(id)? {
                        if listing.status == ListingStatus::Active {
                            found.push(listing);
                        }
                    }
                }
                found
            }
            _ => self.listings.eligible_listings(&ListingFilter {
                category_id: request.category_id.clone(),
                brand: None,
                limit: self.max_eligible_listings,
            })?,
        };

        if listings.is_empty() {
            return Err(PricingError::invalid("no eligible listings found for training"));
        }
        Ok(listings)
    }

    pub fn train_with_control(
        &self,
        request: &TrainingRequest,
        control: &TrainingControl,
        rng: &mut impl Rng,
    ) -> PricingResult<TrainingRun> {
        self.validate(request)?;
        let listings = self.eligible_listings(request)?;

        let q = self.policy.config();
        let learning_rate = request.learning_rate.unwrap_or(q.learning_rate);
        let discount_factor = request.discount_factor.unwrap_or(q.discount_factor);
        let mut epsilon = request.exploration_rate.unwrap_or(q.exploration_rate);

        let mut rewards = Vec::with_capacity(request.episodes);
        let mut metrics = ConvergenceMetrics::default();
        let mut total_steps = 0;
        let mut early_terminations = 0;
        let mut stopped = None;

        for episode in 0..request.episodes {
            if let Some(reason) = control.stop_reason() {
                stopped = Some(reason);
                break;
            }

            let listing = &listings[rng.gen_range(0..listings.len())];
            let summary = self
                .run_episode(listing, epsilon, rng)
                .inspect_err(|e| log_failure(e, &listing.id, "training episode failed"))?;
            for t in &summary.transitions {
                let next_hash = (!t.done).then_some(t.next_state.state_hash.as_str());
                self.policy
                    .update(
                        &t.state.state_hash,
                        &t.action,
                        t.reward.total,
                        next_hash,
                        learning_rate,
                        discount_factor,
                    )
                    .inspect_err(|e| log_failure(e, &listing.id, "training q-update failed"))?;
            }

            total_steps += summary.transitions.len();
            if summary.terminated_early {
                early_terminations += 1;
            }
            rewards.push(summary.total_reward);
            epsilon *= self.config.epsilon_decay;

            control.episodes_completed.store(episode + 1, Ordering::SeqCst);
            metrics::counter!("rl.training.episodes").increment(1);

            let interval = self.config.diagnostics_interval.max(1);
            if (episode + 1) % interval == 0 {
                let snapshot = diagnostics(episode + 1, tail(&rewards, interval));
                debug!(
                    episode = snapshot.episode,
                    policy_loss = snapshot.policy_loss,
                    entropy = snapshot.entropy,
                    "convergence diagnostics"
                );
                metrics.history.push(snapshot);
            }
        }

        let interval = self.config.diagnostics_interval.max(1);
        let last = diagnostics(rewards.len(), tail(&rewards, interval));
        metrics.policy_loss = last.policy_loss;
        metrics.value_loss = last.value_loss;
        metrics.entropy = last.entropy;

        let episodes_completed = rewards.len();
        let avg_reward = if episodes_completed > 0 {
            rewards.iter().sum::<f64>() / episodes_completed as f64
        } else {
            0.0
        };

        let result = TrainingResult {
            episodes_completed,
            avg_reward,
            convergence_metrics: metrics,
            model_performance: ModelPerformance {
                best_episode_reward: rewards.iter().copied().reduce(f64::max).unwrap_or(0.0),
                worst_episode_reward: rewards.iter().copied().reduce(f64::min).unwrap_or(0.0),
                total_steps,
                early_terminations,
                q_table_size: self.policy.table_size()?,
                final_exploration_rate: epsilon,
            },
        };

        info!(
            episodes_completed,
            avg_reward,
            total_steps,
            stopped = ?stopped,
            "training run finished"
        );
        Ok(TrainingRun { result, stopped })
    }

    /// Simulate one episode for `listing` without touching the Q-table.
    pub fn run_episode(
        &self,
        listing: &ListingSnapshot,
        epsilon: f64,
        rng: &mut impl Rng,
    ) -> PricingResult<EpisodeSummary> {
        let mut state = StateEncoder::encode_listing(listing, Utc::now());
        let original_price = state.features.original_price;
        let mut transitions = Vec::new();
        let mut total_reward = 0.0;
        let mut terminated_early = false;

        for _ in 0..self.config.max_steps_per_episode {
            let action = self.policy.epsilon_greedy(&state, epsilon, rng)?;
            let (next_features, reward) = self.simulate_market_response(&state.features, &action);

            let ratio = next_features.current_price / original_price;
            let done = reward.total < self.config.early_stop_reward
                || ratio < self.config.price_floor_ratio
                || ratio > self.config.price_ceiling_ratio;

            let next_state = StateEncoder::encode(&listing.id, next_features);
            total_reward += reward.total;
            transitions.push(Transition {
                state,
                action,
                reward,
                next_state: next_state.clone(),
                done,
            });
            state = next_state;

            if done {
                terminated_early = true;
                break;
            }
        }

        Ok(EpisodeSummary {
            listing_id: listing.id.clone(),
            transitions,
            total_reward,
            terminated_early,
        })
    }

    /// Apply `action` to the listing and return the next features with the
    /// reward it earned.
    pub fn simulate_market_response(
        &self,
        features: &RlFeatures,
        action: &PriceAction,
    ) -> (RlFeatures, Reward) {
        let price_change = action.price_change();
        let new_price = features.current_price * (1.0 + price_change);
        let demand_change = -self.config.demand_elasticity * price_change;

        let immediate =
            (price_change + demand_change + price_change * demand_change).clamp(-1.0, 1.0);
        let reference = features
            .avg_competitor_price()
            .unwrap_or(features.original_price);
        let delayed = if new_price < self.config.competitor_margin * reference {
            0.1
        } else {
            -0.1
        };
        let reward = Reward::new(immediate, delayed, self.config.delayed_reward_weight);

        let mut price_history = features.price_history.clone();
        price_history.push(features.current_price);
        let skip = price_history.len().saturating_sub(PRICE_HISTORY_LEN);
        price_history.drain(..skip);

        let scale = |n: u64| ((n as f64) * (1.0 + demand_change)).round().max(0.0) as u64;
        let views = scale(features.views);
        let watchers = scale(features.watchers);
        let market_trend = match features.avg_competitor_price() {
            Some(avg) if new_price > 0.0 => ((avg - new_price) / new_price).clamp(-1.0, 1.0),
            _ => 0.0,
        };

        let next = RlFeatures {
            current_price: new_price,
            original_price: features.original_price,
            price_history,
            views,
            watchers,
            competitor_prices: features.competitor_prices.clone(),
            market_trend,
            seasonal_factor: features.seasonal_factor,
            days_since_listing: features.days_since_listing + 1,
            category_demand: if views == 0 {
                0.0
            } else {
                (watchers as f64 / views as f64).clamp(0.0, 1.0)
            },
        };
        (next, reward)
    }
}

fn tail(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

fn diagnostics(episode: usize, recent: &[f64]) -> ConvergenceSnapshot {
    let variance = if recent.is_empty() {
        0.0
    } else {
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        recent.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / recent.len() as f64
    };
    ConvergenceSnapshot {
        episode,
        policy_loss: variance,
        value_loss: variance.sqrt(),
        entropy: variance.min(1.0),
    }
}
