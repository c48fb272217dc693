//! Strategy allocation for experiment listings: equal round-robin,
//! epsilon-greedy and Thompson Sampling over a read-only arm snapshot.
//!
//! The allocator holds no state of its own: given the same arms and the
//! same seeded RNG it always produces the same assignments.

use crate::bandits::BanditStatistics;
use chrono::{DateTime, Utc};
use pricing_core::types::{
    AllocationMethod, BanditArm, ExperimentAssignment, ListingSnapshot, Strategy,
};
use rand::Rng;
use uuid::Uuid;

pub struct ArmAllocator {
    epsilon: f64,
}

impl ArmAllocator {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    /// Pick a strategy for the listing at position `index`.
    pub fn select<'a>(
        &self,
        method: AllocationMethod,
        index: usize,
        strategies: &'a [Strategy],
        arms: &[BanditArm],
        rng: &mut impl Rng,
    ) -> Option<&'a Strategy> {
        if strategies.is_empty() {
            return None;
        }

        match method {
            AllocationMethod::Equal => strategies.get(index % strategies.len()),
            AllocationMethod::EpsilonGreedy => self.epsilon_greedy(strategies, arms, rng),
            AllocationMethod::ThompsonSampling => Self::thompson_sampling(strategies, arms, rng),
        }
    }

    /// Assign every listing in order. Listings keep the position they were
    /// given, which is what makes equal allocation index-deterministic.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &self,
        experiment_id: Uuid,
        method: AllocationMethod,
        strategies: &[Strategy],
        arms: &[BanditArm],
        listings: &[ListingSnapshot],
        rng: &mut impl Rng,
        now: DateTime<Utc>,
    ) -> Vec<ExperimentAssignment> {
        listings
            .iter()
            .enumerate()
            .filter_map(|(i, listing)| {
                self.select(method, i, strategies, arms, rng)
                    .map(|strategy| ExperimentAssignment {
                        experiment_id,
                        listing_id: listing.id.clone(),
                        strategy_id: strategy.id.clone(),
                        assigned_at: now,
                    })
            })
            .collect()
    }

    fn epsilon_greedy<'a>(
        &self,
        strategies: &'a [Strategy],
        arms: &[BanditArm],
        rng: &mut impl Rng,
    ) -> Option<&'a Strategy> {
        if rng.gen::<f64>() < self.epsilon {
            return Self::uniform(strategies, rng);
        }

        let mut best_reward = f64::NEG_INFINITY;
        let mut best = None;
        for arm in arms {
            let Some(strategy) = strategies.iter().find(|s| s.id == arm.arm_id) else {
                continue;
            };
            if arm.avg_reward > best_reward {
                best_reward = arm.avg_reward;
                best = Some(strategy);
            }
        }

        match best {
            Some(strategy) => Some(strategy),
            None => Self::uniform(strategies, rng),
        }
    }

    fn thompson_sampling<'a>(
        strategies: &'a [Strategy],
        arms: &[BanditArm],
        rng: &mut impl Rng,
    ) -> Option<&'a Strategy> {
        let mut best_sample = f64::NEG_INFINITY;
        let mut best = None;

        for arm in arms {
            let Some(strategy) = strategies.iter().find(|s| s.id == arm.arm_id) else {
                continue;
            };
            let sample = BanditStatistics::sample_beta(rng, arm.alpha, arm.beta);
            if sample > best_sample {
                best_sample = sample;
                best = Some(strategy);
            }
        }

        match best {
            Some(strategy) => Some(strategy),
            None => Self::uniform(strategies, rng),
        }
    }

    fn uniform<'a>(strategies: &'a [Strategy], rng: &mut impl Rng) -> Option<&'a Strategy> {
        if strategies.is_empty() {
            return None;
        }
        strategies.get(rng.gen_range(0..strategies.len()))
    }
}
