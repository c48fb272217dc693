//! Experiment manager: create, start, inspect, stop and expire pricing
//! experiments, and fold realized listing outcomes back into the arms.

use crate::lifecycle::{ExperimentLifecycle, LifecycleTrigger};
use crate::significance::{SignificanceEvaluator, SignificanceReport};
use chrono::{DateTime, Duration, Utc};
use pricing_core::config::{BanditConfig, SignificanceConfig};
use pricing_core::error::{ErrorKind, PricingError, PricingResult};
use pricing_core::event_bus::OutcomeSink;
use pricing_core::store::{ExperimentRepository, ListingProvider, OutcomeRepository};
use pricing_core::types::{
    AllocationMethod, BanditArm, Experiment, ExperimentStatus, ExperimentType, ListingFilter,
    ListingOutcome, OutcomeEvent, OutcomeKind, Strategy, SuccessMetric,
};
use pricing_rl_engine::{ArmAllocator, ArmStats, BanditStatistics};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExperimentRequest {
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub experiment_type: ExperimentType,
    pub strategies: Vec<Strategy>,
    pub allocation_method: AllocationMethod,
    pub success_metric: SuccessMetric,
    pub confidence_threshold: Option<f64>,
    pub min_sample_size: Option<u64>,
    pub max_duration_days: Option<u32>,
    pub category_id: Option<String>,
    pub brand: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedExperiment {
    pub experiment_id: Uuid,
    pub status: ExperimentStatus,
    pub assigned_listings: usize,
    /// Days.
    pub estimated_duration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedExperiment {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentStatusView {
    pub experiment_id: Uuid,
    pub name: String,
    pub status: ExperimentStatus,
    pub progress: f64,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub assigned_listings: usize,
    pub results: Option<SignificanceReport>,
    pub arms: Vec<ArmStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeMeasurement {
    pub score: Option<f64>,
    pub revenue_impact: Option<f64>,
    pub velocity_change: Option<f64>,
}

pub struct ExperimentManager {
    experiments: Arc<dyn ExperimentRepository>,
    listings: Arc<dyn ListingProvider>,
    outcomes: Arc<dyn OutcomeRepository>,
    sink: Arc<dyn OutcomeSink>,
    allocator: ArmAllocator,
    evaluator: SignificanceEvaluator,
    lifecycle: ExperimentLifecycle,
    config: BanditConfig,
}

impl ExperimentManager {
    pub fn new(
        experiments: Arc<dyn ExperimentRepository>,
        listings: Arc<dyn ListingProvider>,
        outcomes: Arc<dyn OutcomeRepository>,
        sink: Arc<dyn OutcomeSink>,
        config: BanditConfig,
        significance: SignificanceConfig,
    ) -> Self {
        Self {
            experiments,
            listings,
            outcomes,
            sink,
            allocator: ArmAllocator::new(config.epsilon),
            evaluator: SignificanceEvaluator::new(significance),
            lifecycle: ExperimentLifecycle::new(),
            config,
        }
    }

    /// Create a draft experiment and allocate the eligible listings across
    /// its strategies.
    pub fn create_experiment(
        &self,
        request: CreateExperimentRequest,
        rng: &mut impl Rng,
    ) -> PricingResult<CreatedExperiment> {
        self.validate_create(&request)?;

        let now = Utc::now();
        let experiment = Experiment {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            name: request.name,
            experiment_type: request.experiment_type,
            strategies: request.strategies,
            allocation_method: request.allocation_method,
            success_metric: request.success_metric,
            confidence_threshold: request
                .confidence_threshold
                .unwrap_or(self.config.default_confidence_threshold),
            min_sample_size: request
                .min_sample_size
                .unwrap_or(self.config.default_min_sample_size),
            max_duration_days: request
                .max_duration_days
                .unwrap_or(self.config.default_max_duration_days),
            status: ExperimentStatus::Draft,
            start_date: None,
            end_date: None,
            created_at: now,
            updated_at: now,
        };
        let id = experiment.id;

        let listings = self
            .listings
            .eligible_listings(&ListingFilter {
                category_id: request.category_id,
                brand: request.brand,
                limit: self.config.max_eligible_listings,
            })
            .inspect_err(|e| log_failure(e, &id, "eligible listing query failed"))?;

        let arms: Vec<BanditArm> = experiment
            .strategies
            .iter()
            .map(|s| BanditArm::new(id, s))
            .collect();
        let assignments = self.allocator.allocate(
            id,
            experiment.allocation_method,
            &experiment.strategies,
            &arms,
            &listings,
            rng,
            now,
        );

        let min_sample_size = experiment.min_sample_size;
        let max_duration_days = experiment.max_duration_days;
        let allocation_method = experiment.allocation_method;
        let assigned = self
            .experiments
            .create_experiment(experiment, arms, assignments)
            .inspect_err(|e| log_failure(e, &id, "experiment insert failed"))?;

        let estimated_duration = estimate_duration_days(
            min_sample_size,
            assigned,
            max_duration_days,
            self.config.min_estimated_duration_days,
        );

        metrics::counter!("experiments.created").increment(1);
        metrics::counter!("experiments.assignments").increment(assigned as u64);
        info!(
            experiment_id = %id,
            eligible = listings.len(),
            assigned,
            method = ?allocation_method,
            estimated_duration,
            "experiment created"
        );

        Ok(CreatedExperiment {
            experiment_id: id,
            status: ExperimentStatus::Draft,
            assigned_listings: assigned,
            estimated_duration,
        })
    }

    /// Move an owned draft experiment to active.
    pub fn start_experiment(
        &self,
        id: &Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PricingResult<StartedExperiment> {
        let mut experiment = self.owned(id, user_id)?;
        let from = experiment.status;
        experiment.status = self.lifecycle.apply(from, LifecycleTrigger::Start)?;
        experiment.start_date = Some(now);
        experiment.end_date = Some(now + Duration::days(experiment.max_duration_days as i64));
        experiment.updated_at = now;

        let applied = self
            .experiments
            .transition_status(&experiment, from)
            .inspect_err(|e| log_failure(e, id, "experiment start failed"))?;
        if !applied {
            return Err(PricingError::precondition(format!(
                "experiment {id} is no longer {from:?}"
            )));
        }

        metrics::counter!("experiments.started").increment(1);
        info!(experiment_id = %id, end_date = ?experiment.end_date, "experiment started");
        Ok(StartedExperiment {
            success: true,
            message: format!("experiment '{}' started", experiment.name),
        })
    }

    pub fn get_experiment_status(
        &self,
        id: &Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PricingResult<ExperimentStatusView> {
        let experiment = self.owned(id, user_id)?;
        self.status_view(&experiment, now)
            .inspect_err(|e| log_failure(e, id, "experiment status failed"))
    }

    /// Status of every experiment the caller owns, newest first.
    pub fn list_experiments(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PricingResult<Vec<ExperimentStatusView>> {
        self.experiments
            .list_experiments(user_id)?
            .iter()
            .map(|e| self.status_view(e, now))
            .collect()
    }

    /// Complete an owned active experiment before its end date.
    pub fn stop_experiment(
        &self,
        id: &Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PricingResult<OutcomeEvent> {
        let experiment = self.owned(id, user_id)?;
        self.complete(experiment, LifecycleTrigger::Stop, now)
    }

    /// Complete every active experiment whose end date has passed. A failure
    /// on one experiment is logged and does not stop the sweep.
    pub fn complete_expired(&self, now: DateTime<Utc>) -> PricingResult<Vec<OutcomeEvent>> {
        let mut events = Vec::new();
        for experiment in self.experiments.list_by_status(ExperimentStatus::Active)? {
            if experiment.end_date.map_or(true, |end| end > now) {
                continue;
            }
            let id = experiment.id;
            match self.complete(experiment, LifecycleTrigger::Expire, now) {
                Ok(event) => events.push(event),
                // Completed concurrently by a stop.
                Err(e) if e.kind() == ErrorKind::FailedPrecondition => {
                    warn!(experiment_id = %id, error = %e, "experiment already completed")
                }
                Err(e) => {
                    error!(experiment_id = %id, error = %e, "expiring experiment failed")
                }
            }
        }
        if !events.is_empty() {
            info!(completed = events.len(), "expired experiments completed");
        }
        Ok(events)
    }

    /// Store a realized outcome for an assigned listing and update the arm
    /// of the strategy it was assigned to.
    pub fn record_outcome(
        &self,
        experiment_id: &Uuid,
        listing_id: &str,
        measurement: OutcomeMeasurement,
        now: DateTime<Utc>,
    ) -> PricingResult<()> {
        let experiment = self
            .experiments
            .get_experiment(experiment_id)?
            .ok_or_else(|| PricingError::not_found(format!("experiment {experiment_id}")))?;
        if experiment.status != ExperimentStatus::Active {
            return Err(PricingError::precondition(format!(
                "experiment {experiment_id} is not active"
            )));
        }
        let assignment = self
            .experiments
            .assignment(experiment_id, listing_id)?
            .ok_or_else(|| {
                PricingError::not_found(format!(
                    "listing {listing_id} is not assigned to experiment {experiment_id}"
                ))
            })?;

        self.outcomes
            .record_outcome(ListingOutcome {
                experiment_id: *experiment_id,
                listing_id: listing_id.to_string(),
                score: measurement.score,
                revenue_impact: measurement.revenue_impact,
                velocity_change: measurement.velocity_change,
                recorded_at: now,
            })
            .inspect_err(|e| log_failure(e, experiment_id, "outcome insert failed"))?;

        // Arm statistics are best effort; the outcome row is the record.
        if let Err(e) = self.update_arm(experiment_id, &assignment.strategy_id, measurement.score) {
            warn!(
                experiment_id = %experiment_id,
                listing_id,
                strategy_id = %assignment.strategy_id,
                error = %e,
                "arm update failed"
            );
        }
        Ok(())
    }

    fn update_arm(
        &self,
        experiment_id: &Uuid,
        arm_id: &str,
        score: Option<f64>,
    ) -> PricingResult<()> {
        let mut arm = self
            .experiments
            .arms(experiment_id)?
            .into_iter()
            .find(|a| a.arm_id == arm_id)
            .ok_or_else(|| PricingError::not_found(format!("arm {arm_id}")))?;
        BanditStatistics::observe(&mut arm, score.unwrap_or(0.0));
        self.experiments.update_arm(&arm)
    }

    /// Evaluate, then persist the completed status, then emit. The status
    /// write only lands if the experiment is still active, so a stop racing
    /// the expiry sweep completes it once.
    fn complete(
        &self,
        mut experiment: Experiment,
        trigger: LifecycleTrigger,
        now: DateTime<Utc>,
    ) -> PricingResult<OutcomeEvent> {
        let id = experiment.id;
        let from = experiment.status;
        experiment.status = self.lifecycle.apply(from, trigger)?;
        if trigger == LifecycleTrigger::Stop {
            experiment.end_date = Some(now);
        }
        experiment.updated_at = now;

        let report = self
            .evaluate(&experiment)
            .inspect_err(|e| log_failure(e, &id, "experiment evaluation failed"))?;
        let event = OutcomeEvent {
            experiment_id: id,
            user_id: experiment.user_id.clone(),
            outcome: if report.significant_difference {
                OutcomeKind::Conclusive
            } else {
                OutcomeKind::Inconclusive
            },
            winning_strategy_id: report
                .significant_difference
                .then(|| report.leading_strategy.clone())
                .flatten(),
            timestamp: now,
        };

        let applied = self
            .experiments
            .transition_status(&experiment, from)
            .inspect_err(|e| log_failure(e, &id, "experiment completion failed"))?;
        if !applied {
            return Err(PricingError::precondition(format!(
                "experiment {id} is no longer {from:?}"
            )));
        }
        self.sink.emit(event.clone());

        metrics::counter!("experiments.completed", "trigger" => trigger.as_str()).increment(1);
        info!(
            experiment_id = %id,
            trigger = trigger.as_str(),
            outcome = ?event.outcome,
            winner = ?event.winning_strategy_id,
            "experiment completed"
        );
        Ok(event)
    }

    fn evaluate(&self, experiment: &Experiment) -> PricingResult<SignificanceReport> {
        let assignments = self.experiments.assignments(&experiment.id)?;
        let outcomes = self.outcomes.outcomes(&experiment.id)?;
        Ok(self.evaluator.evaluate(experiment, &assignments, &outcomes))
    }

    fn status_view(
        &self,
        experiment: &Experiment,
        now: DateTime<Utc>,
    ) -> PricingResult<ExperimentStatusView> {
        let results = match experiment.status {
            ExperimentStatus::Active | ExperimentStatus::Completed => {
                Some(self.evaluate(experiment)?)
            }
            ExperimentStatus::Draft => None,
        };
        let arms = self.experiments.arms(&experiment.id)?;
        let assigned_listings = self.experiments.assignments(&experiment.id)?.len();

        Ok(ExperimentStatusView {
            experiment_id: experiment.id,
            name: experiment.name.clone(),
            status: experiment.status,
            progress: progress(experiment, now),
            start_date: experiment.start_date,
            end_date: experiment.end_date,
            assigned_listings,
            results,
            arms: BanditStatistics::summarize(&arms),
        })
    }

    /// Experiments not owned by the caller are reported as missing.
    fn owned(&self, id: &Uuid, user_id: &str) -> PricingResult<Experiment> {
        self.experiments
            .get_experiment(id)
            .inspect_err(|e| log_failure(e, id, "experiment lookup failed"))?
            .filter(|e| e.user_id == user_id)
            .ok_or_else(|| PricingError::not_found(format!("experiment {id}")))
    }

    fn validate_create(&self, request: &CreateExperimentRequest) -> PricingResult<()> {
        if request.strategies.len() < 2 {
            return Err(PricingError::invalid(format!(
                "at least 2 strategies are required, got {}",
                request.strategies.len()
            )));
        }
        if request.name.trim().is_empty() {
            return Err(PricingError::invalid("experiment name must not be empty"));
        }
        let mut seen = HashSet::new();
        for strategy in &request.strategies {
            if strategy.id.is_empty() {
                return Err(PricingError::invalid("strategy id must not be empty"));
            }
            if !seen.insert(strategy.id.as_str()) {
                return Err(PricingError::invalid(format!(
                    "duplicate strategy id '{}'",
                    strategy.id
                )));
            }
            strategy.config.validate()?;
        }
        if let Some(c) = request.confidence_threshold {
            if !(c > 0.0 && c < 1.0) {
                return Err(PricingError::invalid("confidence_threshold must be in (0, 1)"));
            }
        }
        if request.min_sample_size == Some(0) {
            return Err(PricingError::invalid("min_sample_size must be positive"));
        }
        if request.max_duration_days == Some(0) {
            return Err(PricingError::invalid("max_duration_days must be positive"));
        }
        Ok(())
    }
}

/// `min(max_days, max(floor_days, ceil(min_sample / max(1, assigned / 7))))`.
pub fn estimate_duration_days(
    min_sample_size: u64,
    assigned: usize,
    max_days: u32,
    floor_days: u32,
) -> u32 {
    let per_day = (assigned as f64 / 7.0).max(1.0);
    let days = (min_sample_size as f64 / per_day).ceil();
    let days = days.min(u32::MAX as f64) as u32;
    days.max(floor_days).min(max_days)
}

/// Percentage of the scheduled window elapsed: clamped while active, 100
/// once completed and 0 for drafts.
pub fn progress(experiment: &Experiment, now: DateTime<Utc>) -> f64 {
    match (experiment.status, experiment.start_date, experiment.end_date) {
        (ExperimentStatus::Completed, _, _) => 100.0,
        (ExperimentStatus::Active, Some(start), Some(end)) => {
            let total = (end - start).num_milliseconds();
            if total <= 0 {
                return 100.0;
            }
            let elapsed = (now - start).num_milliseconds();
            (elapsed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

fn log_failure(err: &PricingError, experiment_id: &Uuid, message: &str) {
    if err.kind() == ErrorKind::Internal {
        error!(experiment_id = %experiment_id, error = %err, "{message}");
    }
}
