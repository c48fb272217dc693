use pricing_core::error::{PricingError, PricingResult};
use pricing_core::types::ExperimentStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleTrigger {
    Start,
    Stop,
    Expire,
}

impl LifecycleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleTrigger::Start => "start",
            LifecycleTrigger::Stop => "stop",
            LifecycleTrigger::Expire => "expire",
        }
    }
}

/// A single allowed move between experiment statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
    pub trigger: LifecycleTrigger,
}

/// Experiments only move forward: draft, then active, then completed.
#[derive(Debug, Clone)]
pub struct ExperimentLifecycle {
    pub transitions: Vec<LifecycleTransition>,
}

impl ExperimentLifecycle {
    pub fn new() -> Self {
        let transitions = vec![
            LifecycleTransition {
                from: ExperimentStatus::Draft,
                to: ExperimentStatus::Active,
                trigger: LifecycleTrigger::Start,
            },
            LifecycleTransition {
                from: ExperimentStatus::Active,
                to: ExperimentStatus::Completed,
                trigger: LifecycleTrigger::Stop,
            },
            LifecycleTransition {
                from: ExperimentStatus::Active,
                to: ExperimentStatus::Completed,
                trigger: LifecycleTrigger::Expire,
            },
        ];
        Self { transitions }
    }

    pub fn can_transition(&self, from: ExperimentStatus, to: ExperimentStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Resolve the status `trigger` leads to from `from`, or
    /// `FailedPrecondition` when the trigger does not apply there.
    pub fn apply(
        &self,
        from: ExperimentStatus,
        trigger: LifecycleTrigger,
    ) -> PricingResult<ExperimentStatus> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.trigger == trigger)
            .map(|t| t.to)
            .ok_or_else(|| {
                PricingError::precondition(format!(
                    "cannot {} an experiment in status {:?}",
                    trigger.as_str(),
                    from
                ))
            })
    }
}

impl Default for ExperimentLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
