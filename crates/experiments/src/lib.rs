//! Pricing experiments: lifecycle, listing allocation, outcome recording and
//! significance evaluation.

pub mod lifecycle;
pub mod manager;
pub mod significance;

pub use lifecycle::{ExperimentLifecycle, LifecycleTrigger};
pub use manager::{
    CreateExperimentRequest, CreatedExperiment, ExperimentManager, ExperimentStatusView,
    OutcomeMeasurement, StartedExperiment,
};
pub use significance::{SignificanceEvaluator, SignificanceReport, StrategyResult};
