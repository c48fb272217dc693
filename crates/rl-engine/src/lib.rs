//! Learning engine for pricing: Beta-posterior bandits and strategy
//! allocation for experiments, plus a tabular Q-learning policy over listing
//! states trained offline by simulated episodes.

pub mod allocator;
pub mod bandits;
pub mod q_policy;
pub mod simulator;
pub mod state_encoder;
pub mod training;

pub use allocator::ArmAllocator;
pub use bandits::{ArmStats, BanditStatistics};
pub use q_policy::{ActionDecision, QPolicy, QUpdate, RewardRecorded};
pub use simulator::{EpisodeSimulator, TrainingControl, TrainingRequest, TrainingResult};
pub use state_encoder::StateEncoder;
pub use training::{JobState, TrainingJob, TrainingJobManager};
