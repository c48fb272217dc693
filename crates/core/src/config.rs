use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `PRICING_LAB__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub q_learning: QLearningConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub significance: SignificanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_max_eligible_listings")]
    pub max_eligible_listings: usize,
    #[serde(default = "default_confidence_threshold")]
    pub default_confidence_threshold: f64,
    #[serde(default = "default_min_sample_size")]
    pub default_min_sample_size: u64,
    #[serde(default = "default_max_duration_days")]
    pub default_max_duration_days: u32,
    #[serde(default = "default_min_estimated_duration_days")]
    pub min_estimated_duration_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QLearningConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_discount_factor")]
    pub discount_factor: f64,
    #[serde(default = "default_exploration_rate")]
    pub exploration_rate: f64,
    #[serde(default = "default_softmax_temperature")]
    pub softmax_temperature: f64,
    #[serde(default = "default_max_magnitude")]
    pub max_magnitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_max_steps_per_episode")]
    pub max_steps_per_episode: usize,
    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,
    #[serde(default = "default_diagnostics_interval")]
    pub diagnostics_interval: usize,
    #[serde(default = "default_early_stop_reward")]
    pub early_stop_reward: f64,
    #[serde(default = "default_price_floor_ratio")]
    pub price_floor_ratio: f64,
    #[serde(default = "default_price_ceiling_ratio")]
    pub price_ceiling_ratio: f64,
    #[serde(default = "default_max_episodes")]
    pub max_episodes: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_demand_elasticity")]
    pub demand_elasticity: f64,
    #[serde(default = "default_competitor_margin")]
    pub competitor_margin: f64,
    #[serde(default = "default_delayed_reward_weight")]
    pub delayed_reward_weight: f64,
    /// Finished training jobs kept for status queries.
    #[serde(default = "default_max_retained_jobs")]
    pub max_retained_jobs: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignificanceConfig {
    #[serde(default = "default_effect_size_threshold")]
    pub effect_size_threshold: f64,
    #[serde(default = "default_min_leading_sample_size")]
    pub min_leading_sample_size: u64,
}

// Default functions
fn default_node_id() -> String {
    "pricing-01".to_string()
}
fn default_epsilon() -> f64 {
    0.10
}
fn default_max_eligible_listings() -> usize {
    1000
}
fn default_confidence_threshold() -> f64 {
    0.95
}
fn default_min_sample_size() -> u64 {
    100
}
fn default_max_duration_days() -> u32 {
    30
}
fn default_min_estimated_duration_days() -> u32 {
    7
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_discount_factor() -> f64 {
    0.95
}
fn default_exploration_rate() -> f64 {
    0.1
}
fn default_softmax_temperature() -> f64 {
    1.0
}
fn default_max_magnitude() -> f64 {
    0.2
}
fn default_max_steps_per_episode() -> usize {
    10
}
fn default_epsilon_decay() -> f64 {
    0.995
}
fn default_diagnostics_interval() -> usize {
    10
}
fn default_early_stop_reward() -> f64 {
    -0.8
}
fn default_price_floor_ratio() -> f64 {
    0.5
}
fn default_price_ceiling_ratio() -> f64 {
    2.0
}
fn default_max_episodes() -> usize {
    10_000
}
fn default_job_timeout_secs() -> u64 {
    300
}
fn default_demand_elasticity() -> f64 {
    1.2
}
fn default_competitor_margin() -> f64 {
    1.1
}
fn default_delayed_reward_weight() -> f64 {
    0.5
}
fn default_max_retained_jobs() -> usize {
    100
}
fn default_effect_size_threshold() -> f64 {
    0.5
}
fn default_min_leading_sample_size() -> u64 {
    30
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            max_eligible_listings: default_max_eligible_listings(),
            default_confidence_threshold: default_confidence_threshold(),
            default_min_sample_size: default_min_sample_size(),
            default_max_duration_days: default_max_duration_days(),
            min_estimated_duration_days: default_min_estimated_duration_days(),
        }
    }
}

impl Default for QLearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            discount_factor: default_discount_factor(),
            exploration_rate: default_exploration_rate(),
            softmax_temperature: default_softmax_temperature(),
            max_magnitude: default_max_magnitude(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_steps_per_episode: default_max_steps_per_episode(),
            epsilon_decay: default_epsilon_decay(),
            diagnostics_interval: default_diagnostics_interval(),
            early_stop_reward: default_early_stop_reward(),
            price_floor_ratio: default_price_floor_ratio(),
            price_ceiling_ratio: default_price_ceiling_ratio(),
            max_episodes: default_max_episodes(),
            job_timeout_secs: default_job_timeout_secs(),
            demand_elasticity: default_demand_elasticity(),
            competitor_margin: default_competitor_margin(),
            delayed_reward_weight: default_delayed_reward_weight(),
            max_retained_jobs: default_max_retained_jobs(),
        }
    }
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            effect_size_threshold: default_effect_size_threshold(),
            min_leading_sample_size: default_min_leading_sample_size(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bandit: BanditConfig::default(),
            q_learning: QLearningConfig::default(),
            training: TrainingConfig::default(),
            significance: SignificanceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PRICING_LAB")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engines cannot run with. Action magnitudes are
    /// stored in Q-table keys that only parse back within `(0, 1]`.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let q = &self.q_learning;
        let unit = 0.0..=1.0;
        check(
            q.max_magnitude > 0.0 && q.max_magnitude <= 1.0,
            "q_learning.max_magnitude",
            "in (0, 1]",
        )?;
        check(
            q.learning_rate > 0.0 && q.learning_rate <= 1.0,
            "q_learning.learning_rate",
            "in (0, 1]",
        )?;
        check(unit.contains(&q.discount_factor), "q_learning.discount_factor", "in [0, 1]")?;
        check(unit.contains(&q.exploration_rate), "q_learning.exploration_rate", "in [0, 1]")?;
        check(q.softmax_temperature > 0.0, "q_learning.softmax_temperature", "in (0, inf)")?;
        check(unit.contains(&self.bandit.epsilon), "bandit.epsilon", "in [0, 1]")?;

        let t = &self.training;
        check(
            t.epsilon_decay > 0.0 && t.epsilon_decay <= 1.0,
            "training.epsilon_decay",
            "in (0, 1]",
        )?;
        check(t.max_episodes > 0, "training.max_episodes", "in [1, inf)")?;
        check(t.max_retained_jobs > 0, "training.max_retained_jobs", "in [1, inf)")?;
        check(
            t.price_floor_ratio < t.price_ceiling_ratio,
            "training.price_floor_ratio",
            "below training.price_ceiling_ratio",
        )?;
        Ok(())
    }
}

fn check(ok: bool, key: &str, rule: &str) -> Result<(), config::ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(config::ConfigError::Message(format!("{key} must be {rule}")))
    }
}
