use crate::error::{PricingError, PricingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ─── Listings ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Inactive,
    Sold,
}

/// Listing feature snapshot supplied by the marketplace side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub id: String,
    pub user_id: String,
    pub category_id: Option<String>,
    pub brand: Option<String>,
    pub status: ListingStatus,
    pub current_price: f64,
    pub original_price: f64,
    pub views: u64,
    pub watchers: u64,
    #[serde(default)]
    pub competitor_prices: Vec<f64>,
    #[serde(default)]
    pub price_history: Vec<f64>,
    pub listed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingFilter {
    pub category_id: Option<String>,
    pub brand: Option<String>,
    pub limit: usize,
}

// ─── Strategies ─────────────────────────────────────────────────────────

/// Pricing strategy parameters, one variant per strategy kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StrategyConfig {
    FixedDiscount { percent: f64 },
    CompetitorMatch { offset_percent: f64 },
    DynamicMarkup { min_margin: f64, max_markup: f64 },
    Hold,
}

impl StrategyConfig {
    pub fn validate(&self) -> PricingResult<()> {
        match self {
            StrategyConfig::FixedDiscount { percent } => {
                if !percent.is_finite() || *percent <= 0.0 || *percent >= 100.0 {
                    return Err(PricingError::invalid(format!(
                        "fixed_discount percent must be in (0, 100), got {percent}"
                    )));
                }
            }
            StrategyConfig::CompetitorMatch { offset_percent } => {
                if !offset_percent.is_finite() || offset_percent.abs() > 50.0 {
                    return Err(PricingError::invalid(format!(
                        "competitor_match offset_percent must be within ±50, got {offset_percent}"
                    )));
                }
            }
            StrategyConfig::DynamicMarkup {
                min_margin,
                max_markup,
            } => {
                if !min_margin.is_finite() || !max_markup.is_finite() {
                    return Err(PricingError::invalid("dynamic_markup bounds must be finite"));
                }
                if *min_margin < 0.0 || min_margin > max_markup {
                    return Err(PricingError::invalid(format!(
                        "invalid dynamic_markup bounds {min_margin}..{max_markup}"
                    )));
                }
            }
            StrategyConfig::Hold => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub config: StrategyConfig,
}

// ─── Experiments ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    AbTest,
    MultiArmedBandit,
    ReinforcementLearning,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    Equal,
    EpsilonGreedy,
    ThompsonSampling,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuccessMetric {
    Revenue,
    SellThrough,
    Conversion,
    Margin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Completed,
}

/// Pricing experiment definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub experiment_type: ExperimentType,
    pub strategies: Vec<Strategy>,
    pub allocation_method: AllocationMethod,
    pub success_metric: SuccessMetric,
    pub confidence_threshold: f64,
    pub min_sample_size: u64,
    pub max_duration_days: u32,
    pub status: ExperimentStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Beta posterior for one strategy within an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditArm {
    pub experiment_id: Uuid,
    pub arm_id: String,
    pub strategy_config: StrategyConfig,
    pub alpha: f64,
    pub beta: f64,
    pub visit_count: u64,
    pub avg_reward: f64,
}

impl BanditArm {
    /// Uninformative Beta(1, 1) prior.
    pub fn new(experiment_id: Uuid, strategy: &Strategy) -> Self {
        Self {
            experiment_id,
            arm_id: strategy.id.clone(),
            strategy_config: strategy.config.clone(),
            alpha: 1.0,
            beta: 1.0,
            visit_count: 0,
            avg_reward: 0.0,
        }
    }

    pub fn posterior_mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentAssignment {
    pub experiment_id: Uuid,
    pub listing_id: String,
    pub strategy_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// A realized outcome for a listing taking part in an experiment.
/// Every field of the measurement is optional; the evaluator counts a
/// missing score as 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingOutcome {
    pub experiment_id: Uuid,
    pub listing_id: String,
    pub score: Option<f64>,
    pub revenue_impact: Option<f64>,
    pub velocity_change: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Conclusive,
    Inconclusive,
}

/// Published when an experiment completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub experiment_id: Uuid,
    pub user_id: String,
    pub outcome: OutcomeKind,
    pub winning_strategy_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── Reinforcement learning ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RlFeatures {
    pub current_price: f64,
    pub original_price: f64,
    #[serde(default)]
    pub price_history: Vec<f64>,
    pub views: u64,
    pub watchers: u64,
    #[serde(default)]
    pub competitor_prices: Vec<f64>,
    pub market_trend: f64,
    pub seasonal_factor: f64,
    pub days_since_listing: u32,
    pub category_demand: f64,
}

impl RlFeatures {
    pub fn validate(&self) -> PricingResult<()> {
        if !self.current_price.is_finite() || self.current_price <= 0.0 {
            return Err(PricingError::invalid("current_price must be positive"));
        }
        if !self.original_price.is_finite() || self.original_price <= 0.0 {
            return Err(PricingError::invalid("original_price must be positive"));
        }
        if !self.market_trend.is_finite()
            || !self.seasonal_factor.is_finite()
            || !self.category_demand.is_finite()
        {
            return Err(PricingError::invalid("market features must be finite"));
        }
        Ok(())
    }

    pub fn avg_competitor_price(&self) -> Option<f64> {
        if self.competitor_prices.is_empty() {
            return None;
        }
        Some(self.competitor_prices.iter().sum::<f64>() / self.competitor_prices.len() as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RlState {
    pub listing_id: String,
    pub features: RlFeatures,
    pub state_hash: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Increase,
    Decrease,
    Maintain,
}

impl ActionType {
    pub const ALL: [ActionType; 3] =
        [ActionType::Increase, ActionType::Decrease, ActionType::Maintain];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Increase => "increase",
            ActionType::Decrease => "decrease",
            ActionType::Maintain => "maintain",
        }
    }
}

impl FromStr for ActionType {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "increase" => Ok(ActionType::Increase),
            "decrease" => Ok(ActionType::Decrease),
            "maintain" => Ok(ActionType::Maintain),
            other => Err(PricingError::invalid(format!("unknown action type '{other}'"))),
        }
    }
}

/// A price adjustment. The magnitude is continuous, so two actions of the
/// same type with different magnitudes are different Q-table keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceAction {
    pub action_type: ActionType,
    pub magnitude: f64,
}

impl PriceAction {
    /// Key used for the `(state_hash, action)` row identity.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Relative price change implied by the action.
    pub fn price_change(&self) -> f64 {
        match self.action_type {
            ActionType::Increase => self.magnitude,
            ActionType::Decrease => -self.magnitude,
            ActionType::Maintain => 0.0,
        }
    }
}

impl fmt::Display for PriceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action_type.as_str(), self.magnitude)
    }
}

impl FromStr for PriceAction {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, magnitude) = s
            .split_once(':')
            .ok_or_else(|| PricingError::invalid(format!("malformed action key '{s}'")))?;
        let action_type = kind.parse()?;
        let magnitude: f64 = magnitude
            .parse()
            .map_err(|_| PricingError::invalid(format!("malformed action magnitude in '{s}'")))?;
        if !magnitude.is_finite() || !(0.0..=1.0).contains(&magnitude) {
            return Err(PricingError::invalid(format!(
                "action magnitude out of range in '{s}'"
            )));
        }
        Ok(Self {
            action_type,
            magnitude,
        })
    }
}

/// Reward components observed after applying an action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Reward {
    pub immediate: f64,
    pub delayed: f64,
    pub total: f64,
}

impl Reward {
    pub fn new(immediate: f64, delayed: f64, delayed_weight: f64) -> Self {
        Self {
            immediate,
            delayed,
            total: immediate + delayed_weight * delayed,
        }
    }

    pub fn validate(&self) -> PricingResult<()> {
        if !self.immediate.is_finite() || !self.delayed.is_finite() || !self.total.is_finite() {
            return Err(PricingError::invalid("reward components must be finite"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QValue {
    pub state_hash: String,
    pub action: String,
    pub q_value: f64,
    pub visit_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// A state observed for a listing together with the action chosen for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub listing_id: String,
    pub state: RlState,
    pub action: PriceAction,
    pub reward: Option<Reward>,
    pub next_state: Option<RlState>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub state: RlState,
    pub action: PriceAction,
    pub reward: Reward,
    pub next_state: RlState,
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_config_tagged() {
        let json = r#"{"kind": "fixed_discount", "percent": 10.0}"#;
        let config: StrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, StrategyConfig::FixedDiscount { percent: 10.0 });
        assert!(config.validate().is_ok());

        let unknown = r#"{"kind": "mystery", "percent": 10.0}"#;
        assert!(serde_json::from_str::<StrategyConfig>(unknown).is_err());
    }

    #[test]
    fn test_strategy_config_validation() {
        assert!(StrategyConfig::FixedDiscount { percent: 0.0 }.validate().is_err());
        assert!(StrategyConfig::FixedDiscount { percent: 150.0 }.validate().is_err());
        assert!(StrategyConfig::CompetitorMatch { offset_percent: -5.0 }
            .validate()
            .is_ok());
        assert!(StrategyConfig::DynamicMarkup {
            min_margin: 0.3,
            max_markup: 0.1
        }
        .validate()
        .is_err());
        assert!(StrategyConfig::Hold.validate().is_ok());
    }

    #[test]
    fn test_price_action_key_parses_back() {
        let action = PriceAction {
            action_type: ActionType::Decrease,
            magnitude: 0.137_452_118,
        };
        let parsed: PriceAction = action.key().parse().unwrap();
        assert_eq!(parsed, action);
        assert_eq!(action.price_change(), -0.137_452_118);
    }

    #[test]
    fn test_price_action_rejects_unknown_shapes() {
        assert!("raise:0.1".parse::<PriceAction>().is_err());
        assert!("increase".parse::<PriceAction>().is_err());
        assert!("increase:abc".parse::<PriceAction>().is_err());
        assert!("increase:-0.5".parse::<PriceAction>().is_err());
    }

    #[test]
    fn test_distinct_magnitudes_are_distinct_keys() {
        let a = PriceAction {
            action_type: ActionType::Increase,
            magnitude: 0.1,
        };
        let b = PriceAction {
            action_type: ActionType::Increase,
            magnitude: 0.1000001,
        };
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_reward_total_and_validation() {
        let reward = Reward::new(0.4, 0.1, 0.5);
        assert!((reward.total - 0.45).abs() < 1e-12);
        assert!(reward.validate().is_ok());

        let bad = Reward {
            immediate: f64::NAN,
            delayed: 0.0,
            total: 0.0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_experiment_type_serialized_as_type() {
        let exp = Experiment {
            id: Uuid::new_v4(),
            user_id: "seller-1".into(),
            name: "spring".into(),
            experiment_type: ExperimentType::MultiArmedBandit,
            strategies: vec![],
            allocation_method: AllocationMethod::ThompsonSampling,
            success_metric: SuccessMetric::Revenue,
            confidence_threshold: 0.95,
            min_sample_size: 100,
            max_duration_days: 30,
            status: ExperimentStatus::Draft,
            start_date: None,
            end_date: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&exp).unwrap();
        assert_eq!(json["type"], "multi_armed_bandit");
        assert_eq!(json["allocation_method"], "thompson_sampling");
        assert_eq!(json["status"], "draft");
    }
}
