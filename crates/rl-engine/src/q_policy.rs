//! Tabular Q-learning over the price-adjustment action space.
//!
//! The Q-table and the per-listing state log are injected repositories.
//! Updates are a plain read-modify-write: two concurrent updates to the same
//! `(state_hash, action)` row are last-writer-wins.

use crate::state_encoder::StateEncoder;
use chrono::Utc;
use pricing_core::config::QLearningConfig;
use pricing_core::error::{ErrorKind, PricingError, PricingResult};
use pricing_core::store::{QTableRepository, StateLog};
use pricing_core::types::{
    ActionType, PriceAction, QValue, Reward, RlFeatures, RlState, StateRecord,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDecision {
    pub state_hash: String,
    pub action: PriceAction,
    pub expected_reward: f64,
    pub state_value: f64,
    /// Softmax over the known rows for this state, keyed by action key.
    pub action_probabilities: BTreeMap<String, f64>,
    pub explored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QUpdate {
    pub state_hash: String,
    pub action: String,
    pub previous_q: f64,
    pub updated_q: f64,
    pub max_next_q: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRecorded {
    pub success: bool,
    pub update: QUpdate,
}

pub struct QPolicy {
    q_table: Arc<dyn QTableRepository>,
    states: Arc<dyn StateLog>,
    config: QLearningConfig,
}

impl QPolicy {
    pub fn new(
        q_table: Arc<dyn QTableRepository>,
        states: Arc<dyn StateLog>,
        config: QLearningConfig,
    ) -> Self {
        Self {
            q_table,
            states,
            config,
        }
    }

    pub fn config(&self) -> &QLearningConfig {
        &self.config
    }

    pub fn random_action(&self, rng: &mut impl Rng) -> PriceAction {
        let action_type = ActionType::ALL[rng.gen_range(0..ActionType::ALL.len())];
        PriceAction {
            action_type,
            magnitude: rng.gen_range(0.0..=self.config.max_magnitude),
        }
    }

    /// Choose an action for `state`. Explores with probability
    /// `exploration_rate` when `exploration_mode` is set, and always when the
    /// state has no rows yet.
    pub fn get_action(
        &self,
        state: &RlState,
        exploration_mode: bool,
        rng: &mut impl Rng,
    ) -> PricingResult<ActionDecision> {
        let rows = self.q_table.q_values(&state.state_hash)?;
        let explore = exploration_mode && rng.gen::<f64>() < self.config.exploration_rate;

        let state_value = max_q(&rows).unwrap_or(0.0);
        let action_probabilities = softmax(&rows, self.config.softmax_temperature);

        if explore || rows.is_empty() {
            let action = self.random_action(rng);
            let key = action.key();
            let expected_reward = rows
                .iter()
                .find(|r| r.action == key)
                .map(|r| r.q_value)
                .unwrap_or(0.0);
            return Ok(ActionDecision {
                state_hash: state.state_hash.clone(),
                action,
                expected_reward,
                state_value,
                action_probabilities,
                explored: true,
            });
        }

        let best = best_row(&rows).ok_or_else(|| {
            PricingError::Internal(anyhow::anyhow!("no best row for non-empty state"))
        })?;
        Ok(ActionDecision {
            state_hash: state.state_hash.clone(),
            action: best.action.parse()?,
            expected_reward: best.q_value,
            state_value,
            action_probabilities,
            explored: false,
        })
    }

    /// Surface operation: pick an action for a listing and remember the
    /// state so a later reward can be attributed to it.
    pub fn next_action(
        &self,
        listing_id: &str,
        features: RlFeatures,
        exploration_mode: bool,
        rng: &mut impl Rng,
    ) -> PricingResult<ActionDecision> {
        features.validate()?;
        let state = StateEncoder::encode(listing_id, features);
        let decision = self
            .get_action(&state, exploration_mode, rng)
            .inspect_err(|e| log_failure(e, listing_id, "action selection failed"))?;

        self.states
            .append_state(StateRecord {
                listing_id: listing_id.to_string(),
                state,
                action: decision.action,
                reward: None,
                next_state: None,
                recorded_at: Utc::now(),
            })
            .inspect_err(|e| log_failure(e, listing_id, "state log append failed"))?;

        metrics::counter!("rl.actions.selected").increment(1);
        debug!(
            listing_id,
            state_hash = %decision.state_hash,
            action = %decision.action,
            explored = decision.explored,
            "action selected"
        );
        Ok(decision)
    }

    /// ε-greedy selection used during simulated training.
    pub fn epsilon_greedy(
        &self,
        state: &RlState,
        epsilon: f64,
        rng: &mut impl Rng,
    ) -> PricingResult<PriceAction> {
        if rng.gen::<f64>() < epsilon {
            return Ok(self.random_action(rng));
        }
        let rows = self.q_table.q_values(&state.state_hash)?;
        match best_row(&rows) {
            Some(row) => row.action.parse(),
            None => Ok(self.random_action(rng)),
        }
    }

    pub fn table_size(&self) -> PricingResult<usize> {
        self.q_table.q_table_size()
    }

    /// max_a Q(s, a), 0 when the state has no rows.
    pub fn state_value(&self, state_hash: &str) -> PricingResult<f64> {
        Ok(max_q(&self.q_table.q_values(state_hash)?).unwrap_or(0.0))
    }

    /// Q(s,a) ← Q(s,a) + α·(r + γ·max_a' Q(s',a') − Q(s,a)). A missing next
    /// state (terminal) contributes 0.
    pub fn update(
        &self,
        state_hash: &str,
        action: &PriceAction,
        reward: f64,
        next_state_hash: Option<&str>,
        learning_rate: f64,
        discount_factor: f64,
    ) -> PricingResult<QUpdate> {
        let key = action.key();
        let previous_q = self
            .q_table
            .q_value(state_hash, &key)?
            .map(|r| r.q_value)
            .unwrap_or(0.0);
        let max_next_q = match next_state_hash {
            Some(hash) => self.state_value(hash)?,
            None => 0.0,
        };

        let updated_q =
            previous_q + learning_rate * (reward + discount_factor * max_next_q - previous_q);
        self.q_table.upsert_q_value(state_hash, &key, updated_q)?;
        metrics::counter!("rl.q_updates").increment(1);

        Ok(QUpdate {
            state_hash: state_hash.to_string(),
            action: key,
            previous_q,
            updated_q,
            max_next_q,
        })
    }

    /// Surface operation: attach a reward to the listing's most recent state
    /// and apply the Q-update for the action chosen there.
    pub fn record_reward(
        &self,
        listing_id: &str,
        reward: Reward,
        next_features: Option<RlFeatures>,
    ) -> PricingResult<RewardRecorded> {
        reward.validate()?;
        if let Some(features) = &next_features {
            features.validate()?;
        }

        let mut record = self
            .states
            .latest_state(listing_id)
            .inspect_err(|e| log_failure(e, listing_id, "state log lookup failed"))?
            .ok_or_else(|| {
                PricingError::not_found(format!("no recorded state for listing {listing_id}"))
            })?;

        let next_state = next_features.map(|f| StateEncoder::encode(listing_id, f));
        let update = self
            .update(
                &record.state.state_hash,
                &record.action,
                reward.total,
                next_state.as_ref().map(|s| s.state_hash.as_str()),
                self.config.learning_rate,
                self.config.discount_factor,
            )
            .inspect_err(|e| log_failure(e, listing_id, "q-value update failed"))?;

        record.reward = Some(reward);
        record.next_state = next_state;
        self.states
            .replace_latest(record)
            .inspect_err(|e| log_failure(e, listing_id, "state log update failed"))?;

        info!(
            listing_id,
            state_hash = %update.state_hash,
            action = %update.action,
            previous_q = update.previous_q,
            updated_q = update.updated_q,
            "reward recorded"
        );
        Ok(RewardRecorded {
            success: true,
            update,
        })
    }
}

/// Internal failures are logged with the listing they concern; caller
/// errors are left to the caller.
pub(crate) fn log_failure(err: &PricingError, listing_id: &str, message: &str) {
    if err.kind() == ErrorKind::Internal {
        error!(listing_id, error = %err, "{message}");
    }
}

fn max_q(rows: &[QValue]) -> Option<f64> {
    rows.iter().map(|r| r.q_value).reduce(f64::max)
}

fn best_row(rows: &[QValue]) -> Option<&QValue> {
    let mut best: Option<&QValue> = None;
    for row in rows {
        if best.map_or(true, |b| row.q_value > b.q_value) {
            best = Some(row);
        }
    }
    best
}

fn softmax(rows: &[QValue], temperature: f64) -> BTreeMap<String, f64> {
    let Some(max) = max_q(rows) else {
        return BTreeMap::new();
    };
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    let weights: Vec<f64> = rows.iter().map(|r| ((r.q_value - max) / t).exp()).collect();
    let total: f64 = weights.iter().sum();
    rows.iter()
        .zip(weights)
        .map(|(r, w)| (r.action.clone(), w / total))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricing_core::store::InMemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> (Arc<InMemoryStore>, QPolicy) {
        let store = Arc::new(InMemoryStore::new());
        let policy = QPolicy::new(store.clone(), store.clone(), QLearningConfig::default());
        (store, policy)
    }

    fn features(price: f64) -> RlFeatures {
        RlFeatures {
            current_price: price,
            original_price: 40.0,
            price_history: vec![],
            views: 30,
            watchers: 2,
            competitor_prices: vec![35.0, 38.0],
            market_trend: 0.0,
            seasonal_factor: 1.0,
            days_since_listing: 5,
            category_demand: 0.1,
        }
    }

    fn action(kind: ActionType, magnitude: f64) -> PriceAction {
        PriceAction {
            action_type: kind,
            magnitude,
        }
    }

    #[test]
    fn test_empty_table_returns_random_valid_action() {
        let (_, policy) = policy();
        let mut rng = StdRng::seed_from_u64(1);
        let state = StateEncoder::encode("l1", features(30.0));
        for _ in 0..200 {
            let d = policy.get_action(&state, false, &mut rng).unwrap();
            assert!(d.explored);
            assert!(ActionType::ALL.contains(&d.action.action_type));
            assert!((0.0..=0.2).contains(&d.action.magnitude));
            assert_eq!(d.state_value, 0.0);
            assert!(d.action_probabilities.is_empty());
        }
    }

    #[test]
    fn test_greedy_picks_max_row_with_softmax() {
        let (store, policy) = policy();
        let state = StateEncoder::encode("l1", features(30.0));
        let good = action(ActionType::Decrease, 0.05);
        let bad = action(ActionType::Increase, 0.15);
        store.upsert_q_value(&state.state_hash, &bad.key(), -0.2).unwrap();
        store.upsert_q_value(&state.state_hash, &good.key(), 0.4).unwrap();

        let mut rng = StdRng::seed_from_u64(2);
        let d = policy.get_action(&state, false, &mut rng).unwrap();
        assert!(!d.explored);
        assert_eq!(d.action, good);
        assert_eq!(d.expected_reward, 0.4);
        assert_eq!(d.state_value, 0.4);

        let total: f64 = d.action_probabilities.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(d.action_probabilities[&good.key()] > d.action_probabilities[&bad.key()]);
        let expected = 1.0 / (1.0 + (-0.6f64).exp());
        assert!((d.action_probabilities[&good.key()] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_update_is_noop_only_at_zero() {
        let (_, policy) = policy();
        let a = action(ActionType::Maintain, 0.0);
        let u = policy.update("s0", &a, 0.0, None, 0.1, 0.95).unwrap();
        assert_eq!(u.previous_q, 0.0);
        assert_eq!(u.updated_q, 0.0);
    }

    #[test]
    fn test_update_moves_toward_target() {
        let (store, policy) = policy();
        let a = action(ActionType::Increase, 0.1);
        store.upsert_q_value("next", "maintain:0", 0.5).unwrap();

        let u = policy.update("s1", &a, 0.2, Some("next"), 0.1, 0.95).unwrap();
        let target = 0.2 + 0.95 * 0.5;
        assert_eq!(u.max_next_q, 0.5);
        assert!(u.updated_q > 0.0 && u.updated_q < target);
        assert!((u.updated_q - 0.1 * target).abs() < 1e-12);

        let again = policy.update("s1", &a, 0.2, Some("next"), 0.1, 0.95).unwrap();
        assert!(again.updated_q > u.updated_q && again.updated_q < target);
        let row = store.q_value("s1", &a.key()).unwrap().unwrap();
        assert_eq!(row.visit_count, 2);
    }

    #[test]
    fn test_record_reward_applies_q_update() {
        let (store, policy) = policy();
        let mut rng = StdRng::seed_from_u64(3);
        let decision = policy.next_action("l1", features(30.0), false, &mut rng).unwrap();

        let reward = Reward {
            immediate: 1.0,
            delayed: 0.0,
            total: 1.0,
        };
        let recorded = policy.record_reward("l1", reward, None).unwrap();
        assert!(recorded.success);
        assert!((recorded.update.updated_q - 0.1).abs() < 1e-12);
        assert_eq!(recorded.update.action, decision.action.key());

        let latest = store.latest_state("l1").unwrap().unwrap();
        assert_eq!(latest.reward, Some(reward));
        assert!(latest.next_state.is_none());
    }

    #[test]
    fn test_record_reward_with_next_state_uses_its_value() {
        let (store, policy) = policy();
        let mut rng = StdRng::seed_from_u64(4);
        policy.next_action("l1", features(30.0), false, &mut rng).unwrap();

        let next = StateEncoder::encode("l1", features(31.0));
        store.upsert_q_value(&next.state_hash, "decrease:0.1", 1.0).unwrap();

        let reward = Reward::new(0.0, 0.0, 0.5);
        let recorded = policy.record_reward("l1", reward, Some(features(31.0))).unwrap();
        assert_eq!(recorded.update.max_next_q, 1.0);
        assert!((recorded.update.updated_q - 0.095).abs() < 1e-12);
        assert!(store.latest_state("l1").unwrap().unwrap().next_state.is_some());
    }

    #[test]
    fn test_record_reward_unknown_listing() {
        let (_, policy) = policy();
        let err = policy
            .record_reward("ghost", Reward::new(1.0, 0.0, 0.5), None)
            .unwrap_err();
        assert!(matches!(err, PricingError::NotFound(_)));
    }

    #[test]
    fn test_next_action_rejects_bad_features() {
        let (_, policy) = policy();
        let mut rng = StdRng::seed_from_u64(5);
        let mut f = features(30.0);
        f.current_price = -1.0;
        let err = policy.next_action("l1", f, true, &mut rng).unwrap_err();
        assert!(matches!(err, PricingError::InvalidArgument(_)));
    }

    /// Q-table whose reads fail, for exercising the internal error path.
    struct UnavailableTable;

    impl QTableRepository for UnavailableTable {
        fn q_values(&self, _state_hash: &str) -> PricingResult<Vec<QValue>> {
            Err(anyhow::anyhow!("q-table unavailable").into())
        }

        fn q_value(&self, _state_hash: &str, _action: &str) -> PricingResult<Option<QValue>> {
            Err(anyhow::anyhow!("q-table unavailable").into())
        }

        fn upsert_q_value(
            &self,
            _state_hash: &str,
            _action: &str,
            _q_value: f64,
        ) -> PricingResult<QValue> {
            Err(anyhow::anyhow!("q-table unavailable").into())
        }

        fn q_table_size(&self) -> PricingResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_q_table_failure_surfaces_as_internal() {
        let store = Arc::new(InMemoryStore::new());
        let policy = QPolicy::new(
            Arc::new(UnavailableTable),
            store.clone(),
            QLearningConfig::default(),
        );
        let mut rng = StdRng::seed_from_u64(6);

        let err = policy.next_action("l1", features(30.0), false, &mut rng).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        // Nothing is logged for a decision that was never made.
        assert!(store.latest_state("l1").unwrap().is_none());

        store
            .append_state(StateRecord {
                listing_id: "l1".into(),
                state: StateEncoder::encode("l1", features(30.0)),
                action: action(ActionType::Maintain, 0.0),
                reward: None,
                next_state: None,
                recorded_at: Utc::now(),
            })
            .unwrap();
        let err = policy
            .record_reward("l1", Reward::new(1.0, 0.0, 0.5), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(store.latest_state("l1").unwrap().unwrap().reward.is_none());
    }
}
