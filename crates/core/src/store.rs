//! Repository seams for listings, experiments, outcomes and learned policy
//! state, plus an in-memory implementation backed by DashMap.
//!
//! Production: implement the traits over PostgreSQL or similar. The
//! in-memory store provides the same API surface for development and tests.

use crate::error::PricingResult;
use crate::types::*;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use tracing::{debug, info};
use uuid::Uuid;

/// Source of listing feature snapshots.
pub trait ListingProvider: Send + Sync {
    /// Active listings matching the filter, most recently updated first.
    fn eligible_listings(&self, filter: &ListingFilter) -> PricingResult<Vec<ListingSnapshot>>;
    fn get_listing(&self, listing_id: &str) -> PricingResult<Option<ListingSnapshot>>;
}

pub trait ExperimentRepository: Send + Sync {
    /// Persist an experiment with its arms and initial assignments in one
    /// step. Assignments whose `(experiment_id, listing_id)` already exists
    /// are skipped. Returns the number of assignments inserted.
    fn create_experiment(
        &self,
        experiment: Experiment,
        arms: Vec<BanditArm>,
        assignments: Vec<ExperimentAssignment>,
    ) -> PricingResult<usize>;
    fn get_experiment(&self, id: &Uuid) -> PricingResult<Option<Experiment>>;
    /// Store `experiment` only if the stored row is still in `expected`
    /// status. Returns `false` when the row is missing or has already moved
    /// on, in which case nothing is written.
    fn transition_status(
        &self,
        experiment: &Experiment,
        expected: ExperimentStatus,
    ) -> PricingResult<bool>;
    /// Experiments owned by `user_id`, newest first.
    fn list_experiments(&self, user_id: &str) -> PricingResult<Vec<Experiment>>;
    fn list_by_status(&self, status: ExperimentStatus) -> PricingResult<Vec<Experiment>>;
    /// Arms in strategy order.
    fn arms(&self, experiment_id: &Uuid) -> PricingResult<Vec<BanditArm>>;
    fn update_arm(&self, arm: &BanditArm) -> PricingResult<()>;
    /// Returns `false` when the listing is already assigned to the experiment.
    fn insert_assignment(&self, assignment: ExperimentAssignment) -> PricingResult<bool>;
    fn assignments(&self, experiment_id: &Uuid) -> PricingResult<Vec<ExperimentAssignment>>;
    fn assignment(
        &self,
        experiment_id: &Uuid,
        listing_id: &str,
    ) -> PricingResult<Option<ExperimentAssignment>>;
}

pub trait OutcomeRepository: Send + Sync {
    fn record_outcome(&self, outcome: ListingOutcome) -> PricingResult<()>;
    fn outcomes(&self, experiment_id: &Uuid) -> PricingResult<Vec<ListingOutcome>>;
}

/// Q-table rows keyed by `(state_hash, action)`. Rows are never deleted.
pub trait QTableRepository: Send + Sync {
    /// Rows for a state in insertion order.
    fn q_values(&self, state_hash: &str) -> PricingResult<Vec<QValue>>;
    fn q_value(&self, state_hash: &str, action: &str) -> PricingResult<Option<QValue>>;
    /// Insert with `visit_count = 1`, or overwrite the value and bump
    /// `visit_count`.
    fn upsert_q_value(&self, state_hash: &str, action: &str, q_value: f64)
        -> PricingResult<QValue>;
    fn q_table_size(&self) -> PricingResult<usize>;
}

/// Per-listing log of observed states and the actions chosen for them.
pub trait StateLog: Send + Sync {
    fn append_state(&self, record: StateRecord) -> PricingResult<()>;
    fn latest_state(&self, listing_id: &str) -> PricingResult<Option<StateRecord>>;
    fn replace_latest(&self, record: StateRecord) -> PricingResult<()>;
}

/// Thread-safe in-memory store implementing every repository trait.
pub struct InMemoryStore {
    listings: DashMap<String, ListingSnapshot>,
    experiments: DashMap<Uuid, Experiment>,
    arms: DashMap<Uuid, Vec<BanditArm>>,
    assignments: DashMap<Uuid, Vec<ExperimentAssignment>>,
    outcomes: DashMap<Uuid, Vec<ListingOutcome>>,
    q_table: DashMap<(String, String), QValue>,
    q_index: DashMap<String, Vec<String>>,
    states: DashMap<String, Vec<StateRecord>>,
    create_lock: Mutex<()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("Pricing store initialized (in-memory, development mode)");
        Self {
            listings: DashMap::new(),
            experiments: DashMap::new(),
            arms: DashMap::new(),
            assignments: DashMap::new(),
            outcomes: DashMap::new(),
            q_table: DashMap::new(),
            q_index: DashMap::new(),
            states: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn upsert_listing(&self, listing: ListingSnapshot) {
        self.listings.insert(listing.id.clone(), listing);
    }

    pub fn listing_count(&self) -> usize {
        self.listings.len()
    }

    fn push_assignment(&self, assignment: ExperimentAssignment) -> bool {
        let mut entry = self.assignments.entry(assignment.experiment_id).or_default();
        if entry.iter().any(|a| a.listing_id == assignment.listing_id) {
            return false;
        }
        entry.push(assignment);
        true
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingProvider for InMemoryStore {
    fn eligible_listings(&self, filter: &ListingFilter) -> PricingResult<Vec<ListingSnapshot>> {
        let mut listings: Vec<ListingSnapshot> = self
            .listings
            .iter()
            .map(|r| r.value().clone())
            .filter(|l| l.status == ListingStatus::Active)
            .filter(|l| {
                filter
                    .category_id
                    .as_ref()
                    .map_or(true, |c| l.category_id.as_ref() == Some(c))
            })
            .filter(|l| {
                filter
                    .brand
                    .as_ref()
                    .map_or(true, |b| l.brand.as_ref() == Some(b))
            })
            .collect();
        listings.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if filter.limit > 0 {
            listings.truncate(filter.limit);
        }
        Ok(listings)
    }

    fn get_listing(&self, listing_id: &str) -> PricingResult<Option<ListingSnapshot>> {
        Ok(self.listings.get(listing_id).map(|r| r.value().clone()))
    }
}

impl ExperimentRepository for InMemoryStore {
    fn create_experiment(
        &self,
        experiment: Experiment,
        arms: Vec<BanditArm>,
        assignments: Vec<ExperimentAssignment>,
    ) -> PricingResult<usize> {
        let _guard = self.create_lock.lock();
        let id = experiment.id;
        self.experiments.insert(id, experiment);
        self.arms.insert(id, arms);
        let inserted = assignments
            .into_iter()
            .filter(|a| self.push_assignment(a.clone()))
            .count();
        debug!(experiment_id = %id, inserted, "experiment persisted");
        Ok(inserted)
    }

    fn get_experiment(&self, id: &Uuid) -> PricingResult<Option<Experiment>> {
        Ok(self.experiments.get(id).map(|r| r.value().clone()))
    }

    fn transition_status(
        &self,
        experiment: &Experiment,
        expected: ExperimentStatus,
    ) -> PricingResult<bool> {
        let Some(mut row) = self.experiments.get_mut(&experiment.id) else {
            return Ok(false);
        };
        if row.status != expected {
            debug!(
                experiment_id = %experiment.id,
                status = ?row.status,
                expected = ?expected,
                "status transition lost"
            );
            return Ok(false);
        }
        *row = experiment.clone();
        Ok(true)
    }

    fn list_experiments(&self, user_id: &str) -> PricingResult<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|r| r.value().user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        experiments.sort_by_key(|e| Reverse(e.created_at));
        Ok(experiments)
    }

    fn list_by_status(&self, status: ExperimentStatus) -> PricingResult<Vec<Experiment>> {
        Ok(self
            .experiments
            .iter()
            .filter(|r| r.value().status == status)
            .map(|r| r.value().clone())
            .collect())
    }

    fn arms(&self, experiment_id: &Uuid) -> PricingResult<Vec<BanditArm>> {
        Ok(self
            .arms
            .get(experiment_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    fn update_arm(&self, arm: &BanditArm) -> PricingResult<()> {
        if let Some(mut arms) = self.arms.get_mut(&arm.experiment_id) {
            if let Some(slot) = arms.iter_mut().find(|a| a.arm_id == arm.arm_id) {
                *slot = arm.clone();
            }
        }
        Ok(())
    }

    fn insert_assignment(&self, assignment: ExperimentAssignment) -> PricingResult<bool> {
        Ok(self.push_assignment(assignment))
    }

    fn assignments(&self, experiment_id: &Uuid) -> PricingResult<Vec<ExperimentAssignment>> {
        Ok(self
            .assignments
            .get(experiment_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    fn assignment(
        &self,
        experiment_id: &Uuid,
        listing_id: &str,
    ) -> PricingResult<Option<ExperimentAssignment>> {
        Ok(self.assignments.get(experiment_id).and_then(|r| {
            r.value()
                .iter()
                .find(|a| a.listing_id == listing_id)
                .cloned()
        }))
    }
}

impl OutcomeRepository for InMemoryStore {
    fn record_outcome(&self, outcome: ListingOutcome) -> PricingResult<()> {
        self.outcomes
            .entry(outcome.experiment_id)
            .or_default()
            .push(outcome);
        Ok(())
    }

    fn outcomes(&self, experiment_id: &Uuid) -> PricingResult<Vec<ListingOutcome>> {
        Ok(self
            .outcomes
            .get(experiment_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}

impl QTableRepository for InMemoryStore {
    fn q_values(&self, state_hash: &str) -> PricingResult<Vec<QValue>> {
        let actions = match self.q_index.get(state_hash) {
            Some(r) => r.value().clone(),
            None => return Ok(Vec::new()),
        };
        Ok(actions
            .into_iter()
            .filter_map(|action| {
                self.q_table
                    .get(&(state_hash.to_string(), action))
                    .map(|r| r.value().clone())
            })
            .collect())
    }

    fn q_value(&self, state_hash: &str, action: &str) -> PricingResult<Option<QValue>> {
        Ok(self
            .q_table
            .get(&(state_hash.to_string(), action.to_string()))
            .map(|r| r.value().clone()))
    }

    fn upsert_q_value(
        &self,
        state_hash: &str,
        action: &str,
        q_value: f64,
    ) -> PricingResult<QValue> {
        let now = Utc::now();
        let key = (state_hash.to_string(), action.to_string());
        let mut inserted = false;
        let row = self
            .q_table
            .entry(key)
            .and_modify(|row| {
                row.q_value = q_value;
                row.visit_count += 1;
                row.last_updated = now;
            })
            .or_insert_with(|| {
                inserted = true;
                QValue {
                    state_hash: state_hash.to_string(),
                    action: action.to_string(),
                    q_value,
                    visit_count: 1,
                    last_updated: now,
                }
            })
            .value()
            .clone();
        if inserted {
            self.q_index
                .entry(state_hash.to_string())
                .or_default()
                .push(action.to_string());
        }
        Ok(row)
    }

    fn q_table_size(&self) -> PricingResult<usize> {
        Ok(self.q_table.len())
    }
}

impl StateLog for InMemoryStore {
    fn append_state(&self, record: StateRecord) -> PricingResult<()> {
        self.states
            .entry(record.listing_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn latest_state(&self, listing_id: &str) -> PricingResult<Option<StateRecord>> {
        Ok(self
            .states
            .get(listing_id)
            .and_then(|r| r.value().last().cloned()))
    }

    fn replace_latest(&self, record: StateRecord) -> PricingResult<()> {
        let mut entry = self.states.entry(record.listing_id.clone()).or_default();
        match entry.last_mut() {
            Some(last) => *last = record,
            None => entry.push(record),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn listing(id: &str, category: &str, age_mins: i64, status: ListingStatus) -> ListingSnapshot {
        let now = Utc::now();
        ListingSnapshot {
            id: id.to_string(),
            user_id: "seller-1".into(),
            category_id: Some(category.to_string()),
            brand: None,
            status,
            current_price: 20.0,
            original_price: 25.0,
            views: 10,
            watchers: 1,
            competitor_prices: vec![19.0, 22.0],
            price_history: vec![],
            listed_at: now - Duration::days(3),
            updated_at: now - Duration::minutes(age_mins),
        }
    }

    fn assignment(exp: Uuid, listing: &str) -> ExperimentAssignment {
        ExperimentAssignment {
            experiment_id: exp,
            listing_id: listing.to_string(),
            strategy_id: "a".into(),
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn test_eligible_listings_filter_and_order() {
        let store = InMemoryStore::new();
        store.upsert_listing(listing("old", "shoes", 30, ListingStatus::Active));
        store.upsert_listing(listing("new", "shoes", 1, ListingStatus::Active));
        store.upsert_listing(listing("sold", "shoes", 0, ListingStatus::Sold));
        store.upsert_listing(listing("other", "bags", 0, ListingStatus::Active));

        let filter = ListingFilter {
            category_id: Some("shoes".into()),
            brand: None,
            limit: 10,
        };
        let ids: Vec<String> = store
            .eligible_listings(&filter)
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);

        let capped = ListingFilter {
            limit: 1,
            ..Default::default()
        };
        assert_eq!(store.eligible_listings(&capped).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_assignment_is_skipped() {
        let store = InMemoryStore::new();
        let exp = Uuid::new_v4();
        assert!(store.insert_assignment(assignment(exp, "l1")).unwrap());
        assert!(!store.insert_assignment(assignment(exp, "l1")).unwrap());
        assert!(store.insert_assignment(assignment(Uuid::new_v4(), "l1")).unwrap());
        assert_eq!(store.assignments(&exp).unwrap().len(), 1);
    }

    fn experiment(status: ExperimentStatus) -> Experiment {
        let now = Utc::now();
        Experiment {
            id: Uuid::new_v4(),
            user_id: "seller-1".into(),
            name: "markdown".into(),
            experiment_type: ExperimentType::AbTest,
            strategies: vec![],
            allocation_method: AllocationMethod::Equal,
            success_metric: SuccessMetric::Revenue,
            confidence_threshold: 0.95,
            min_sample_size: 10,
            max_duration_days: 14,
            status,
            start_date: Some(now),
            end_date: Some(now + Duration::days(14)),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_transition_status_applies_once() {
        let store = InMemoryStore::new();
        let active = experiment(ExperimentStatus::Active);
        store.create_experiment(active.clone(), vec![], vec![]).unwrap();

        let mut done = active.clone();
        done.status = ExperimentStatus::Completed;
        assert!(store.transition_status(&done, ExperimentStatus::Active).unwrap());
        assert!(!store.transition_status(&done, ExperimentStatus::Active).unwrap());

        let stored = store.get_experiment(&active.id).unwrap().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Completed);

        let missing = experiment(ExperimentStatus::Completed);
        assert!(!store.transition_status(&missing, ExperimentStatus::Active).unwrap());
        assert!(store.get_experiment(&missing.id).unwrap().is_none());
    }

    #[test]
    fn test_q_upsert_counts_visits() {
        let store = InMemoryStore::new();
        let first = store.upsert_q_value("abc", "increase:0.1", 0.5).unwrap();
        assert_eq!(first.visit_count, 1);
        let second = store.upsert_q_value("abc", "increase:0.1", 0.7).unwrap();
        assert_eq!(second.visit_count, 2);
        assert_eq!(second.q_value, 0.7);
        store.upsert_q_value("abc", "maintain:0", 0.1).unwrap();

        let rows = store.q_values("abc").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "increase:0.1");
        assert_eq!(store.q_table_size().unwrap(), 2);
        assert!(store.q_values("missing").unwrap().is_empty());
    }
}
