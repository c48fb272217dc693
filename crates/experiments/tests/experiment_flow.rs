//! End-to-end experiment lifecycle against the in-memory store: create,
//! allocate, start, record outcomes, evaluate and expire.

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use pricing_core::config::{BanditConfig, SignificanceConfig};
    use pricing_core::event_bus::capture_sink;
    use pricing_core::store::{ExperimentRepository, InMemoryStore};
    use pricing_core::types::*;
    use pricing_experiments::{CreateExperimentRequest, ExperimentManager, OutcomeMeasurement};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    const SELLER: &str = "seller-42";

    fn seed_listings(store: &InMemoryStore, n: usize) {
        let now = Utc::now();
        for i in 0..n {
            store.upsert_listing(ListingSnapshot {
                id: format!("sku-{i:03}"),
                user_id: SELLER.into(),
                category_id: Some(if i % 2 == 0 { "shoes" } else { "bags" }.into()),
                brand: Some("acme".into()),
                status: ListingStatus::Active,
                current_price: 30.0 + i as f64,
                original_price: 40.0 + i as f64,
                views: 100,
                watchers: 5,
                competitor_prices: vec![35.0],
                price_history: vec![],
                listed_at: now - Duration::days(20),
                updated_at: now - Duration::seconds(i as i64),
            });
        }
        store.upsert_listing(ListingSnapshot {
            id: "sold-item".into(),
            user_id: SELLER.into(),
            category_id: Some("shoes".into()),
            brand: None,
            status: ListingStatus::Sold,
            current_price: 10.0,
            original_price: 10.0,
            views: 0,
            watchers: 0,
            competitor_prices: vec![],
            price_history: vec![],
            listed_at: now,
            updated_at: now,
        });
    }

    fn strategy(id: &str, config: StrategyConfig) -> Strategy {
        Strategy {
            id: id.into(),
            name: id.replace('_', " "),
            config,
        }
    }

    fn request(method: AllocationMethod, category: Option<&str>) -> CreateExperimentRequest {
        CreateExperimentRequest {
            user_id: SELLER.into(),
            name: "autumn pricing".into(),
            experiment_type: ExperimentType::MultiArmedBandit,
            strategies: vec![
                strategy("hold", StrategyConfig::Hold),
                strategy("discount_10", StrategyConfig::FixedDiscount { percent: 10.0 }),
            ],
            allocation_method: method,
            success_metric: SuccessMetric::Conversion,
            confidence_threshold: Some(0.9),
            min_sample_size: Some(50),
            max_duration_days: Some(14),
            category_id: category.map(str::to_string),
            brand: None,
        }
    }

    #[test]
    fn test_full_lifecycle_reaches_conclusive_outcome() {
        let store = Arc::new(InMemoryStore::new());
        seed_listings(&store, 80);
        let sink = capture_sink();
        let manager = ExperimentManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            sink.clone(),
            BanditConfig::default(),
            SignificanceConfig::default(),
        );
        let mut rng = StdRng::seed_from_u64(2024);

        let created = manager
            .create_experiment(request(AllocationMethod::Equal, None), &mut rng)
            .unwrap();
        assert_eq!(created.assigned_listings, 80);
        // 50 / (80 / 7) rounds up to 5 days, floored at 7.
        assert_eq!(created.estimated_duration, 7);

        let start = Utc::now();
        manager
            .start_experiment(&created.experiment_id, SELLER, start)
            .unwrap();

        let assignments = store.assignments(&created.experiment_id).unwrap();
        let mut seen = std::collections::HashMap::new();
        for a in &assignments {
            let n = seen.entry(a.strategy_id.clone()).or_insert(0usize);
            let score = match (a.strategy_id.as_str(), *n % 2) {
                ("hold", 0) => 0.2,
                ("hold", _) => 0.4,
                (_, 0) => 0.7,
                _ => 0.9,
            };
            *n += 1;
            manager
                .record_outcome(
                    &created.experiment_id,
                    &a.listing_id,
                    OutcomeMeasurement {
                        score: Some(score),
                        revenue_impact: Some(score * 10.0),
                        velocity_change: None,
                    },
                    start + Duration::hours(1),
                )
                .unwrap();
        }

        let view = manager
            .get_experiment_status(&created.experiment_id, SELLER, start + Duration::days(7))
            .unwrap();
        assert!((view.progress - 50.0).abs() < 1e-6);
        let results = view.results.unwrap();
        assert!(results.significant_difference);
        assert_eq!(results.leading_strategy.as_deref(), Some("discount_10"));
        assert_eq!(results.strategies[0].sample_size, 40);
        assert_eq!(results.strategies[1].sample_size, 40);
        let arms = &view.arms;
        assert!(arms[1].posterior_mean > arms[0].posterior_mean);
        assert_eq!(arms[0].visit_count, 40);
        assert!((arms[0].traffic_allocation - 0.5).abs() < 1e-12);

        let events = manager.complete_expired(start + Duration::days(15)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, OutcomeKind::Conclusive);
        assert_eq!(events[0].winning_strategy_id.as_deref(), Some("discount_10"));
        assert_eq!(events[0].user_id, SELLER);
        assert_eq!(sink.count_kind(OutcomeKind::Conclusive), 1);

        let err = manager
            .record_outcome(
                &created.experiment_id,
                &assignments[0].listing_id,
                OutcomeMeasurement::default(),
                start + Duration::days(16),
            )
            .unwrap_err();
        assert_eq!(err.kind(), pricing_core::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn test_thompson_experiment_filters_by_category() {
        let store = Arc::new(InMemoryStore::new());
        seed_listings(&store, 30);
        let manager = ExperimentManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            capture_sink(),
            BanditConfig::default(),
            SignificanceConfig::default(),
        );
        let mut rng = StdRng::seed_from_u64(7);

        let created = manager
            .create_experiment(
                request(AllocationMethod::ThompsonSampling, Some("shoes")),
                &mut rng,
            )
            .unwrap();
        assert_eq!(created.assigned_listings, 15);

        let assignments = store.assignments(&created.experiment_id).unwrap();
        assert!(assignments.iter().all(|a| a.listing_id != "sold-item"));
        assert!(assignments
            .iter()
            .all(|a| a.strategy_id == "hold" || a.strategy_id == "discount_10"));

        let listed = manager.list_experiments(SELLER, Utc::now()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(manager.list_experiments("other-seller", Utc::now()).unwrap().is_empty());
    }
}
