//! Synthetic marketplace used by the CLI: seeded listings and a simple
//! outcome model per strategy.

use chrono::{DateTime, Duration, Utc};
use pricing_core::store::InMemoryStore;
use pricing_core::types::{ListingSnapshot, ListingStatus, Strategy, StrategyConfig};
use rand::Rng;

const CATEGORIES: [&str; 3] = ["sneakers", "handbags", "watches"];
const BRANDS: [&str; 4] = ["acme", "northwind", "contoso", "globex"];

pub fn seed_listings(store: &InMemoryStore, count: usize, rng: &mut impl Rng, now: DateTime<Utc>) {
    for i in 0..count {
        let original_price: f64 = rng.gen_range(20.0..400.0);
        let current_price = original_price * rng.gen_range(0.7..1.05);
        let views = rng.gen_range(10..2_000);
        let competitors = rng.gen_range(0..5);

        store.upsert_listing(ListingSnapshot {
            id: format!("listing-{i:04}"),
            user_id: format!("seller-{}", i % 5),
            category_id: Some(CATEGORIES[i % CATEGORIES.len()].to_string()),
            brand: Some(BRANDS[rng.gen_range(0..BRANDS.len())].to_string()),
            status: if rng.gen::<f64>() < 0.9 {
                ListingStatus::Active
            } else {
                ListingStatus::Inactive
            },
            current_price,
            original_price,
            views,
            watchers: rng.gen_range(0..=views / 10),
            competitor_prices: (0..competitors)
                .map(|_| original_price * rng.gen_range(0.8..1.2))
                .collect(),
            price_history: vec![original_price],
            listed_at: now - Duration::days(rng.gen_range(1..90)),
            updated_at: now - Duration::minutes(rng.gen_range(0..10_000)),
        });
    }
}

pub fn strategies() -> Vec<Strategy> {
    vec![
        Strategy {
            id: "hold".into(),
            name: "Hold price".into(),
            config: StrategyConfig::Hold,
        },
        Strategy {
            id: "discount-10".into(),
            name: "10% markdown".into(),
            config: StrategyConfig::FixedDiscount { percent: 10.0 },
        },
        Strategy {
            id: "match-competitors".into(),
            name: "Match competitors -2%".into(),
            config: StrategyConfig::CompetitorMatch {
                offset_percent: -2.0,
            },
        },
    ]
}

/// Sell-through style score in `[0, 1]`: deeper discounts convert better.
pub fn simulated_score(config: &StrategyConfig, rng: &mut impl Rng) -> f64 {
    let base = match config {
        StrategyConfig::Hold => 0.30,
        StrategyConfig::FixedDiscount { percent } => 0.30 + percent / 40.0,
        StrategyConfig::CompetitorMatch { offset_percent } => 0.45 - offset_percent / 50.0,
        StrategyConfig::DynamicMarkup { max_markup, .. } => 0.35 - max_markup / 4.0,
    };
    (base + rng.gen_range(-0.15..0.15)).clamp(0.0, 1.0)
}
