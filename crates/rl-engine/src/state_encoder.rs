//! Discretizes a listing's feature snapshot into a stable state key.

use chrono::{DateTime, Datelike, Utc};
use pricing_core::types::{ListingSnapshot, RlFeatures, RlState};

const PRICE_HISTORY_LEN: usize = 10;

pub struct StateEncoder;

impl StateEncoder {
    /// State key over `[price·100, original·100, views, watchers, trend·100,
    /// seasonal·100, days]`. Price history and competitor prices are not part
    /// of the key, so listings that differ only in those share a Q-table row.
    pub fn hash(features: &RlFeatures) -> String {
        let tuple = [
            (features.current_price * 100.0).round() as i64,
            (features.original_price * 100.0).round() as i64,
            features.views as i64,
            features.watchers as i64,
            (features.market_trend * 100.0).round() as i64,
            (features.seasonal_factor * 100.0).round() as i64,
            features.days_since_listing as i64,
        ];
        let canonical = format!(
            "[{}]",
            tuple
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );

        let hash = canonical
            .bytes()
            .fold(0i32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as i32));
        to_base36(hash.unsigned_abs())
    }

    pub fn encode(listing_id: &str, features: RlFeatures) -> RlState {
        let state_hash = Self::hash(&features);
        RlState {
            listing_id: listing_id.to_string(),
            features,
            state_hash,
        }
    }

    /// Derive RL features from a marketplace snapshot.
    pub fn features_from_listing(listing: &ListingSnapshot, now: DateTime<Utc>) -> RlFeatures {
        let skip = listing.price_history.len().saturating_sub(PRICE_HISTORY_LEN);
        let price_history = listing.price_history[skip..].to_vec();

        let market_trend = if listing.competitor_prices.is_empty() || listing.current_price <= 0.0 {
            0.0
        } else {
            let avg = listing.competitor_prices.iter().sum::<f64>()
                / listing.competitor_prices.len() as f64;
            ((avg - listing.current_price) / listing.current_price).clamp(-1.0, 1.0)
        };

        let seasonal_factor = match now.month() {
            11 | 12 => 1.2,
            1 | 2 => 0.9,
            _ => 1.0,
        };

        let category_demand = if listing.views == 0 {
            0.0
        } else {
            (listing.watchers as f64 / listing.views as f64).clamp(0.0, 1.0)
        };

        RlFeatures {
            current_price: listing.current_price,
            original_price: listing.original_price,
            price_history,
            views: listing.views,
            watchers: listing.watchers,
            competitor_prices: listing.competitor_prices.clone(),
            market_trend,
            seasonal_factor,
            days_since_listing: (now - listing.listed_at).num_days().max(0) as u32,
            category_demand,
        }
    }

    pub fn encode_listing(listing: &ListingSnapshot, now: DateTime<Utc>) -> RlState {
        Self::encode(&listing.id, Self::features_from_listing(listing, now))
    }
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
