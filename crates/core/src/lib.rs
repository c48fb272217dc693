//! Shared foundations for the pricing experimentation platform: configuration,
//! errors, domain types, the outcome event bus and repository seams.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, PricingError, PricingResult};
pub use store::InMemoryStore;
