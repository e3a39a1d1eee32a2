pub mod caching;
pub mod fixed_rates;
pub mod frankfurter;

pub use caching::{CachedBudget, CachingCurrencyRateProvider};
pub use fixed_rates::FixedRateProvider;
pub use frankfurter::FrankfurterRateProvider;
