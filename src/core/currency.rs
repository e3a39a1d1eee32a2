//! Currency conversion abstractions

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// FX rate oracle. Returns the multiplicative rate converting `from` into `to`,
/// as of `at` when given, otherwise the latest known rate.
#[async_trait]
pub trait CurrencyRateProvider: Send + Sync {
    async fn get_rate(&self, from: &str, to: &str, at: Option<DateTime<Utc>>) -> Result<f64>;
}

#[async_trait]
impl<T: CurrencyRateProvider + ?Sized> CurrencyRateProvider for std::sync::Arc<T> {
    async fn get_rate(&self, from: &str, to: &str, at: Option<DateTime<Utc>>) -> Result<f64> {
        (**self).get_rate(from, to, at).await
    }
}
