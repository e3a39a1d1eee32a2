use crate::core::currency::CurrencyRateProvider;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FixedRate {
    pub from: String,
    pub to: String,
    pub rate: f64,
}

/// Deterministic FX table. A pair configured in one direction also answers the
/// reverse direction with the reciprocal rate. Dates are ignored.
#[derive(Debug, Clone, Default)]
pub struct FixedRateProvider {
    rates: HashMap<(String, String), f64>,
}

impl FixedRateProvider {
    pub fn new(rates: &[FixedRate]) -> Self {
        let mut provider = Self::default();
        for rate in rates {
            provider.add_rate(&rate.from, &rate.to, rate.rate);
        }
        provider
    }

    pub fn add_rate(&mut self, from: &str, to: &str, rate: f64) {
        self.rates
            .insert((from.to_uppercase(), to.to_uppercase()), rate);
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: f64) -> Self {
        self.add_rate(from, to, rate);
        self
    }

    fn lookup(&self, from: &str, to: &str) -> Option<f64> {
        let key = |a: &str, b: &str| (a.to_uppercase(), b.to_uppercase());
        self.rates.get(&key(from, to)).copied().or_else(|| {
            self.rates
                .get(&key(to, from))
                .filter(|rate| **rate != 0.0)
                .map(|rate| 1.0 / rate)
        })
    }
}

#[async_trait]
impl CurrencyRateProvider for FixedRateProvider {
    async fn get_rate(&self, from: &str, to: &str, _at: Option<DateTime<Utc>>) -> Result<f64> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(1.0);
        }
        let rate = self
            .lookup(from, to)
            .ok_or_else(|| anyhow!("No fixed rate configured for {} to {}", from, to))?;
        debug!("Fixed rate {from} -> {to}: {rate}");
        Ok(rate)
    }
}
