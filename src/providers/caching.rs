use crate::core::budget::{Budget, BudgetOptions};
use crate::core::cache::Cache;
use crate::core::currency::CurrencyRateProvider;
use crate::core::error::Result as BudgetResult;
use crate::core::ledger::CollectiveBalance;
use crate::core::model::{Amount, Collective, CollectiveId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use tracing::debug;

type RateKey = (String, String, Option<NaiveDate>);

// Caching for CurrencyRateProvider. Only successful lookups are memoized.
#[derive(Clone)]
pub struct CachingCurrencyRateProvider<T: CurrencyRateProvider> {
    inner: T,
    cache: Cache<RateKey, f64>,
}

impl<T: CurrencyRateProvider> CachingCurrencyRateProvider<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            cache: Cache::new(),
        }
    }
}

#[async_trait]
impl<T: CurrencyRateProvider> CurrencyRateProvider for CachingCurrencyRateProvider<T> {
    async fn get_rate(&self, from: &str, to: &str, at: Option<DateTime<Utc>>) -> Result<f64> {
        let key = (from.to_string(), to.to_string(), at.map(|at| at.date_naive()));
        if let Some(rate) = self.cache.get(&key).await {
            return Ok(rate);
        }
        let rate = self.inner.get_rate(from, to, at).await?;
        self.cache.put(key, rate).await;
        Ok(rate)
    }
}

/// Memoizes `balance` and `balances` results until [`CachedBudget::invalidate`]
/// is called. Every other operation goes straight to the wrapped engine.
pub struct CachedBudget<B: Budget> {
    inner: B,
    balance_cache: Cache<(Collective, BudgetOptions), Amount>,
    balances_cache: Cache<(Vec<CollectiveId>, BudgetOptions), BTreeMap<CollectiveId, Amount>>,
}

impl<B: Budget> CachedBudget<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            balance_cache: Cache::new(),
            balances_cache: Cache::new(),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Drops every memoized result. Call after the ledger changes.
    pub async fn invalidate(&self) {
        debug!("Invalidating cached balances");
        self.balance_cache.clear().await;
        self.balances_cache.clear().await;
    }
}

#[async_trait]
impl<B: Budget> Budget for CachedBudget<B> {
    async fn balance(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> BudgetResult<Amount> {
        let key = (collective.clone(), options.clone());
        if let Some(amount) = self.balance_cache.get(&key).await {
            return Ok(amount);
        }
        let amount = self.inner.balance(collective, options).await?;
        self.balance_cache.put(key, amount.clone()).await;
        Ok(amount)
    }

    async fn balances(
        &self,
        collective_ids: &[CollectiveId],
        options: &BudgetOptions,
    ) -> BudgetResult<BTreeMap<CollectiveId, Amount>> {
        let key = (collective_ids.to_vec(), options.clone());
        if let Some(balances) = self.balances_cache.get(&key).await {
            return Ok(balances);
        }
        let balances = self.inner.balances(collective_ids, options).await?;
        self.balances_cache.put(key, balances.clone()).await;
        Ok(balances)
    }

    async fn total_amount_received(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> BudgetResult<Amount> {
        self.inner.total_amount_received(collective, options).await
    }

    async fn total_net_amount_received(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> BudgetResult<Amount> {
        self.inner.total_net_amount_received(collective, options).await
    }

    async fn total_money_managed(
        &self,
        host: &Collective,
        options: &BudgetOptions,
    ) -> BudgetResult<Amount> {
        self.inner.total_money_managed(host, options).await
    }

    async fn balances_in_host_currency(
        &self,
        collective_ids: &[CollectiveId],
        host_id: CollectiveId,
        as_of: Option<DateTime<Utc>>,
    ) -> BudgetResult<Vec<CollectiveBalance>> {
        self.inner
            .balances_in_host_currency(collective_ids, host_id, as_of)
            .await
    }

    async fn yearly_income_at(
        &self,
        collective: &Collective,
        now: DateTime<Utc>,
    ) -> BudgetResult<i64> {
        self.inner.yearly_income_at(collective, now).await
    }
}
