//! Balance and income aggregation over the transaction ledger.
//!
//! Every operation issues grouped sums against a [`LedgerStore`], converts each
//! (collective, currency) bucket with one FX rate per distinct currency and
//! accumulates the rounded result per collective. Requested collectives that have
//! no ledger rows still appear in the result with a zero value.

use crate::core::currency::CurrencyRateProvider;
use crate::core::error::{BudgetError, Result, StorageError};
use crate::core::ledger::{
    CollectiveBalance, Column, DateWindow, GroupedSum, HostFilter, LedgerStore, SchemePolicy,
    TransactionFilter,
};
use crate::core::model::{
    Amount, Collective, CollectiveId, DEFAULT_CURRENCY, SchemeVersion, SubscriptionInterval,
    TransactionKind, is_currency_code,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Converts minor units with `rate`, rounding once after the multiplication.
pub fn convert_amount(value: i64, rate: f64) -> i64 {
    (value as f64 * rate).round() as i64
}

/// Per-call aggregation options. Unset fields default from the collective
/// (currency, budget version) or, for batch calls, from the engine's fallback
/// currency and [`SchemeVersion::V1`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BudgetOptions {
    /// Inclusive lower bound on transaction creation time.
    pub start_date: Option<DateTime<Utc>>,
    /// Exclusive upper bound on transaction creation time.
    pub end_date: Option<DateTime<Utc>>,
    pub currency: Option<String>,
    pub version: Option<SchemeVersion>,
    /// Subtract scheduled or in-flight expense payouts.
    pub with_blocked_funds: bool,
    /// Count transactions that have been refunded.
    pub include_refunded: bool,
    /// Date of the FX rates to convert with; latest when unset.
    pub fx_date: Option<DateTime<Utc>>,
}

impl BudgetOptions {
    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn in_currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_string());
        self
    }

    pub fn with_version(mut self, version: SchemeVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn blocked_funds(mut self) -> Self {
        self.with_blocked_funds = true;
        self
    }

    pub fn refunds_included(mut self) -> Self {
        self.include_refunded = true;
        self
    }

    fn window(&self) -> DateWindow {
        DateWindow::new(self.start_date, self.end_date)
    }
}

/// One grouped aggregation, fully resolved.
#[derive(Debug)]
struct SumRequest {
    column: Column,
    filter: TransactionFilter,
    currency: String,
    fx_date: Option<DateTime<Utc>>,
    with_blocked_funds: bool,
}

/// Read-only aggregation operations over a collective ledger.
#[async_trait]
pub trait Budget: Send + Sync {
    async fn balance(&self, collective: &Collective, options: &BudgetOptions) -> Result<Amount>;

    async fn balance_with_blocked_funds(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> Result<Amount> {
        self.balance(collective, &options.clone().blocked_funds())
            .await
    }

    async fn balances(
        &self,
        collective_ids: &[CollectiveId],
        options: &BudgetOptions,
    ) -> Result<BTreeMap<CollectiveId, Amount>>;

    async fn balances_with_blocked_funds(
        &self,
        collective_ids: &[CollectiveId],
        options: &BudgetOptions,
    ) -> Result<BTreeMap<CollectiveId, Amount>> {
        self.balances(collective_ids, &options.clone().blocked_funds())
            .await
    }

    /// Gross CREDIT total.
    async fn total_amount_received(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> Result<Amount>;

    /// CREDIT total after fees.
    async fn total_net_amount_received(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> Result<Amount>;

    /// Sum of the balances of every hosted collective, plus the host's own when active.
    async fn total_money_managed(&self, host: &Collective, options: &BudgetOptions)
    -> Result<Amount>;

    /// Point-in-time balances in host currency using the rate captured on each transaction.
    async fn balances_in_host_currency(
        &self,
        collective_ids: &[CollectiveId],
        host_id: CollectiveId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<CollectiveBalance>>;

    async fn yearly_income_at(&self, collective: &Collective, now: DateTime<Utc>) -> Result<i64>;

    async fn yearly_income(&self, collective: &Collective) -> Result<i64> {
        self.yearly_income_at(collective, Utc::now()).await
    }
}

/// Aggregation engine computing directly against a ledger store and an FX oracle.
pub struct LedgerBudget<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    rates: Arc<dyn CurrencyRateProvider>,
    fallback_currency: String,
}

impl<S: LedgerStore + ?Sized> LedgerBudget<S> {
    pub fn new(store: Arc<S>, rates: Arc<dyn CurrencyRateProvider>) -> Self {
        Self {
            store,
            rates,
            fallback_currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    /// Currency used by batch calls that do not name one.
    pub fn with_fallback_currency(mut self, currency: &str) -> Self {
        self.fallback_currency = currency.to_string();
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn target_currency(&self, requested: Option<&str>, default: &str) -> Result<String> {
        let currency = requested.unwrap_or(default);
        if !is_currency_code(currency) {
            return Err(BudgetError::UnknownCurrency(currency.to_string()));
        }
        Ok(currency.to_string())
    }

    /// Scheme policy for a single-collective call; host-currency schemes need a host.
    fn collective_policy(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> Result<SchemePolicy> {
        let version = options.version.unwrap_or(collective.scheme_version());
        if version == SchemeVersion::V2
            && collective.host_collective_id.is_none()
            && !collective.is_host
        {
            return Err(BudgetError::MissingHost(collective.id));
        }
        Ok(version.policy())
    }

    /// Resolves one rate per distinct currency. Lookups run concurrently; the
    /// resulting table is read-only during accumulation.
    async fn resolve_rates<'a>(
        &self,
        currencies: impl IntoIterator<Item = &'a str>,
        target: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, f64>> {
        let distinct: BTreeSet<&str> = currencies.into_iter().collect();
        debug!(?distinct, to = target, "Resolving FX rates for distinct bucket currencies");

        let lookups = distinct.into_iter().map(|from| async move {
            if !is_currency_code(from) {
                return Err(BudgetError::UnknownCurrency(from.to_string()));
            }
            if from == target {
                return Ok((from.to_string(), 1.0));
            }
            match self.rates.get_rate(from, target, at).await {
                Ok(rate) => {
                    debug!("Resolved rate {from} -> {target}: {rate}");
                    Ok((from.to_string(), rate))
                }
                Err(source) => Err(BudgetError::FxRate {
                    from: from.to_string(),
                    to: target.to_string(),
                    source,
                }),
            }
        });

        Ok(try_join_all(lookups).await?.into_iter().collect())
    }

    #[instrument(name = "SumCollectives", skip(self), fields(column = ?request.column))]
    async fn sum_collectives(
        &self,
        request: &SumRequest,
    ) -> Result<BTreeMap<CollectiveId, Amount>> {
        let ids = &request.filter.collective_ids;
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut totals: BTreeMap<CollectiveId, i64> = ids.iter().map(|id| (*id, 0)).collect();

        let groups = self
            .store
            .sum_transactions(request.column, &request.filter)
            .await?;
        let blocked = if request.with_blocked_funds {
            self.store
                .sum_blocked_expenses(ids, request.filter.window)
                .await?
        } else {
            Vec::new()
        };

        let rates = self
            .resolve_rates(
                groups.iter().chain(blocked.iter()).map(|g| g.currency.as_str()),
                &request.currency,
                request.fx_date,
            )
            .await?;

        accumulate(&mut totals, &groups, &rates, 1)?;
        accumulate(&mut totals, &blocked, &rates, -1)?;

        Ok(totals
            .into_iter()
            .map(|(id, value)| (id, Amount::new(value, &request.currency)))
            .collect())
    }

    async fn sum_collective(&self, collective: &Collective, request: SumRequest) -> Result<Amount> {
        let mut totals = self.sum_collectives(&request).await?;
        totals
            .remove(&collective.id)
            .ok_or(BudgetError::UnknownCollective(collective.id))
    }

    async fn received(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
        column: fn(&SchemePolicy) -> Column,
    ) -> Result<Amount> {
        let policy = self.collective_policy(collective, options)?;
        let request = SumRequest {
            column: column(&policy),
            filter: TransactionFilter {
                collective_ids: vec![collective.id],
                window: options.window(),
                kind: Some(TransactionKind::Credit),
                host: policy.host,
                exclude_refunded: !options.include_refunded,
            },
            currency: self.target_currency(options.currency.as_deref(), &collective.currency)?,
            fx_date: options.fx_date,
            with_blocked_funds: false,
        };
        self.sum_collective(collective, request).await
    }
}

/// Checked addition; an overflowing total means the ledger data is corrupt.
fn add_to(total: &mut i64, value: i64) -> Result<()> {
    let sum = total.checked_add(value).ok_or_else(|| {
        StorageError::Integrity(format!("sum overflows at {total} + {value}"))
    })?;
    *total = sum;
    Ok(())
}

fn accumulate(
    totals: &mut BTreeMap<CollectiveId, i64>,
    groups: &[GroupedSum],
    rates: &HashMap<String, f64>,
    sign: i64,
) -> Result<()> {
    for group in groups {
        let rate = rates
            .get(&group.currency)
            .ok_or_else(|| BudgetError::UnknownCurrency(group.currency.clone()))?;
        let slot = totals.get_mut(&group.collective_id).ok_or_else(|| {
            StorageError::Integrity(format!(
                "ledger returned collective {} which was not requested",
                group.collective_id
            ))
        })?;
        add_to(slot, sign * convert_amount(group.value, *rate))?;
    }
    Ok(())
}

#[async_trait]
impl<S: LedgerStore + ?Sized> Budget for LedgerBudget<S> {
    async fn balance(&self, collective: &Collective, options: &BudgetOptions) -> Result<Amount> {
        let policy = self.collective_policy(collective, options)?;
        let request = SumRequest {
            column: policy.net_amount,
            filter: TransactionFilter {
                collective_ids: vec![collective.id],
                window: options.window(),
                kind: None,
                host: policy.host,
                exclude_refunded: !options.include_refunded,
            },
            currency: self.target_currency(options.currency.as_deref(), &collective.currency)?,
            fx_date: options.fx_date,
            with_blocked_funds: options.with_blocked_funds,
        };
        self.sum_collective(collective, request).await
    }

    async fn balances(
        &self,
        collective_ids: &[CollectiveId],
        options: &BudgetOptions,
    ) -> Result<BTreeMap<CollectiveId, Amount>> {
        let policy = options.version.unwrap_or_default().policy();
        let request = SumRequest {
            column: policy.net_amount,
            filter: TransactionFilter {
                collective_ids: collective_ids.to_vec(),
                window: options.window(),
                kind: None,
                host: policy.host,
                exclude_refunded: !options.include_refunded,
            },
            currency: self.target_currency(options.currency.as_deref(), &self.fallback_currency)?,
            fx_date: options.fx_date,
            with_blocked_funds: options.with_blocked_funds,
        };
        self.sum_collectives(&request).await
    }

    async fn total_amount_received(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> Result<Amount> {
        self.received(collective, options, |policy| policy.amount)
            .await
    }

    async fn total_net_amount_received(
        &self,
        collective: &Collective,
        options: &BudgetOptions,
    ) -> Result<Amount> {
        self.received(collective, options, |policy| policy.net_amount)
            .await
    }

    async fn total_money_managed(
        &self,
        host: &Collective,
        options: &BudgetOptions,
    ) -> Result<Amount> {
        let currency = self.target_currency(options.currency.as_deref(), &host.currency)?;
        let policy = options.version.unwrap_or(host.scheme_version()).policy();

        let mut ids: Vec<CollectiveId> = self
            .store
            .hosted_collectives(host.id)
            .await?
            .iter()
            .map(|c| c.id)
            .collect();
        if host.is_active {
            ids.push(host.id);
        }
        if ids.is_empty() {
            debug!(host = host.id, "Host manages no collectives");
            return Ok(Amount::zero(&currency));
        }

        let request = SumRequest {
            column: policy.net_amount,
            filter: TransactionFilter {
                collective_ids: ids,
                window: options.window(),
                kind: None,
                host: HostFilter::Exactly(host.id),
                exclude_refunded: !options.include_refunded,
            },
            currency: currency.clone(),
            fx_date: options.fx_date,
            with_blocked_funds: false,
        };
        let totals = self.sum_collectives(&request).await?;
        let value = totals.values().map(|amount| amount.value).sum();
        Ok(Amount::new(value, &currency))
    }

    async fn balances_in_host_currency(
        &self,
        collective_ids: &[CollectiveId],
        host_id: CollectiveId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<CollectiveBalance>> {
        let until = as_of.unwrap_or_else(Utc::now);
        let mut totals: BTreeMap<CollectiveId, i64> =
            collective_ids.iter().map(|id| (*id, 0)).collect();
        for row in self
            .store
            .sum_in_host_currency(collective_ids, host_id, until)
            .await?
        {
            add_to(totals.entry(row.collective_id).or_default(), row.balance)?;
        }
        Ok(totals
            .into_iter()
            .map(|(collective_id, balance)| CollectiveBalance {
                collective_id,
                balance,
            })
            .collect())
    }

    /// Projects yearly income from three disjoint sets of non-refunded rows:
    /// active monthly subscriptions (latest net amount x 12), one-time or active
    /// yearly credits of the last 12 months, and last-12-month credits of monthly
    /// subscriptions that have since been cancelled.
    async fn yearly_income_at(&self, collective: &Collective, now: DateTime<Utc>) -> Result<i64> {
        let since = now
            .checked_sub_months(Months::new(12))
            .unwrap_or(now - Duration::days(365));
        let subscriptions: HashMap<_, _> = self
            .store
            .subscriptions()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        let credits = self
            .store
            .transactions(&TransactionFilter {
                collective_ids: vec![collective.id],
                kind: Some(TransactionKind::Credit),
                exclude_refunded: true,
                ..Default::default()
            })
            .await?;

        // Rows arrive ordered by creation time, so the last insert per key wins.
        let mut latest_monthly: HashMap<_, i64> = HashMap::new();
        let mut recent = 0;
        let mut lapsed = 0;

        for tx in &credits {
            let subscription = tx.subscription_id.and_then(|id| subscriptions.get(&id));
            let in_last_year = tx.created_at > since;
            match subscription {
                Some(s) if s.deleted_at.is_some() => {}
                Some(s) if s.interval == SubscriptionInterval::Month && s.is_active => {
                    latest_monthly.insert(s.id, tx.net_amount);
                }
                Some(s) if s.interval == SubscriptionInterval::Month => {
                    if in_last_year {
                        add_to(&mut lapsed, tx.net_amount)?;
                    }
                }
                Some(s) if s.is_active => {
                    if in_last_year {
                        add_to(&mut recent, tx.net_amount)?;
                    }
                }
                Some(_) => {}
                None => {
                    if in_last_year {
                        add_to(&mut recent, tx.net_amount)?;
                    }
                }
            }
        }

        let mut monthly = 0;
        for net in latest_monthly.values() {
            let yearly = net.checked_mul(12).ok_or_else(|| {
                StorageError::Integrity(format!("monthly amount {net} overflows a year"))
            })?;
            add_to(&mut monthly, yearly)?;
        }
        debug!(
            collective = collective.id,
            monthly, recent, lapsed, "Computed yearly income components"
        );
        let mut total = monthly;
        add_to(&mut total, recent)?;
        add_to(&mut total, lapsed)?;
        Ok(total)
    }
}
