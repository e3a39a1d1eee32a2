//! Ledger store abstractions and the query shapes the aggregation engine issues.

use crate::core::error::StorageError;
use crate::core::model::{
    CardAccount, Collective, CollectiveId, Expense, ExpenseId, LedgerSnapshot, PaymentMethod,
    PaymentMethodId, SchemeVersion, Subscription, Transaction, TransactionKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Currency a summed column is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CurrencyBucket {
    Transaction,
    Host,
}

/// Summable transaction columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Amount,
    NetAmount,
    AmountInHostCurrency,
    NetAmountInHostCurrency,
}

impl Column {
    pub fn bucket(self) -> CurrencyBucket {
        match self {
            Column::Amount | Column::NetAmount => CurrencyBucket::Transaction,
            Column::AmountInHostCurrency | Column::NetAmountInHostCurrency => {
                CurrencyBucket::Host
            }
        }
    }

    pub fn value(self, tx: &Transaction) -> i64 {
        match self {
            Column::Amount => tx.amount,
            Column::NetAmount => tx.net_amount,
            Column::AmountInHostCurrency => tx.amount_in_host_currency,
            Column::NetAmountInHostCurrency => tx.net_amount_in_host_currency(),
        }
    }
}

/// Restriction on a transaction's host collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostFilter {
    #[default]
    Any,
    /// Host collective id is not null.
    Assigned,
    Exactly(CollectiveId),
}

impl HostFilter {
    pub fn matches(self, host: Option<CollectiveId>) -> bool {
        match self {
            HostFilter::Any => true,
            HostFilter::Assigned => host.is_some(),
            HostFilter::Exactly(id) => host == Some(id),
        }
    }
}

/// Column selection and host policy of an accounting scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemePolicy {
    pub amount: Column,
    pub net_amount: Column,
    pub host: HostFilter,
}

impl SchemeVersion {
    pub const fn policy(self) -> SchemePolicy {
        match self {
            SchemeVersion::V1 => SchemePolicy {
                amount: Column::Amount,
                net_amount: Column::NetAmount,
                host: HostFilter::Any,
            },
            SchemeVersion::V2 => SchemePolicy {
                amount: Column::AmountInHostCurrency,
                net_amount: Column::NetAmountInHostCurrency,
                host: HostFilter::Assigned,
            },
        }
    }
}

/// Half-open `[start, end)` creation-time window; open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DateWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        DateWindow { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at < end)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    pub collective_ids: Vec<CollectiveId>,
    pub window: DateWindow,
    pub kind: Option<TransactionKind>,
    pub host: HostFilter,
    pub exclude_refunded: bool,
}

impl TransactionFilter {
    /// Soft-deleted rows never match.
    pub fn matches(&self, tx: &Transaction) -> bool {
        !tx.is_deleted()
            && self.collective_ids.contains(&tx.collective_id)
            && self.window.contains(tx.created_at)
            && self.kind.is_none_or(|kind| tx.kind == kind)
            && self.host.matches(tx.host_collective_id)
            && !(self.exclude_refunded && tx.is_refunded())
    }
}

/// One row of a grouped sum: the total for a collective in one currency bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedSum {
    pub collective_id: CollectiveId,
    pub currency: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveBalance {
    pub collective_id: CollectiveId,
    pub balance: i64,
}

/// Read side of the ledger, as used by the aggregation engine.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn collective(&self, id: CollectiveId) -> StorageResult<Option<Collective>>;

    async fn hosted_collectives(&self, host_id: CollectiveId) -> StorageResult<Vec<Collective>>;

    /// Sums `column` grouped by collective and the column's currency bucket.
    async fn sum_transactions(
        &self,
        column: Column,
        filter: &TransactionFilter,
    ) -> StorageResult<Vec<GroupedSum>>;

    /// Sums blocking expenses grouped by collective and expense currency.
    async fn sum_blocked_expenses(
        &self,
        collective_ids: &[CollectiveId],
        window: DateWindow,
    ) -> StorageResult<Vec<GroupedSum>>;

    /// Per-collective sum of net amounts converted with each row's captured host rate.
    async fn sum_in_host_currency(
        &self,
        collective_ids: &[CollectiveId],
        host_id: CollectiveId,
        until: DateTime<Utc>,
    ) -> StorageResult<Vec<CollectiveBalance>>;

    async fn transactions(&self, filter: &TransactionFilter) -> StorageResult<Vec<Transaction>>;

    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>>;
}

/// Write side of the ledger, used by reconciliation jobs.
#[async_trait]
pub trait LedgerWriter: LedgerStore {
    /// Inserts all rows or none, assigning fresh ids. Returns the stored rows.
    async fn insert_transactions(&self, rows: Vec<Transaction>)
    -> StorageResult<Vec<Transaction>>;

    async fn expense(&self, id: ExpenseId) -> StorageResult<Option<Expense>>;

    async fn update_expense(&self, expense: &Expense) -> StorageResult<()>;

    /// Writes the DEBIT of a paid expense together with the expense itself.
    /// No second DEBIT is written when the expense already has one; the inserted
    /// row is returned otherwise.
    async fn record_paid_expense(
        &self,
        debit: Transaction,
        expense: &Expense,
    ) -> StorageResult<Option<Transaction>>;

    async fn card_accounts(&self) -> StorageResult<Vec<CardAccount>>;

    async fn cards_for_host(&self, host_id: CollectiveId) -> StorageResult<Vec<PaymentMethod>>;

    async fn last_transaction_at(
        &self,
        payment_method_id: PaymentMethodId,
    ) -> StorageResult<Option<DateTime<Utc>>>;

    /// Loads a snapshot, replacing records that share an id.
    async fn import(&self, snapshot: LedgerSnapshot) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_is_half_open() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let window = DateWindow::new(Some(t0), Some(t1));
        assert!(window.contains(t0));
        assert!(!window.contains(t1));
        assert!(DateWindow::default().contains(t1));
    }

    #[test]
    fn test_scheme_policies() {
        let v1 = SchemeVersion::V1.policy();
        assert_eq!(v1.net_amount.bucket(), CurrencyBucket::Transaction);
        assert_eq!(v1.host, HostFilter::Any);

        let v2 = SchemeVersion::V2.policy();
        assert_eq!(v2.amount, Column::AmountInHostCurrency);
        assert_eq!(v2.net_amount.bucket(), CurrencyBucket::Host);
        assert!(!v2.host.matches(None));
        assert!(v2.host.matches(Some(7)));
    }

    #[test]
    fn test_exact_host_filter() {
        assert!(HostFilter::Exactly(3).matches(Some(3)));
        assert!(!HostFilter::Exactly(3).matches(Some(4)));
        assert!(!HostFilter::Exactly(3).matches(None));
    }
}
