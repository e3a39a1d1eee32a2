//! Grouped-sum primitives shared by every ledger store, so that memory and disk
//! backends answer identically.

use crate::core::error::StorageError;
use crate::core::ledger::{
    CollectiveBalance, Column, CurrencyBucket, DateWindow, GroupedSum, StorageResult,
    TransactionFilter,
};
use crate::core::model::{
    Collective, CollectiveId, Expense, ExpenseId, PaymentMethodId, Transaction, TransactionId,
    TransactionKind,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

fn bucket_currency(tx: &Transaction, bucket: CurrencyBucket) -> StorageResult<&str> {
    match bucket {
        CurrencyBucket::Transaction => Ok(&tx.currency),
        CurrencyBucket::Host => tx.host_currency.as_deref().ok_or_else(|| {
            StorageError::Integrity(format!(
                "transaction {} is summed in host currency but has none",
                tx.id
            ))
        }),
    }
}

/// Adds to a running total, treating overflow as corrupt data.
pub(crate) fn accumulate(total: &mut i64, value: i64) -> StorageResult<()> {
    let sum = total
        .checked_add(value)
        .ok_or_else(|| StorageError::Integrity(format!("sum overflows at {total} + {value}")))?;
    *total = sum;
    Ok(())
}

/// First id free for rows imported without one: past both the stored rows and
/// every explicit id the incoming rows carry.
pub(crate) fn first_free_id(
    stored_next: TransactionId,
    incoming: &[Transaction],
) -> TransactionId {
    incoming
        .iter()
        .map(|tx| tx.id.saturating_add(1))
        .fold(stored_next, TransactionId::max)
}

fn into_groups(totals: BTreeMap<(CollectiveId, String), i64>) -> Vec<GroupedSum> {
    totals
        .into_iter()
        .map(|((collective_id, currency), value)| GroupedSum {
            collective_id,
            currency,
            value,
        })
        .collect()
}

pub(crate) fn sum_transactions<'a>(
    rows: impl IntoIterator<Item = &'a Transaction>,
    column: Column,
    filter: &TransactionFilter,
) -> StorageResult<Vec<GroupedSum>> {
    let mut totals: BTreeMap<(CollectiveId, String), i64> = BTreeMap::new();
    for tx in rows.into_iter().filter(|tx| filter.matches(tx)) {
        let currency = bucket_currency(tx, column.bucket())?;
        let total = totals
            .entry((tx.collective_id, currency.to_string()))
            .or_default();
        accumulate(total, column.value(tx))?;
    }
    Ok(into_groups(totals))
}

pub(crate) fn sum_blocked_expenses<'a>(
    rows: impl IntoIterator<Item = &'a Expense>,
    collective_ids: &[CollectiveId],
    window: DateWindow,
) -> StorageResult<Vec<GroupedSum>> {
    let mut totals: BTreeMap<(CollectiveId, String), i64> = BTreeMap::new();
    for expense in rows.into_iter().filter(|e| {
        e.deleted_at.is_none()
            && e.is_blocking()
            && collective_ids.contains(&e.collective_id)
            && window.contains(e.created_at)
    }) {
        let total = totals
            .entry((expense.collective_id, expense.currency.clone()))
            .or_default();
        accumulate(total, expense.amount)?;
    }
    Ok(into_groups(totals))
}

pub(crate) fn sum_in_host_currency<'a>(
    rows: impl IntoIterator<Item = &'a Transaction>,
    collective_ids: &[CollectiveId],
    host_id: CollectiveId,
    until: DateTime<Utc>,
) -> StorageResult<Vec<CollectiveBalance>> {
    let mut totals: BTreeMap<CollectiveId, i64> = BTreeMap::new();
    for tx in rows.into_iter().filter(|tx| {
        !tx.is_deleted()
            && tx.host_collective_id == Some(host_id)
            && collective_ids.contains(&tx.collective_id)
            && tx.created_at < until
    }) {
        let total = totals.entry(tx.collective_id).or_default();
        accumulate(
            total,
            (tx.net_amount as f64 * tx.host_currency_fx_rate).round() as i64,
        )?;
    }
    Ok(totals
        .into_iter()
        .map(|(collective_id, balance)| CollectiveBalance {
            collective_id,
            balance,
        })
        .collect())
}

pub(crate) fn filter_transactions<'a>(
    rows: impl IntoIterator<Item = &'a Transaction>,
    filter: &TransactionFilter,
) -> Vec<Transaction> {
    let mut matched: Vec<Transaction> = rows
        .into_iter()
        .filter(|tx| filter.matches(tx))
        .cloned()
        .collect();
    matched.sort_by_key(|tx| (tx.created_at, tx.id));
    matched
}

pub(crate) fn hosted_collectives<'a>(
    rows: impl IntoIterator<Item = &'a Collective>,
    host_id: CollectiveId,
) -> Vec<Collective> {
    rows.into_iter()
        .filter(|c| c.is_hosted_by(host_id))
        .cloned()
        .collect()
}

pub(crate) fn has_expense_debit<'a>(
    rows: impl IntoIterator<Item = &'a Transaction>,
    expense_id: ExpenseId,
) -> bool {
    rows.into_iter().any(|tx| {
        !tx.is_deleted() && tx.kind == TransactionKind::Debit && tx.expense_id == Some(expense_id)
    })
}

pub(crate) fn last_transaction_at<'a>(
    rows: impl IntoIterator<Item = &'a Transaction>,
    payment_method_id: PaymentMethodId,
) -> Option<DateTime<Utc>> {
    rows.into_iter()
        .filter(|tx| tx.payment_method_id == Some(payment_method_id))
        .map(|tx| tx.created_at)
        .max()
}
