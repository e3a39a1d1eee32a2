use crate::core::ledger::{
    CollectiveBalance, Column, DateWindow, GroupedSum, LedgerStore, LedgerWriter, StorageResult,
    TransactionFilter,
};
use crate::core::model::{
    CardAccount, Collective, CollectiveId, Expense, ExpenseId, LedgerSnapshot, PaymentMethod,
    PaymentMethodId, Subscription, SubscriptionId, Transaction, TransactionId,
};
use crate::store::query;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct LedgerState {
    collectives: BTreeMap<CollectiveId, Collective>,
    transactions: BTreeMap<TransactionId, Transaction>,
    expenses: BTreeMap<ExpenseId, Expense>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    card_accounts: BTreeMap<CollectiveId, CardAccount>,
    payment_methods: BTreeMap<PaymentMethodId, PaymentMethod>,
}

impl LedgerState {
    fn next_transaction_id(&self) -> TransactionId {
        self.transactions.keys().next_back().map_or(1, |id| id + 1)
    }
}

/// In-memory ledger store, used by tests and for short-lived imports.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_snapshot(snapshot: LedgerSnapshot) -> StorageResult<Self> {
        let ledger = Self::new();
        ledger.import(snapshot).await?;
        Ok(ledger)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn collective(&self, id: CollectiveId) -> StorageResult<Option<Collective>> {
        let state = self.inner.lock().await;
        Ok(state.collectives.get(&id).cloned())
    }

    async fn hosted_collectives(&self, host_id: CollectiveId) -> StorageResult<Vec<Collective>> {
        let state = self.inner.lock().await;
        Ok(query::hosted_collectives(state.collectives.values(), host_id))
    }

    async fn sum_transactions(
        &self,
        column: Column,
        filter: &TransactionFilter,
    ) -> StorageResult<Vec<GroupedSum>> {
        let state = self.inner.lock().await;
        debug!(?column, ?filter, "Summing transactions in memory");
        query::sum_transactions(state.transactions.values(), column, filter)
    }

    async fn sum_blocked_expenses(
        &self,
        collective_ids: &[CollectiveId],
        window: DateWindow,
    ) -> StorageResult<Vec<GroupedSum>> {
        let state = self.inner.lock().await;
        query::sum_blocked_expenses(
            state.expenses.values(),
            collective_ids,
            window,
        )
    }

    async fn sum_in_host_currency(
        &self,
        collective_ids: &[CollectiveId],
        host_id: CollectiveId,
        until: DateTime<Utc>,
    ) -> StorageResult<Vec<CollectiveBalance>> {
        let state = self.inner.lock().await;
        query::sum_in_host_currency(
            state.transactions.values(),
            collective_ids,
            host_id,
            until,
        )
    }

    async fn transactions(&self, filter: &TransactionFilter) -> StorageResult<Vec<Transaction>> {
        let state = self.inner.lock().await;
        Ok(query::filter_transactions(state.transactions.values(), filter))
    }

    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        let state = self.inner.lock().await;
        Ok(state.subscriptions.values().cloned().collect())
    }
}

#[async_trait]
impl LedgerWriter for MemoryLedger {
    async fn insert_transactions(
        &self,
        rows: Vec<Transaction>,
    ) -> StorageResult<Vec<Transaction>> {
        let mut state = self.inner.lock().await;
        let mut next_id = state.next_transaction_id();
        let stored: Vec<Transaction> = rows
            .into_iter()
            .map(|mut tx| {
                tx.id = next_id;
                next_id += 1;
                tx
            })
            .collect();
        for tx in &stored {
            state.transactions.insert(tx.id, tx.clone());
        }
        debug!(count = stored.len(), "Inserted transactions");
        Ok(stored)
    }

    async fn expense(&self, id: ExpenseId) -> StorageResult<Option<Expense>> {
        let state = self.inner.lock().await;
        Ok(state.expenses.get(&id).cloned())
    }

    async fn update_expense(&self, expense: &Expense) -> StorageResult<()> {
        let mut state = self.inner.lock().await;
        state.expenses.insert(expense.id, expense.clone());
        Ok(())
    }

    async fn record_paid_expense(
        &self,
        mut debit: Transaction,
        expense: &Expense,
    ) -> StorageResult<Option<Transaction>> {
        let mut state = self.inner.lock().await;
        let inserted = if query::has_expense_debit(state.transactions.values(), expense.id) {
            debug!(expense = expense.id, "Expense already has a DEBIT");
            None
        } else {
            debit.id = state.next_transaction_id();
            state.transactions.insert(debit.id, debit.clone());
            Some(debit)
        };
        state.expenses.insert(expense.id, expense.clone());
        Ok(inserted)
    }

    async fn card_accounts(&self) -> StorageResult<Vec<CardAccount>> {
        let state = self.inner.lock().await;
        Ok(state.card_accounts.values().cloned().collect())
    }

    async fn cards_for_host(&self, host_id: CollectiveId) -> StorageResult<Vec<PaymentMethod>> {
        let state = self.inner.lock().await;
        Ok(state
            .payment_methods
            .values()
            .filter(|card| card.host_collective_id == host_id)
            .cloned()
            .collect())
    }

    async fn last_transaction_at(
        &self,
        payment_method_id: PaymentMethodId,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        let state = self.inner.lock().await;
        Ok(query::last_transaction_at(
            state.transactions.values(),
            payment_method_id,
        ))
    }

    async fn import(&self, snapshot: LedgerSnapshot) -> StorageResult<()> {
        let mut state = self.inner.lock().await;
        for collective in snapshot.collectives {
            state.collectives.insert(collective.id, collective);
        }
        let mut next_id =
            query::first_free_id(state.next_transaction_id(), &snapshot.transactions);
        for mut tx in snapshot.transactions {
            if tx.id == 0 {
                tx.id = next_id;
                next_id += 1;
            }
            state.transactions.insert(tx.id, tx);
        }
        for expense in snapshot.expenses {
            state.expenses.insert(expense.id, expense);
        }
        for subscription in snapshot.subscriptions {
            state.subscriptions.insert(subscription.id, subscription);
        }
        for account in snapshot.card_accounts {
            state
                .card_accounts
                .insert(account.host_collective_id, account);
        }
        for card in snapshot.payment_methods {
            state.payment_methods.insert(card.id, card);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::TransactionKind;

    fn debit(collective_id: CollectiveId, amount: i64) -> Transaction {
        Transaction {
            id: 0,
            collective_id,
            host_collective_id: Some(10),
            kind: TransactionKind::Debit,
            description: "Card charge".to_string(),
            currency: "USD".to_string(),
            amount,
            net_amount: amount,
            host_currency: Some("USD".to_string()),
            amount_in_host_currency: amount,
            host_currency_fx_rate: 1.0,
            platform_fee_in_host_currency: 0,
            host_fee_in_host_currency: 0,
            payment_processor_fee_in_host_currency: 0,
            tax_amount: None,
            created_at: Utc::now(),
            refund_transaction_id: None,
            deleted_at: None,
            payment_method_id: Some(4),
            subscription_id: None,
            expense_id: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let ledger = MemoryLedger::new();
        let first = ledger
            .insert_transactions(vec![debit(1, -100), debit(1, -200)])
            .await
            .unwrap();
        assert_eq!(first.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);

        let second = ledger.insert_transactions(vec![debit(2, -5)]).await.unwrap();
        assert_eq!(second[0].id, 3);

        let filter = TransactionFilter {
            collective_ids: vec![1, 2],
            ..Default::default()
        };
        assert_eq!(ledger.transactions(&filter).await.unwrap().len(), 3);
        assert!(ledger.last_transaction_at(4).await.unwrap().is_some());
        assert!(ledger.last_transaction_at(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_import_keeps_rows_without_id_next_to_explicit_ids() {
        let mut explicit = debit(1, -200);
        explicit.id = 1;
        let ledger = MemoryLedger::from_snapshot(LedgerSnapshot {
            transactions: vec![debit(1, -100), explicit],
            ..Default::default()
        })
        .await
        .unwrap();

        let filter = TransactionFilter {
            collective_ids: vec![1],
            ..Default::default()
        };
        let rows = ledger.transactions(&filter).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|t| t.amount).sum::<i64>(), -300);
        let stored = ledger.insert_transactions(vec![debit(1, -1)]).await.unwrap();
        assert_eq!(stored[0].id, 3);
    }

    #[tokio::test]
    async fn test_import_replaces_records_by_id() {
        let ledger = MemoryLedger::new();
        let collective = Collective {
            id: 1,
            slug: "webpack".to_string(),
            name: "Webpack".to_string(),
            currency: "USD".to_string(),
            budget_version: None,
            is_host: false,
            is_active: true,
            host_collective_id: Some(10),
        };
        let mut renamed = collective.clone();
        renamed.name = "webpack-contrib".to_string();

        ledger
            .import(LedgerSnapshot {
                collectives: vec![collective],
                ..Default::default()
            })
            .await
            .unwrap();
        ledger
            .import(LedgerSnapshot {
                collectives: vec![renamed],
                ..Default::default()
            })
            .await
            .unwrap();

        let stored = ledger.collective(1).await.unwrap().unwrap();
        assert_eq!(stored.name, "webpack-contrib");
        assert_eq!(ledger.hosted_collectives(10).await.unwrap().len(), 1);
    }
}
