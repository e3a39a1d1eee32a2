use crate::core::error::StorageError;
use crate::core::ledger::{
    CollectiveBalance, Column, DateWindow, GroupedSum, LedgerStore, LedgerWriter, StorageResult,
    TransactionFilter,
};
use crate::core::model::{
    CardAccount, Collective, CollectiveId, Expense, ExpenseId, LedgerSnapshot, PaymentMethod,
    PaymentMethodId, Subscription, Transaction, TransactionId,
};
use crate::store::query;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

fn key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn encode<V: Serialize>(value: &V) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn load_all<V: DeserializeOwned>(partition: &PartitionHandle) -> StorageResult<Vec<V>> {
    let mut values = Vec::new();
    for item in partition.iter() {
        let (_, value) = item?;
        values.push(serde_json::from_slice(&value)?);
    }
    Ok(values)
}

/// Ledger store persisted in a fjall keyspace, one partition per record kind.
/// Values are JSON, keys are big-endian ids so iteration follows id order.
pub struct DiskLedger {
    keyspace: Keyspace,
    collectives: PartitionHandle,
    transactions: PartitionHandle,
    expenses: PartitionHandle,
    subscriptions: PartitionHandle,
    card_accounts: PartitionHandle,
    payment_methods: PartitionHandle,
    write_lock: Mutex<()>,
}

impl DiskLedger {
    pub fn open(path: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        let keyspace = fjall::Config::new(path.join("ledger")).open()?;
        let open = |name: &str| keyspace.open_partition(name, PartitionCreateOptions::default());

        let collectives = open("collectives")?;
        let transactions = open("transactions")?;
        let expenses = open("expenses")?;
        let subscriptions = open("subscriptions")?;
        let card_accounts = open("card_accounts")?;
        let payment_methods = open("payment_methods")?;
        debug!("Opened ledger keyspace at {}", path.display());

        Ok(Self {
            keyspace,
            collectives,
            transactions,
            expenses,
            subscriptions,
            card_accounts,
            payment_methods,
            write_lock: Mutex::new(()),
        })
    }

    fn next_transaction_id(&self) -> StorageResult<TransactionId> {
        match self.transactions.last_key_value()? {
            Some((last, _)) => {
                let bytes: [u8; 8] = (&last[..])
                    .try_into()
                    .map_err(|_| StorageError::Integrity("malformed transaction key".to_string()))?;
                Ok(u64::from_be_bytes(bytes) + 1)
            }
            None => Ok(1),
        }
    }

    fn all_transactions(&self) -> StorageResult<Vec<Transaction>> {
        load_all(&self.transactions)
    }
}

#[async_trait]
impl LedgerStore for DiskLedger {
    async fn collective(&self, id: CollectiveId) -> StorageResult<Option<Collective>> {
        match self.collectives.get(key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn hosted_collectives(&self, host_id: CollectiveId) -> StorageResult<Vec<Collective>> {
        let collectives: Vec<Collective> = load_all(&self.collectives)?;
        Ok(query::hosted_collectives(&collectives, host_id))
    }

    async fn sum_transactions(
        &self,
        column: Column,
        filter: &TransactionFilter,
    ) -> StorageResult<Vec<GroupedSum>> {
        debug!(?column, ?filter, "Summing transactions on disk");
        query::sum_transactions(&self.all_transactions()?, column, filter)
    }

    async fn sum_blocked_expenses(
        &self,
        collective_ids: &[CollectiveId],
        window: DateWindow,
    ) -> StorageResult<Vec<GroupedSum>> {
        let expenses: Vec<Expense> = load_all(&self.expenses)?;
        query::sum_blocked_expenses(&expenses, collective_ids, window)
    }

    async fn sum_in_host_currency(
        &self,
        collective_ids: &[CollectiveId],
        host_id: CollectiveId,
        until: DateTime<Utc>,
    ) -> StorageResult<Vec<CollectiveBalance>> {
        query::sum_in_host_currency(
            &self.all_transactions()?,
            collective_ids,
            host_id,
            until,
        )
    }

    async fn transactions(&self, filter: &TransactionFilter) -> StorageResult<Vec<Transaction>> {
        Ok(query::filter_transactions(
            &self.all_transactions()?,
            filter,
        ))
    }

    async fn subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        load_all(&self.subscriptions)
    }
}

#[async_trait]
impl LedgerWriter for DiskLedger {
    async fn insert_transactions(
        &self,
        rows: Vec<Transaction>,
    ) -> StorageResult<Vec<Transaction>> {
        let _guard = self.write_lock.lock().await;
        let mut next_id = self.next_transaction_id()?;
        let mut batch = self.keyspace.batch();
        let mut stored = Vec::with_capacity(rows.len());
        for mut tx in rows {
            tx.id = next_id;
            next_id += 1;
            batch.insert(&self.transactions, key(tx.id), encode(&tx)?);
            stored.push(tx);
        }
        batch.commit()?;
        debug!(count = stored.len(), "Committed transaction batch");
        Ok(stored)
    }

    async fn expense(&self, id: ExpenseId) -> StorageResult<Option<Expense>> {
        match self.expenses.get(key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn update_expense(&self, expense: &Expense) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.expenses.insert(key(expense.id), encode(expense)?)?;
        Ok(())
    }

    async fn record_paid_expense(
        &self,
        mut debit: Transaction,
        expense: &Expense,
    ) -> StorageResult<Option<Transaction>> {
        let _guard = self.write_lock.lock().await;
        let mut batch = self.keyspace.batch();
        let inserted = if query::has_expense_debit(&self.all_transactions()?, expense.id) {
            debug!(expense = expense.id, "Expense already has a DEBIT");
            None
        } else {
            debit.id = self.next_transaction_id()?;
            batch.insert(&self.transactions, key(debit.id), encode(&debit)?);
            Some(debit)
        };
        batch.insert(&self.expenses, key(expense.id), encode(expense)?);
        batch.commit()?;
        Ok(inserted)
    }

    async fn card_accounts(&self) -> StorageResult<Vec<CardAccount>> {
        load_all(&self.card_accounts)
    }

    async fn cards_for_host(&self, host_id: CollectiveId) -> StorageResult<Vec<PaymentMethod>> {
        let cards: Vec<PaymentMethod> = load_all(&self.payment_methods)?;
        Ok(cards
            .into_iter()
            .filter(|card| card.host_collective_id == host_id)
            .collect())
    }

    async fn last_transaction_at(
        &self,
        payment_method_id: PaymentMethodId,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(query::last_transaction_at(
            &self.all_transactions()?,
            payment_method_id,
        ))
    }

    async fn import(&self, snapshot: LedgerSnapshot) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let records = snapshot.len();
        let mut next_id =
            query::first_free_id(self.next_transaction_id()?, &snapshot.transactions);
        let mut batch = self.keyspace.batch();

        for collective in &snapshot.collectives {
            batch.insert(&self.collectives, key(collective.id), encode(collective)?);
        }
        for mut tx in snapshot.transactions {
            if tx.id == 0 {
                tx.id = next_id;
                next_id += 1;
            }
            batch.insert(&self.transactions, key(tx.id), encode(&tx)?);
        }
        for expense in &snapshot.expenses {
            batch.insert(&self.expenses, key(expense.id), encode(expense)?);
        }
        for subscription in &snapshot.subscriptions {
            batch.insert(
                &self.subscriptions,
                key(subscription.id),
                encode(subscription)?,
            );
        }
        for account in &snapshot.card_accounts {
            batch.insert(
                &self.card_accounts,
                key(account.host_collective_id),
                encode(account)?,
            );
        }
        for card in &snapshot.payment_methods {
            batch.insert(&self.payment_methods, key(card.id), encode(card)?);
        }
        batch.commit()?;
        debug!(records, "Imported ledger snapshot");
        Ok(())
    }
}
