//! Expense payout state machine driven by a batch payment provider.
//!
//! `pending -> processing` on batch submission, then `processing -> paid | error`
//! when a later poll reports the item outcome. Every poll reloads the expense and
//! checks the batch id it carries before changing anything.

use crate::core::budget::convert_amount;
use crate::core::currency::CurrencyRateProvider;
use crate::core::error::{BudgetError, PayoutError, StorageError};
use crate::core::ledger::LedgerWriter;
use crate::core::model::{
    Collective, CollectiveId, Expense, ExpenseId, ExpenseStatus, Transaction, TransactionKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

type Result<T> = std::result::Result<T, PayoutError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutAmount {
    pub currency: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderBatchHeader {
    pub recipient_type: String,
    pub email_message: String,
    pub sender_batch_id: String,
    pub email_subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutItemRequest {
    pub note: String,
    pub amount: PayoutAmount,
    pub receiver: String,
    pub sender_item_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutBatchRequest {
    pub sender_batch_header: SenderBatchHeader,
    pub items: Vec<PayoutItemRequest>,
}

/// Provider acknowledgement of a submitted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub payout_batch_id: String,
    #[serde(default)]
    pub batch_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PayoutItemStatus {
    Success,
    Failed,
    Blocked,
    Refunded,
    Returned,
    Reversed,
    Onhold,
    Unclaimed,
    Pending,
    #[serde(other)]
    Unknown,
}

impl PayoutItemStatus {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            PayoutItemStatus::Failed
                | PayoutItemStatus::Blocked
                | PayoutItemStatus::Refunded
                | PayoutItemStatus::Returned
                | PayoutItemStatus::Reversed
        )
    }
}

/// Per-expense outcome reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutItem {
    pub payout_batch_id: String,
    pub transaction_status: PayoutItemStatus,
    pub sender_item_id: String,
    #[serde(default)]
    pub payout_item_fee: Option<PayoutAmount>,
    #[serde(default)]
    pub errors: Option<Value>,
}

impl PayoutItem {
    /// Provider fee in minor units.
    pub fn fee(&self) -> i64 {
        self.payout_item_fee
            .as_ref()
            .and_then(|fee| fee.value.parse::<f64>().ok())
            .map_or(0, |value| (value * 100.0).round() as i64)
    }
}

/// Batch payment API. Transport and authentication live behind this trait.
#[async_trait]
pub trait PayoutProvider: Send + Sync {
    async fn execute_payouts(
        &self,
        host: &Collective,
        request: &PayoutBatchRequest,
    ) -> anyhow::Result<BatchHeader>;

    async fn batch_items(&self, host: &Collective, batch_id: &str)
    -> anyhow::Result<Vec<PayoutItem>>;
}

/// Amount in major units rounded to two decimals, as the provider expects it.
fn major_units(amount: i64) -> String {
    format!("{:.2}", amount as f64 / 100.0)
}

pub struct PayoutReconciler {
    store: Arc<dyn LedgerWriter>,
    provider: Arc<dyn PayoutProvider>,
    rates: Arc<dyn CurrencyRateProvider>,
}

impl PayoutReconciler {
    pub fn new(
        store: Arc<dyn LedgerWriter>,
        provider: Arc<dyn PayoutProvider>,
        rates: Arc<dyn CurrencyRateProvider>,
    ) -> Self {
        Self {
            store,
            provider,
            rates,
        }
    }

    async fn collective(&self, id: CollectiveId) -> Result<Collective> {
        self.store
            .collective(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("collective {id}")).into())
    }

    async fn host_of(&self, expense: &Expense) -> Result<(Collective, Collective)> {
        let collective = self.collective(expense.collective_id).await?;
        let host_id = collective
            .host_collective_id
            .ok_or(PayoutError::HostNotFound(expense.id))?;
        let host = self
            .store
            .collective(host_id)
            .await?
            .ok_or(PayoutError::HostNotFound(expense.id))?;
        Ok((collective, host))
    }

    pub async fn pay_expenses_batch(&self, expenses: &[Expense]) -> Result<Vec<Expense>> {
        self.pay_expenses_batch_at(expenses, Utc::now()).await
    }

    /// Submits one provider batch for expenses of collectives sharing a host.
    #[instrument(skip(self, expenses), fields(count = expenses.len()))]
    pub async fn pay_expenses_batch_at(
        &self,
        expenses: &[Expense],
        now: DateTime<Utc>,
    ) -> Result<Vec<Expense>> {
        let first = expenses.first().ok_or(PayoutError::EmptyBatch)?;
        let (collective, host) = self.host_of(first).await?;

        for expense in &expenses[1..] {
            let other = self.collective(expense.collective_id).await?;
            if other.host_collective_id != Some(host.id) {
                return Err(PayoutError::MixedHosts);
            }
        }

        let items = expenses
            .iter()
            .map(|e| {
                let receiver = e.payee_email.clone().ok_or(PayoutError::MissingPayee(e.id))?;
                Ok(PayoutItemRequest {
                    note: format!("Expense #{}: {}", e.id, e.description),
                    amount: PayoutAmount {
                        currency: e.currency.clone(),
                        value: major_units(e.amount),
                    },
                    receiver,
                    sender_item_id: e.id.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let request = PayoutBatchRequest {
            sender_batch_header: SenderBatchHeader {
                recipient_type: "EMAIL".to_string(),
                email_message: "Good news, your expense was paid!".to_string(),
                sender_batch_id: format!("{}-{}", collective.slug, now.format("%d%m%Y-%H%M")),
                email_subject: format!("Expense Payout for {}", collective.name),
            },
            items,
        };

        let outcome = self.provider.execute_payouts(&host, &request).await;
        let mut updated = Vec::with_capacity(expenses.len());
        for expense in expenses {
            let mut expense = expense.clone();
            match &outcome {
                Ok(header) => {
                    if let Value::Object(fields) = serde_json::to_value(header)
                        .map_err(StorageError::from)?
                    {
                        expense.data.extend(fields);
                    }
                    expense.status = ExpenseStatus::Processing;
                }
                Err(e) => {
                    warn!(expense = expense.id, "Payout batch submission failed: {e}");
                    expense
                        .data
                        .insert("error".to_string(), json!({ "message": e.to_string() }));
                    expense.status = ExpenseStatus::Error;
                }
            }
            self.store.update_expense(&expense).await?;
            updated.push(expense);
        }

        if let Ok(header) = &outcome {
            info!(
                batch = %header.payout_batch_id,
                host = host.id,
                "Submitted payout batch"
            );
        }
        Ok(updated)
    }

    /// DEBIT row recording a paid expense in the collective's ledger.
    async fn paid_expense_transaction(
        &self,
        expense: &Expense,
        host: &Collective,
        fee_in_host_currency: i64,
    ) -> Result<Transaction> {
        let rate = if expense.currency == host.currency {
            1.0
        } else {
            self.rates
                .get_rate(&expense.currency, &host.currency, None)
                .await
                .map_err(|source| BudgetError::FxRate {
                    from: expense.currency.clone(),
                    to: host.currency.clone(),
                    source,
                })?
        };
        let fee = if rate == 0.0 {
            0
        } else {
            convert_amount(fee_in_host_currency, 1.0 / rate)
        };

        Ok(Transaction {
            id: 0,
            collective_id: expense.collective_id,
            host_collective_id: Some(host.id),
            kind: TransactionKind::Debit,
            description: expense.description.clone(),
            currency: expense.currency.clone(),
            amount: -expense.amount,
            net_amount: -expense.amount - fee,
            host_currency: Some(host.currency.clone()),
            amount_in_host_currency: -convert_amount(expense.amount, rate),
            host_currency_fx_rate: rate,
            platform_fee_in_host_currency: 0,
            host_fee_in_host_currency: 0,
            payment_processor_fee_in_host_currency: -fee_in_host_currency,
            tax_amount: None,
            created_at: Utc::now(),
            refund_transaction_id: None,
            deleted_at: None,
            payment_method_id: None,
            subscription_id: None,
            expense_id: Some(expense.id),
        })
    }

    /// Applies one polled item to its expense.
    #[instrument(skip(self, item, host), fields(status = ?item.transaction_status))]
    pub async fn check_batch_item_status(
        &self,
        item: &PayoutItem,
        expense_id: ExpenseId,
        host: &Collective,
    ) -> Result<Expense> {
        let mut expense = self
            .store
            .expense(expense_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("expense {expense_id}")))?;

        if expense.payout_batch_id() != Some(item.payout_batch_id.as_str()) {
            return Err(PayoutError::BatchMismatch {
                expense_id,
                reported: item.payout_batch_id.clone(),
            });
        }

        let item_data = match serde_json::to_value(item).map_err(StorageError::from)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };

        match item.transaction_status {
            PayoutItemStatus::Success if expense.status != ExpenseStatus::Paid => {
                let debit = self
                    .paid_expense_transaction(&expense, host, item.fee())
                    .await?;
                expense.status = ExpenseStatus::Paid;
                expense.data = item_data;
                if self.store.record_paid_expense(debit, &expense).await?.is_some() {
                    info!(expense = expense_id, "Expense paid");
                }
                return Ok(expense);
            }
            PayoutItemStatus::Success => {}
            status if status.is_error() => {
                if expense.status != ExpenseStatus::Error {
                    warn!(expense = expense_id, errors = ?item.errors, "Payout item failed");
                    expense.status = ExpenseStatus::Error;
                }
            }
            _ => debug!("Expense is still being processed, nothing to do but wait"),
        }

        expense.data = item_data;
        self.store.update_expense(&expense).await?;
        Ok(expense)
    }

    /// Polls a submitted batch and applies each item. Failures for one expense
    /// are logged and the remaining expenses are still processed.
    pub async fn check_batch_status(&self, batch: &[Expense]) -> Result<Vec<Expense>> {
        let first = batch.first().ok_or(PayoutError::EmptyBatch)?;
        let (_, host) = self.host_of(first).await?;
        let batch_id = first
            .payout_batch_id()
            .ok_or(PayoutError::ItemNotFound(first.id))?;

        let items = self
            .provider
            .batch_items(&host, batch_id)
            .await
            .map_err(PayoutError::Provider)?;

        let mut checked = Vec::with_capacity(batch.len());
        for expense in batch {
            let id = expense.id.to_string();
            let outcome = match items.iter().find(|item| item.sender_item_id == id) {
                Some(item) => self.check_batch_item_status(item, expense.id, &host).await,
                None => Err(PayoutError::ItemNotFound(expense.id)),
            };
            match outcome {
                Ok(expense) => checked.push(expense),
                Err(e) => error!(expense = expense.id, "Failed to check payout item: {e}"),
            }
        }
        Ok(checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::{LedgerStore, TransactionFilter};
    use crate::core::model::LedgerSnapshot;
    use crate::providers::fixed_rates::FixedRateProvider;
    use crate::store::memory::MemoryLedger;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockPayoutProvider {
        fail: bool,
        items: Vec<PayoutItem>,
        requests: Mutex<Vec<PayoutBatchRequest>>,
    }

    #[async_trait]
    impl PayoutProvider for MockPayoutProvider {
        async fn execute_payouts(
            &self,
            _host: &Collective,
            request: &PayoutBatchRequest,
        ) -> anyhow::Result<BatchHeader> {
            self.requests.lock().await.push(request.clone());
            if self.fail {
                return Err(anyhow!("Receiver is unregistered"));
            }
            Ok(BatchHeader {
                payout_batch_id: "BATCH-1".to_string(),
                batch_status: Some("PENDING".to_string()),
            })
        }

        async fn batch_items(
            &self,
            _host: &Collective,
            _batch_id: &str,
        ) -> anyhow::Result<Vec<PayoutItem>> {
            Ok(self.items.clone())
        }
    }

    fn collective(id: CollectiveId, host: Option<CollectiveId>, currency: &str) -> Collective {
        Collective {
            id,
            slug: format!("collective-{id}"),
            name: format!("Collective {id}"),
            currency: currency.to_string(),
            budget_version: None,
            is_host: host.is_none(),
            is_active: true,
            host_collective_id: host,
        }
    }

    fn expense(id: ExpenseId, collective_id: CollectiveId, status: ExpenseStatus) -> Expense {
        Expense {
            id,
            collective_id,
            description: "Stickers".to_string(),
            amount: 1234,
            currency: "EUR".to_string(),
            status,
            payee_email: Some("payee@example.com".to_string()),
            data: Map::new(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            deleted_at: None,
            last_edited_by: Some(7),
        }
    }

    fn processing(id: ExpenseId, collective_id: CollectiveId, batch: &str) -> Expense {
        let mut e = expense(id, collective_id, ExpenseStatus::Processing);
        e.data
            .insert("payout_batch_id".to_string(), json!(batch));
        e
    }

    fn item(sender_item_id: ExpenseId, status: PayoutItemStatus, batch: &str) -> PayoutItem {
        PayoutItem {
            payout_batch_id: batch.to_string(),
            transaction_status: status,
            sender_item_id: sender_item_id.to_string(),
            payout_item_fee: Some(PayoutAmount {
                currency: "USD".to_string(),
                value: "0.25".to_string(),
            }),
            errors: None,
        }
    }

    async fn reconciler(
        expenses: Vec<Expense>,
        provider: MockPayoutProvider,
    ) -> (PayoutReconciler, Arc<MemoryLedger>, Arc<MockPayoutProvider>) {
        let store = Arc::new(
            MemoryLedger::from_snapshot(LedgerSnapshot {
                collectives: vec![
                    collective(9, None, "USD"),
                    collective(8, None, "USD"),
                    collective(1, Some(9), "EUR"),
                    collective(2, Some(9), "EUR"),
                    collective(3, Some(8), "EUR"),
                ],
                expenses,
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let provider = Arc::new(provider);
        let rates = Arc::new(FixedRateProvider::default().with_rate("EUR", "USD", 1.1));
        (
            PayoutReconciler::new(store.clone(), provider.clone(), rates),
            store,
            provider,
        )
    }

    #[tokio::test]
    async fn test_pay_batch_marks_expenses_processing() {
        let expenses = vec![
            expense(1, 1, ExpenseStatus::Pending),
            expense(2, 2, ExpenseStatus::Pending),
        ];
        let (reconciler, store, provider) =
            reconciler(expenses.clone(), MockPayoutProvider::default()).await;
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap();

        let updated = reconciler
            .pay_expenses_batch_at(&expenses, now)
            .await
            .unwrap();
        assert!(updated.iter().all(|e| e.status == ExpenseStatus::Processing));

        let stored = store.expense(2).await.unwrap().unwrap();
        assert_eq!(stored.payout_batch_id(), Some("BATCH-1"));
        assert!(stored.is_blocking());

        let requests = provider.requests.lock().await;
        let request = &requests[0];
        assert_eq!(
            request.sender_batch_header.sender_batch_id,
            "collective-1-05032024-1407"
        );
        assert_eq!(request.items[0].note, "Expense #1: Stickers");
        assert_eq!(request.items[0].amount.value, "12.34");
        assert_eq!(request.items[1].sender_item_id, "2");
    }

    #[tokio::test]
    async fn test_pay_batch_rejects_mixed_hosts() {
        let expenses = vec![
            expense(1, 1, ExpenseStatus::Pending),
            expense(3, 3, ExpenseStatus::Pending),
        ];
        let (reconciler, _, provider) =
            reconciler(expenses.clone(), MockPayoutProvider::default()).await;
        let result = reconciler.pay_expenses_batch(&expenses).await;
        assert!(matches!(result, Err(PayoutError::MixedHosts)));
        assert!(provider.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_pay_batch_provider_failure_marks_error() {
        let expenses = vec![expense(1, 1, ExpenseStatus::Pending)];
        let (reconciler, store, _) = reconciler(
            expenses.clone(),
            MockPayoutProvider {
                fail: true,
                ..Default::default()
            },
        )
        .await;

        reconciler.pay_expenses_batch(&expenses).await.unwrap();
        let stored = store.expense(1).await.unwrap().unwrap();
        assert_eq!(stored.status, ExpenseStatus::Error);
        assert_eq!(
            stored.data["error"]["message"],
            json!("Receiver is unregistered")
        );
    }

    #[tokio::test]
    async fn test_success_records_debit_and_marks_paid() {
        let (reconciler, store, _) =
            reconciler(vec![processing(1, 1, "BATCH-1")], MockPayoutProvider::default()).await;
        let host = collective(9, None, "USD");

        let paid = reconciler
            .check_batch_item_status(&item(1, PayoutItemStatus::Success, "BATCH-1"), 1, &host)
            .await
            .unwrap();
        assert_eq!(paid.status, ExpenseStatus::Paid);
        assert_eq!(paid.data["transaction_status"], json!("SUCCESS"));

        let rows = store
            .transactions(&TransactionFilter {
                collective_ids: vec![1],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let debit = &rows[0];
        assert_eq!(debit.kind, TransactionKind::Debit);
        assert_eq!(debit.amount, -1234);
        assert_eq!(debit.amount_in_host_currency, -1357);
        assert_eq!(debit.payment_processor_fee_in_host_currency, -25);
        assert_eq!(debit.expense_id, Some(1));

        // A second poll on the paid expense does not pay twice
        let mut again = store.expense(1).await.unwrap().unwrap();
        again
            .data
            .insert("payout_batch_id".to_string(), json!("BATCH-1"));
        store.update_expense(&again).await.unwrap();
        reconciler
            .check_batch_item_status(&item(1, PayoutItemStatus::Success, "BATCH-1"), 1, &host)
            .await
            .unwrap();
        let rows = store
            .transactions(&TransactionFilter {
                collective_ids: vec![1],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_success_poll_records_one_debit() {
        let (reconciler, store, _) =
            reconciler(vec![processing(1, 1, "BATCH-1")], MockPayoutProvider::default()).await;
        let host = collective(9, None, "USD");
        let success = item(1, PayoutItemStatus::Success, "BATCH-1");

        let (first, second) = tokio::join!(
            reconciler.check_batch_item_status(&success, 1, &host),
            reconciler.check_batch_item_status(&success, 1, &host),
        );
        first.unwrap();
        second.unwrap();

        // Expense still reads as processing, as if its status write had been lost
        store
            .update_expense(&processing(1, 1, "BATCH-1"))
            .await
            .unwrap();
        let paid = reconciler
            .check_batch_item_status(&success, 1, &host)
            .await
            .unwrap();
        assert_eq!(paid.status, ExpenseStatus::Paid);

        let debits = store
            .transactions(&TransactionFilter {
                collective_ids: vec![1],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].expense_id, Some(1));
        assert_eq!(
            store.expense(1).await.unwrap().unwrap().status,
            ExpenseStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_stale_batch_is_rejected() {
        let (reconciler, store, _) =
            reconciler(vec![processing(1, 1, "BATCH-2")], MockPayoutProvider::default()).await;
        let host = collective(9, None, "USD");

        let result = reconciler
            .check_batch_item_status(&item(1, PayoutItemStatus::Success, "BATCH-1"), 1, &host)
            .await;
        assert!(matches!(
            result,
            Err(PayoutError::BatchMismatch { expense_id: 1, .. })
        ));
        let stored = store.expense(1).await.unwrap().unwrap();
        assert_eq!(stored.status, ExpenseStatus::Processing);
    }

    #[tokio::test]
    async fn test_error_and_wait_statuses() {
        let (reconciler, store, _) = reconciler(
            vec![processing(1, 1, "BATCH-1"), processing(2, 2, "BATCH-1")],
            MockPayoutProvider::default(),
        )
        .await;
        let host = collective(9, None, "USD");

        let failed = reconciler
            .check_batch_item_status(&item(1, PayoutItemStatus::Reversed, "BATCH-1"), 1, &host)
            .await
            .unwrap();
        assert_eq!(failed.status, ExpenseStatus::Error);

        let waiting = reconciler
            .check_batch_item_status(&item(2, PayoutItemStatus::Unclaimed, "BATCH-1"), 2, &host)
            .await
            .unwrap();
        assert_eq!(waiting.status, ExpenseStatus::Processing);
        let filter = TransactionFilter {
            collective_ids: vec![1, 2],
            ..Default::default()
        };
        assert!(store.transactions(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_status_continues_past_failures() {
        let batch = vec![
            processing(1, 1, "BATCH-1"),
            processing(2, 2, "BATCH-1"),
            processing(4, 2, "BATCH-1"),
        ];
        let provider = MockPayoutProvider {
            items: vec![
                item(1, PayoutItemStatus::Success, "BATCH-1"),
                item(4, PayoutItemStatus::Pending, "BATCH-1"),
            ],
            ..Default::default()
        };
        let (reconciler, _, _) = reconciler(batch.clone(), provider).await;

        let checked = reconciler.check_batch_status(&batch).await.unwrap();
        let ids: Vec<_> = checked.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(checked[0].status, ExpenseStatus::Paid);
    }

    #[test]
    fn test_unknown_provider_status_waits() {
        let item: PayoutItem = serde_json::from_value(json!({
            "payout_batch_id": "B",
            "transaction_status": "NEW_STATUS",
            "sender_item_id": "1"
        }))
        .unwrap();
        assert_eq!(item.transaction_status, PayoutItemStatus::Unknown);
        assert!(!item.transaction_status.is_error());
        assert_eq!(item.fee(), 0);
    }
}
