//! Ledger records: collectives, transactions, expenses and subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

pub type CollectiveId = u64;
pub type TransactionId = u64;
pub type ExpenseId = u64;
pub type SubscriptionId = u64;
pub type PaymentMethodId = u64;
pub type UserId = u64;

/// Fallback currency used by batch queries that have no collective to default from.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Returns true for three-letter upper-case ISO 4217 style codes.
pub fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// An amount of minor units (cents) in a given currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub value: i64,
    pub currency: String,
}

impl Amount {
    pub fn new(value: i64, currency: &str) -> Self {
        Amount {
            value,
            currency: currency.to_string(),
        }
    }

    pub fn zero(currency: &str) -> Self {
        Self::new(0, currency)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.value < 0 { "-" } else { "" };
        let abs = self.value.unsigned_abs();
        write!(f, "{sign}{}.{:02} {}", abs / 100, abs % 100, self.currency)
    }
}

/// Accounting scheme a collective's balance is computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeVersion {
    /// Collective-currency columns, host assignment not required.
    #[default]
    V1,
    /// Host-currency columns, only transactions with an assigned host count.
    V2,
}

impl Display for SchemeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemeVersion::V1 => write!(f, "v1"),
            SchemeVersion::V2 => write!(f, "v2"),
        }
    }
}

impl FromStr for SchemeVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v1" => Ok(SchemeVersion::V1),
            "v2" => Ok(SchemeVersion::V2),
            _ => Err(anyhow::anyhow!("Invalid budget version: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Collective {
    pub id: CollectiveId,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    pub currency: String,
    #[serde(default)]
    pub budget_version: Option<SchemeVersion>,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub host_collective_id: Option<CollectiveId>,
}

fn default_true() -> bool {
    true
}

impl Collective {
    pub fn scheme_version(&self) -> SchemeVersion {
        self.budget_version.unwrap_or_default()
    }

    pub fn is_hosted_by(&self, host_id: CollectiveId) -> bool {
        self.id != host_id && self.host_collective_id == Some(host_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Credit,
    Debit,
}

/// Immutable ledger entry. Amounts are signed minor units; fees are negative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    #[serde(default)]
    pub id: TransactionId,
    pub collective_id: CollectiveId,
    #[serde(default)]
    pub host_collective_id: Option<CollectiveId>,
    pub kind: TransactionKind,
    #[serde(default)]
    pub description: String,
    pub currency: String,
    pub amount: i64,
    pub net_amount: i64,
    #[serde(default)]
    pub host_currency: Option<String>,
    #[serde(default)]
    pub amount_in_host_currency: i64,
    #[serde(default = "default_fx_rate")]
    pub host_currency_fx_rate: f64,
    #[serde(default)]
    pub platform_fee_in_host_currency: i64,
    #[serde(default)]
    pub host_fee_in_host_currency: i64,
    #[serde(default)]
    pub payment_processor_fee_in_host_currency: i64,
    #[serde(default)]
    pub tax_amount: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub refund_transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_method_id: Option<PaymentMethodId>,
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default)]
    pub expense_id: Option<ExpenseId>,
}

fn default_fx_rate() -> f64 {
    1.0
}

impl Transaction {
    /// Host-currency amount with every fee component and the converted tax applied.
    pub fn net_amount_in_host_currency(&self) -> i64 {
        let tax = self
            .tax_amount
            .map_or(0, |tax| (tax as f64 * self.host_currency_fx_rate).round() as i64);
        self.amount_in_host_currency
            + self.platform_fee_in_host_currency
            + self.host_fee_in_host_currency
            + self.payment_processor_fee_in_host_currency
            + tax
    }

    pub fn is_refunded(&self) -> bool {
        self.refund_transaction_id.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Draft,
    Pending,
    ScheduledForPayment,
    Processing,
    Paid,
    Error,
}

impl Display for ExpenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExpenseStatus::Draft => "DRAFT",
            ExpenseStatus::Pending => "PENDING",
            ExpenseStatus::ScheduledForPayment => "SCHEDULED_FOR_PAYMENT",
            ExpenseStatus::Processing => "PROCESSING",
            ExpenseStatus::Paid => "PAID",
            ExpenseStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Expense {
    pub id: ExpenseId,
    pub collective_id: CollectiveId,
    #[serde(default)]
    pub description: String,
    pub amount: i64,
    pub currency: String,
    pub status: ExpenseStatus,
    #[serde(default)]
    pub payee_email: Option<String>,
    /// Provider correlation data, opaque to the ledger.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_edited_by: Option<UserId>,
}

impl Expense {
    pub fn payout_batch_id(&self) -> Option<&str> {
        self.data
            .get("payout_batch_id")
            .and_then(serde_json::Value::as_str)
    }

    /// Committed but not yet settled as a DEBIT transaction.
    pub fn is_blocking(&self) -> bool {
        match self.status {
            ExpenseStatus::ScheduledForPayment => true,
            ExpenseStatus::Processing => self.payout_batch_id().is_some(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionInterval {
    Month,
    Year,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub interval: SubscriptionInterval,
    pub is_active: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A virtual card attached to a hosted collective.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentMethod {
    pub id: PaymentMethodId,
    pub collective_id: CollectiveId,
    pub host_collective_id: CollectiveId,
    pub currency: String,
    pub token: String,
}

/// A host's connection to the card issuer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardAccount {
    pub host_collective_id: CollectiveId,
    pub token: String,
}

/// A batch of records to load into a ledger store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub collectives: Vec<Collective>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub expenses: Vec<Expense>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub card_accounts: Vec<CardAccount>,
    #[serde(default)]
    pub payment_methods: Vec<PaymentMethod>,
}

impl LedgerSnapshot {
    pub fn len(&self) -> usize {
        self.collectives.len()
            + self.transactions.len()
            + self.expenses.len()
            + self.subscriptions.len()
            + self.card_accounts.len()
            + self.payment_methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
