//! Error types for the ledger library.
//!
//! - [`StorageError`] - ledger store failures and integrity violations
//! - [`BudgetError`] - aggregation failures, always fatal to the single call
//! - [`PayoutError`] - payout reconciliation failures
//!
//! Provider failures (FX oracle, payout and card APIs) arrive as [`anyhow::Error`]
//! and are wrapped without retrying.

use crate::core::model::{CollectiveId, ExpenseId};
use thiserror::Error;

/// Ledger store errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying keyspace failed.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record violates a ledger invariant.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),
}

impl From<fjall::Error> for StorageError {
    fn from(e: fjall::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Aggregation engine errors.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Unknown currency code: {0}")]
    UnknownCurrency(String),

    #[error("Collective not found: {0}")]
    UnknownCollective(CollectiveId),

    /// A host-currency scheme was requested for a collective without a host.
    #[error("Collective {0} has no fiscal host")]
    MissingHost(CollectiveId),

    #[error("Currency conversion failed from {from} to {to}: {source}")]
    FxRate {
        from: String,
        to: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Payout reconciliation errors.
#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("No expenses to pay")]
    EmptyBatch,

    #[error("All expenses should belong to collectives with the same host")]
    MixedHosts,

    #[error("Could not find the host disbursing expense {0}")]
    HostNotFound(ExpenseId),

    /// The reloaded expense no longer carries the batch the item claims.
    #[error("Payout item of batch {reported} does not belong to expense {expense_id}")]
    BatchMismatch {
        expense_id: ExpenseId,
        reported: String,
    },

    #[error("Expense {0} is not part of the payout batch")]
    ItemNotFound(ExpenseId),

    #[error("Expense {0} has no payee email")]
    MissingPayee(ExpenseId),

    #[error("Payout provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T, E = BudgetError> = std::result::Result<T, E>;
