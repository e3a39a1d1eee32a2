//! Core ledger, aggregation and reconciliation logic

pub mod budget;
pub mod cache;
pub mod config;
pub mod currency;
pub mod error;
pub mod ledger;
pub mod log;
pub mod model;
pub mod payout;
pub mod reconcile;

// Re-export main types for cleaner imports
pub use budget::{Budget, BudgetOptions, LedgerBudget};
pub use currency::CurrencyRateProvider;
pub use error::{BudgetError, PayoutError, StorageError};
pub use ledger::{LedgerStore, LedgerWriter};
pub use model::{Amount, Collective, SchemeVersion};
