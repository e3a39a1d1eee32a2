pub mod cli;
pub mod core;
pub mod providers;
pub mod store;

pub use crate::core::config;

use crate::core::budget::{Budget, BudgetOptions, LedgerBudget};
use crate::core::currency::CurrencyRateProvider;
use crate::core::ledger::LedgerStore;
use crate::core::model::{Collective, CollectiveId, SchemeVersion};
use crate::providers::caching::{CachedBudget, CachingCurrencyRateProvider};
use crate::providers::fixed_rates::FixedRateProvider;
use crate::providers::frankfurter::{DEFAULT_BASE_URL, FrankfurterRateProvider};
use crate::store::disk::DiskLedger;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Options shared by the balance-style commands.
#[derive(Debug, Clone, Default)]
pub struct BalanceQuery {
    pub currency: Option<String>,
    pub version: Option<SchemeVersion>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub fx_date: Option<DateTime<Utc>>,
    pub blocked_funds: bool,
    pub include_refunded: bool,
}

impl BalanceQuery {
    pub fn options(&self) -> BudgetOptions {
        BudgetOptions {
            start_date: self.start_date,
            end_date: self.end_date,
            currency: self.currency.clone(),
            version: self.version,
            with_blocked_funds: self.blocked_funds,
            include_refunded: self.include_refunded,
            fx_date: self.fx_date,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppCommand {
    Import {
        file: PathBuf,
    },
    Balance {
        collective_id: CollectiveId,
        query: BalanceQuery,
    },
    Balances {
        collective_ids: Vec<CollectiveId>,
        query: BalanceQuery,
    },
    MoneyManaged {
        host_id: CollectiveId,
        query: BalanceQuery,
    },
    YearlyIncome {
        collective_id: CollectiveId,
    },
    HostSnapshot {
        host_id: CollectiveId,
        collective_ids: Vec<CollectiveId>,
        as_of: Option<DateTime<Utc>>,
    },
}

pub fn load_config(config_path: Option<&str>) -> Result<config::AppConfig> {
    let config = match config_path {
        Some(path) => config::AppConfig::load_from_path(path)?,
        None => config::AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");
    Ok(config)
}

/// Builds the FX oracle: the fixed table when configured, otherwise the HTTP
/// provider behind a rate cache.
pub fn rate_provider(config: &config::AppConfig) -> Result<Arc<dyn CurrencyRateProvider>> {
    if let Some(rates) = &config.providers.fixed_rates {
        debug!("Using {} fixed FX rates", rates.len());
        return Ok(Arc::new(FixedRateProvider::new(rates)));
    }
    let base_url = config
        .providers
        .frankfurter
        .as_ref()
        .map_or(DEFAULT_BASE_URL, |p| p.base_url.as_str());
    let provider = FrankfurterRateProvider::new(base_url)?;
    Ok(Arc::new(CachingCurrencyRateProvider::new(provider)))
}

async fn find_collective(store: &dyn LedgerStore, id: CollectiveId) -> Result<Collective> {
    store
        .collective(id)
        .await?
        .with_context(|| format!("Collective {id} not found"))
}

/// Runs a command against the configured ledger and returns the rendered output.
pub async fn execute(command: AppCommand, config: &config::AppConfig) -> Result<String> {
    let data_path = config.default_data_path()?;
    let store = Arc::new(
        DiskLedger::open(&data_path)
            .with_context(|| format!("Failed to open ledger at {}", data_path.display()))?,
    );

    let budget = CachedBudget::new(
        LedgerBudget::new(store.clone(), rate_provider(config)?)
            .with_fallback_currency(&config.currency),
    );

    let output = match command {
        AppCommand::Import { file } => {
            let count = cli::import::import_file(store.as_ref(), &file).await?;
            format!("Imported {count} records from {}", file.display())
        }
        AppCommand::Balance {
            collective_id,
            query,
        } => {
            let collective = find_collective(store.as_ref(), collective_id).await?;
            cli::balances::CollectiveReport::build(&budget, &collective, &query.options())
                .await?
                .display_as_table()
        }
        AppCommand::Balances {
            collective_ids,
            query,
        } => {
            let balances = budget.balances(&collective_ids, &query.options()).await?;
            cli::balances::display_balances(&balances)
        }
        AppCommand::MoneyManaged { host_id, query } => {
            let host = find_collective(store.as_ref(), host_id).await?;
            let managed = budget.total_money_managed(&host, &query.options()).await?;
            cli::host::display_money_managed(&host, &managed)
        }
        AppCommand::YearlyIncome { collective_id } => {
            let collective = find_collective(store.as_ref(), collective_id).await?;
            let income = budget.yearly_income(&collective).await?;
            cli::host::display_yearly_income(&collective, income)
        }
        AppCommand::HostSnapshot {
            host_id,
            collective_ids,
            as_of,
        } => {
            let host = find_collective(store.as_ref(), host_id).await?;
            let balances = budget
                .balances_in_host_currency(&collective_ids, host_id, as_of)
                .await?;
            cli::host::display_host_snapshot(&host, &balances)
        }
    };
    Ok(output)
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("fundledger starting...");
    let config = load_config(config_path)?;
    let output = execute(command, &config).await?;
    println!("{output}");
    Ok(())
}

