//! Card transaction reconciliation job.
//!
//! Pulls settled card transactions from the issuer for every connected host
//! and records them as DEBIT rows on the card's collective.

use crate::core::budget::convert_amount;
use crate::core::currency::CurrencyRateProvider;
use crate::core::ledger::LedgerWriter;
use crate::core::model::{
    CardAccount, Collective, CollectiveId, PaymentMethod, PaymentMethodId, Transaction,
    TransactionKind,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const PAGE_SIZE: usize = 200;

/// Earliest date the issuer is queried from for a card that was never synced.
pub fn start_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardTransaction {
    pub token: String,
    /// Positive spend in the card's currency, minor units.
    pub amount: i64,
    pub created: DateTime<Utc>,
    pub merchant_descriptor: String,
}

/// Card issuer API.
#[async_trait]
pub trait CardTransactionSource: Send + Sync {
    async fn list_transactions(
        &self,
        account_token: &str,
        card_token: &str,
        begin: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<CardTransaction>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub hosts: usize,
    pub cards: usize,
    /// Rows found at the issuer; only inserted when not running dry.
    pub fetched: usize,
    pub inserted: usize,
    pub failed_hosts: Vec<CollectiveId>,
    /// Cards whose rows could not be recorded; the rest of their host still syncs.
    pub failed_cards: Vec<PaymentMethodId>,
}

pub struct CardReconciler {
    store: Arc<dyn LedgerWriter>,
    source: Arc<dyn CardTransactionSource>,
    rates: Arc<dyn CurrencyRateProvider>,
}

impl CardReconciler {
    pub fn new(
        store: Arc<dyn LedgerWriter>,
        source: Arc<dyn CardTransactionSource>,
        rates: Arc<dyn CurrencyRateProvider>,
    ) -> Self {
        Self {
            store,
            source,
            rates,
        }
    }

    pub async fn run(&self, dry_run: bool) -> Result<ReconcileSummary> {
        info!("Reconciling card transactions...");
        if dry_run {
            warn!("Running DRY, no changes to the ledger");
        }

        let accounts = self.store.card_accounts().await?;
        info!("Found {} connected card accounts...", accounts.len());

        let mut summary = ReconcileSummary::default();
        for account in &accounts {
            summary.hosts += 1;
            if let Err(e) = self.sync_host(account, dry_run, &mut summary).await {
                warn!("Error while syncing host {}", account.host_collective_id);
                error!("{e:#}");
                summary.failed_hosts.push(account.host_collective_id);
            }
        }
        Ok(summary)
    }

    async fn sync_host(
        &self,
        account: &CardAccount,
        dry_run: bool,
        summary: &mut ReconcileSummary,
    ) -> Result<()> {
        let host = self
            .store
            .collective(account.host_collective_id)
            .await?
            .ok_or_else(|| anyhow!("Host {} not found", account.host_collective_id))?;
        let cards = self.store.cards_for_host(host.id).await?;
        info!(
            "Found {} cards connected to host #{} {}...",
            cards.len(),
            host.id,
            host.slug
        );

        for card in &cards {
            summary.cards += 1;
            let rows = self.fetch_card(account, &host, card).await?;
            summary.fetched += rows.len();
            if dry_run {
                info!("Found {} pending transactions...", rows.len());
                debug!(?rows);
                continue;
            }
            info!("Syncing {} pending transactions...", rows.len());
            if rows.is_empty() {
                continue;
            }
            match self.store.insert_transactions(rows).await {
                Ok(stored) => summary.inserted += stored.len(),
                Err(e) => {
                    warn!("Error while syncing host {}", host.id);
                    error!(card = card.id, "{e}");
                    summary.failed_cards.push(card.id);
                }
            }
        }
        Ok(())
    }

    async fn fetch_card(
        &self,
        account: &CardAccount,
        host: &Collective,
        card: &PaymentMethod,
    ) -> Result<Vec<Transaction>> {
        let begin = match self.store.last_transaction_at(card.id).await? {
            Some(last) => last + Duration::seconds(1),
            None => start_date(),
        };
        info!("Fetching transactions since {}", begin.to_rfc3339());

        let fetched = self
            .source
            .list_transactions(&account.token, &card.token, begin, PAGE_SIZE)
            .await?;
        let rate = if card.currency == host.currency {
            1.0
        } else {
            self.rates
                .get_rate(&card.currency, &host.currency, None)
                .await
                .with_context(|| format!("No FX rate from {} to {}", card.currency, host.currency))?
        };

        Ok(fetched
            .into_iter()
            .map(|t| card_debit(&t, card, host, rate))
            .collect())
    }
}

fn card_debit(
    spend: &CardTransaction,
    card: &PaymentMethod,
    host: &Collective,
    rate: f64,
) -> Transaction {
    let amount = -spend.amount;
    Transaction {
        id: 0,
        collective_id: card.collective_id,
        host_collective_id: Some(card.host_collective_id),
        kind: TransactionKind::Debit,
        description: spend.merchant_descriptor.clone(),
        currency: card.currency.clone(),
        amount,
        net_amount: amount,
        host_currency: Some(host.currency.clone()),
        amount_in_host_currency: convert_amount(amount, rate),
        host_currency_fx_rate: rate,
        platform_fee_in_host_currency: 0,
        host_fee_in_host_currency: 0,
        payment_processor_fee_in_host_currency: 0,
        tax_amount: None,
        created_at: spend.created,
        refund_transaction_id: None,
        deleted_at: None,
        payment_method_id: Some(card.id),
        subscription_id: None,
        expense_id: None,
    }
}
