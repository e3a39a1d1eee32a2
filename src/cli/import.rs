use super::ui;
use crate::core::ledger::LedgerWriter;
use crate::core::model::LedgerSnapshot;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

const CHUNK_SIZE: usize = 500;

pub fn read_snapshot(path: &Path) -> Result<LedgerSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read ledger file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse ledger file: {}", path.display()))
}

/// Splits a snapshot into import batches. Reference records come first so
/// transactions always land after the collectives they point to.
fn batches(snapshot: LedgerSnapshot) -> Vec<LedgerSnapshot> {
    let mut out = vec![LedgerSnapshot {
        collectives: snapshot.collectives,
        subscriptions: snapshot.subscriptions,
        card_accounts: snapshot.card_accounts,
        payment_methods: snapshot.payment_methods,
        ..Default::default()
    }];
    for chunk in snapshot.expenses.chunks(CHUNK_SIZE) {
        out.push(LedgerSnapshot {
            expenses: chunk.to_vec(),
            ..Default::default()
        });
    }
    for chunk in snapshot.transactions.chunks(CHUNK_SIZE) {
        out.push(LedgerSnapshot {
            transactions: chunk.to_vec(),
            ..Default::default()
        });
    }
    out.retain(|batch| !batch.is_empty());
    out
}

/// Loads a JSON ledger file into the store. Returns the number of records.
pub async fn import_file(store: &dyn LedgerWriter, path: &Path) -> Result<usize> {
    let snapshot = read_snapshot(path)?;
    let total = snapshot.len();
    info!("Importing {} records from {}", total, path.display());

    let pb = ui::new_progress_bar(total as u64, true);
    pb.set_message("Importing");
    for batch in batches(snapshot) {
        let size = batch.len();
        store
            .import(batch)
            .await
            .context("Failed to import ledger records")?;
        pb.inc(size as u64);
    }
    pb.finish_and_clear();
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::{LedgerStore, TransactionFilter};
    use crate::store::memory::MemoryLedger;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_import_file_loads_every_record() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "collectives": [
                    {{"id": 1, "slug": "one", "name": "One", "currency": "USD"}}
                ],
                "transactions": [
                    {{"collective_id": 1, "kind": "CREDIT", "currency": "USD",
                      "amount": 500, "net_amount": 450, "created_at": "2024-01-01T00:00:00Z"}},
                    {{"collective_id": 1, "kind": "DEBIT", "currency": "USD",
                      "amount": -100, "net_amount": -100, "created_at": "2024-01-02T00:00:00Z"}}
                ]
            }}"#
        )
        .unwrap();

        let store = MemoryLedger::new();
        let count = import_file(&store, file.path()).await.unwrap();
        assert_eq!(count, 3);
        assert!(store.collective(1).await.unwrap().is_some());
        let rows = store
            .transactions(&TransactionFilter {
                collective_ids: vec![1],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let result = import_file(&MemoryLedger::new(), file.path()).await;
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse ledger file")
        );
    }

    #[test]
    fn test_batches_chunk_transactions() {
        let empty: LedgerSnapshot = serde_json::from_str(r#"{"collectives": []}"#).unwrap();
        assert!(batches(empty).is_empty());

        let rows: Vec<serde_json::Value> = (0..1200)
            .map(|i| {
                serde_json::json!({
                    "collective_id": 1, "kind": "CREDIT", "currency": "USD",
                    "amount": i, "net_amount": i, "created_at": "2024-01-01T00:00:00Z"
                })
            })
            .collect();
        let snapshot: LedgerSnapshot =
            serde_json::from_value(serde_json::json!({ "transactions": rows })).unwrap();
        let sizes: Vec<usize> = batches(snapshot).iter().map(LedgerSnapshot::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
    }
}
