use chrono::{Duration, Utc};
use fundledger::config::AppConfig;
use fundledger::{AppCommand, BalanceQuery};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing::info;

mod test_utils {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub async fn create_fx_mock_server(from: &str, to: &str, rate: f64) -> MockServer {
        let mock_server = MockServer::start().await;
        let body = format!(r#"{{"amount": 1.0, "base": "{from}", "rates": {{"{to}": {rate}}}}}"#);

        Mock::given(method("GET"))
            .and(path("/latest"))
            .and(query_param("from", from))
            .and(query_param("to", to))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;

        mock_server
    }
}

/// Host 9 (USD) hosting collective 1 (EUR) and collective 2 (USD).
fn write_ledger(dir: &Path) -> std::path::PathBuf {
    let recent = (Utc::now() - Duration::days(30)).to_rfc3339();
    let older = (Utc::now() - Duration::days(20)).to_rfc3339();
    let ledger = json!({
        "collectives": [
            {"id": 9, "slug": "host", "name": "Fiscal Host", "currency": "USD", "is_host": true},
            {"id": 1, "slug": "eur-project", "name": "EUR Project", "currency": "EUR", "host_collective_id": 9},
            {"id": 2, "slug": "usd-project", "name": "USD Project", "currency": "USD", "host_collective_id": 9}
        ],
        "subscriptions": [
            {"id": 1, "interval": "month", "is_active": true}
        ],
        "transactions": [
            {
                "collective_id": 1, "host_collective_id": 9, "kind": "CREDIT",
                "currency": "EUR", "amount": 10000, "net_amount": 9500,
                "host_currency": "USD", "amount_in_host_currency": 11000,
                "host_currency_fx_rate": 1.1,
                "payment_processor_fee_in_host_currency": -550,
                "created_at": recent
            },
            {
                "collective_id": 2, "host_collective_id": 9, "kind": "CREDIT",
                "currency": "USD", "amount": 30000, "net_amount": 30000,
                "host_currency": "USD", "amount_in_host_currency": 30000,
                "subscription_id": 1,
                "created_at": recent
            },
            {
                "collective_id": 2, "host_collective_id": 9, "kind": "DEBIT",
                "currency": "USD", "amount": -5000, "net_amount": -5000,
                "host_currency": "USD", "amount_in_host_currency": -5000,
                "created_at": older
            }
        ]
    });
    let path = dir.join("ledger.json");
    fs::write(&path, serde_json::to_string_pretty(&ledger).unwrap()).unwrap();
    path
}

fn write_config(dir: &Path, providers: &str) -> AppConfig {
    let config_path = dir.join("config.yaml");
    let content = format!(
        "currency: \"USD\"\ndata_path: \"{}\"\n{}",
        dir.join("data").display(),
        providers
    );
    fs::write(&config_path, content).expect("Failed to write config file");
    AppConfig::load_from_path(&config_path).expect("Failed to load config")
}

const FIXED_RATES: &str = r#"
providers:
  fixed_rates:
    - from: "EUR"
      to: "USD"
      rate: 1.1
"#;

#[test_log::test(tokio::test)]
async fn test_full_app_flow_with_fixed_rates() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), FIXED_RATES);
    let ledger = write_ledger(dir.path());

    let imported = fundledger::execute(AppCommand::Import { file: ledger }, &config)
        .await
        .expect("import failed");
    assert!(imported.contains("Imported 7 records"));

    let balances = fundledger::execute(
        AppCommand::Balances {
            collective_ids: vec![1, 2, 3],
            query: BalanceQuery::default(),
        },
        &config,
    )
    .await
    .expect("balances failed");
    info!("\n{balances}");
    assert!(balances.contains("104.50"));
    assert!(balances.contains("250.00"));
    // Unknown collective 3 is still reported with a zero balance
    assert!(balances.contains("0.00"));
    assert!(balances.contains("354.50 USD"));

    let managed = fundledger::execute(
        AppCommand::MoneyManaged {
            host_id: 9,
            query: BalanceQuery::default(),
        },
        &config,
    )
    .await
    .unwrap();
    assert!(managed.contains("354.50 USD"));

    let snapshot = fundledger::execute(
        AppCommand::HostSnapshot {
            host_id: 9,
            collective_ids: vec![1, 2],
            as_of: None,
        },
        &config,
    )
    .await
    .unwrap();
    assert!(snapshot.contains("104.50"));
    assert!(snapshot.contains("354.50 USD"));

    let income = fundledger::execute(AppCommand::YearlyIncome { collective_id: 2 }, &config)
        .await
        .unwrap();
    assert!(income.contains("3600.00 USD"));

    let balance = fundledger::execute(
        AppCommand::Balance {
            collective_id: 1,
            query: BalanceQuery::default(),
        },
        &config,
    )
    .await
    .unwrap();
    assert!(balance.contains("EUR Project"));
    assert!(balance.contains("95.00"));
    assert!(balance.contains("100.00"));
}

#[test_log::test(tokio::test)]
async fn test_full_app_flow_with_fx_mock() {
    let mock_server = test_utils::create_fx_mock_server("EUR", "USD", 1.2).await;
    let dir = TempDir::new().unwrap();
    let providers = format!(
        "providers:\n  frankfurter:\n    base_url: \"{}\"\n",
        mock_server.uri()
    );
    let config = write_config(dir.path(), &providers);
    let ledger = write_ledger(dir.path());

    fundledger::execute(AppCommand::Import { file: ledger }, &config)
        .await
        .unwrap();

    let balances = fundledger::execute(
        AppCommand::Balances {
            collective_ids: vec![1],
            query: BalanceQuery::default(),
        },
        &config,
    )
    .await
    .unwrap();
    assert!(balances.contains("114.00"));
}

#[test_log::test(tokio::test)]
async fn test_unknown_collective_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), FIXED_RATES);

    let result = fundledger::execute(
        AppCommand::Balance {
            collective_id: 42,
            query: BalanceQuery::default(),
        },
        &config,
    )
    .await;
    assert_eq!(result.unwrap_err().to_string(), "Collective 42 not found");
}

#[test_log::test(tokio::test)]
async fn test_run_command_with_config_path() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), FIXED_RATES);
    let ledger = write_ledger(dir.path());
    let config_path = dir.path().join("config.yaml");

    let result = fundledger::run_command(
        AppCommand::Import { file: ledger },
        Some(config_path.to_str().unwrap()),
    )
    .await;
    assert!(
        result.is_ok(),
        "Main function failed with: {:?}",
        result.err()
    );
}
