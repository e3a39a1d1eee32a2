use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::core::currency::CurrencyRateProvider;

pub const DEFAULT_BASE_URL: &str = "https://api.frankfurter.app";

// FX oracle backed by a Frankfurter-compatible HTTP API
pub struct FrankfurterRateProvider {
    base_url: String,
    client: reqwest::Client,
}

impl FrankfurterRateProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("fundledger/0.1")
            .build()?;
        Ok(FrankfurterRateProvider {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, at: Option<DateTime<Utc>>) -> String {
        let day = at.map_or("latest".to_string(), |at| {
            at.date_naive().format("%Y-%m-%d").to_string()
        });
        format!("{}/{}", self.base_url, day)
    }
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, f64>,
}

#[async_trait]
impl CurrencyRateProvider for FrankfurterRateProvider {
    #[instrument(name = "FrankfurterRateFetch", skip(self))]
    async fn get_rate(&self, from: &str, to: &str, at: Option<DateTime<Utc>>) -> Result<f64> {
        let url = format!("{}?from={}&to={}", self.endpoint(at), from, to);
        debug!("Requesting currency rate from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("Request error: {} for currency pair: {}{}", e, from, to))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "HTTP error: {} for currency pair: {}{}",
                response.status(),
                from,
                to
            ));
        }

        let text = response.text().await?;
        let data: RatesResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse JSON response for {}{}: {}", from, to, e))?;

        data.rates
            .get(to)
            .copied()
            .ok_or_else(|| anyhow!("No rate data found for currency pair: {}{}", from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_successful_latest_rate_fetch() {
        let mock_server = MockServer::start().await;
        let provider = FrankfurterRateProvider::new(&mock_server.uri()).unwrap();

        let mock_response = r#"{
            "amount": 1.0,
            "base": "USD",
            "date": "2024-05-10",
            "rates": { "EUR": 0.9281 }
        }"#;

        Mock::given(method("GET"))
            .and(path("/latest"))
            .and(query_param("from", "USD"))
            .and(query_param("to", "EUR"))
            .respond_with(ResponseTemplate::new(200).set_body_string(mock_response))
            .mount(&mock_server)
            .await;

        let rate = provider
            .get_rate("USD", "EUR", None)
            .await
            .expect("Failed to get rate");
        assert_eq!(rate, 0.9281);
    }

    #[tokio::test]
    async fn test_historical_rate_uses_dated_endpoint() {
        let mock_server = MockServer::start().await;
        let provider = FrankfurterRateProvider::new(&mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .and(path("/2021-02-01"))
            .and(query_param("from", "EUR"))
            .and(query_param("to", "USD"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"rates": {"USD": 1.2066}}"#),
            )
            .mount(&mock_server)
            .await;

        let at = Utc.with_ymd_and_hms(2021, 2, 1, 15, 30, 0).unwrap();
        let rate = provider.get_rate("EUR", "USD", Some(at)).await.unwrap();
        assert_eq!(rate, 1.2066);
    }

    #[tokio::test]
    async fn test_missing_rate_in_response() {
        let mock_server = MockServer::start().await;
        let provider = FrankfurterRateProvider::new(&mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"rates": {}}"#))
            .mount(&mock_server)
            .await;

        let result = provider.get_rate("USD", "EUR", None).await;
        assert_eq!(
            result.unwrap_err().to_string(),
            "No rate data found for currency pair: USDEUR"
        );
    }

    #[tokio::test]
    async fn test_api_error_response() {
        let mock_server = MockServer::start().await;
        let provider = FrankfurterRateProvider::new(&mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let result = provider.get_rate("USD", "EUR", None).await;
        assert_eq!(
            result.unwrap_err().to_string(),
            "HTTP error: 500 Internal Server Error for currency pair: USDEUR"
        );
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let mock_server = MockServer::start().await;
        let provider = FrankfurterRateProvider::new(&mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"rate": 1.0}"#))
            .mount(&mock_server)
            .await;

        let result = provider.get_rate("USD", "EUR", None).await;
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse JSON response for USDEUR")
        );
    }
}
