use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use super::ProviderError;
use crate::domain::Currency;

/// Rates against a common base currency: `1 base = rate units of currency`.
pub type RateTable = HashMap<Currency, BigDecimal>;

#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rates(&self) -> Result<RateTable, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, serde_json::Number>,
}

/// Reads `{"rates": {"HKD": 7.8, ...}}`. Unknown currency codes are ignored.
#[derive(Clone)]
pub struct HttpRateSource {
    client: Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch_rates(&self) -> Result<RateTable, ProviderError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "rate source returned {}",
                response.status()
            )));
        }

        let body: RatesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let mut table = RateTable::new();
        for (code, rate) in body.rates {
            let Ok(currency) = code.parse::<Currency>() else {
                continue;
            };
            let rate = BigDecimal::from_str(&rate.to_string())
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            table.insert(currency, rate);
        }
        Ok(table)
    }
}

/// Rates that never change. Used when no rate source is configured.
#[derive(Clone, Default)]
pub struct StaticRateSource {
    rates: RateTable,
}

impl StaticRateSource {
    pub fn new(rates: RateTable) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch_rates(&self) -> Result<RateTable, ProviderError> {
        Ok(self.rates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_known_currencies() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/latest")
            .with_status(200)
            .with_body(r#"{"base":"USD","rates":{"HKD":7.8,"TWD":32.1,"USD":1,"EUR":0.9}}"#)
            .create_async()
            .await;

        let source = HttpRateSource::new(format!("{}/latest", server.url()));
        let rates = source.fetch_rates().await.unwrap();

        assert_eq!(rates.len(), 3);
        assert_eq!(rates[&Currency::Hkd], BigDecimal::from_str("7.8").unwrap());
        assert_eq!(rates[&Currency::Usd], BigDecimal::from(1));
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/latest")
            .with_status(503)
            .create_async()
            .await;

        let source = HttpRateSource::new(format!("{}/latest", server.url()));
        assert!(matches!(
            source.fetch_rates().await,
            Err(ProviderError::Unavailable(_))
        ));
    }
}
