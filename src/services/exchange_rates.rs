use arc_swap::ArcSwap;
use bigdecimal::{BigDecimal, Zero};
use std::sync::Arc;

use crate::domain::Currency;
use crate::error::AppError;
use crate::providers::exchange_rate::{RateSource, RateTable};
use crate::providers::ProviderError;

/// Last fetched rate table, swapped atomically on refresh.
pub struct ExchangeRateService {
    source: Arc<dyn RateSource>,
    rates: ArcSwap<RateTable>,
}

impl ExchangeRateService {
    pub fn new(source: Arc<dyn RateSource>) -> Self {
        Self {
            source,
            rates: ArcSwap::from_pointee(RateTable::new()),
        }
    }

    pub async fn refresh(&self) -> Result<usize, ProviderError> {
        let table = self.source.fetch_rates().await?;
        let count = table.len();
        self.rates.store(Arc::new(table));
        tracing::info!("Exchange rates refreshed with {} currencies", count);
        Ok(count)
    }

    pub fn rate(&self, currency: Currency) -> Option<BigDecimal> {
        self.rates.load().get(&currency).cloned()
    }

    /// Converts `amount` from one currency to another through the common base.
    /// Fiat results are rounded to cents, tokens to 8 places.
    pub fn quote(
        &self,
        amount: &BigDecimal,
        from: Currency,
        to: Currency,
    ) -> Result<BigDecimal, AppError> {
        if from == to {
            return Ok(amount.clone());
        }

        let rates = self.rates.load();
        let rate_of = |currency: Currency| {
            rates
                .get(&currency)
                .filter(|rate| !rate.is_zero())
                .cloned()
                .ok_or_else(|| AppError::Validation(format!("no exchange rate for {}", currency)))
        };
        let (from_rate, to_rate) = (rate_of(from)?, rate_of(to)?);

        let converted = amount * to_rate / from_rate;
        let scale = if to.is_fiat() { 2 } else { 8 };
        Ok(converted.round(scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::exchange_rate::StaticRateSource;
    use std::str::FromStr;

    async fn service() -> ExchangeRateService {
        let mut table = RateTable::new();
        table.insert(Currency::Usd, BigDecimal::from(1));
        table.insert(Currency::Hkd, BigDecimal::from_str("7.8").unwrap());
        table.insert(Currency::Twd, BigDecimal::from_str("31.2").unwrap());

        let service = ExchangeRateService::new(Arc::new(StaticRateSource::new(table)));
        service.refresh().await.unwrap();
        service
    }

    #[tokio::test]
    async fn quotes_through_base_currency() {
        let rates = service().await;
        let quote = rates
            .quote(&BigDecimal::from(78), Currency::Hkd, Currency::Twd)
            .unwrap();
        assert_eq!(quote, BigDecimal::from_str("312.00").unwrap());
    }

    #[tokio::test]
    async fn missing_rate_is_a_validation_error() {
        let rates = service().await;
        let err = rates
            .quote(&BigDecimal::from(1), Currency::Like, Currency::Usd)
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn same_currency_is_identity() {
        let rates = ExchangeRateService::new(Arc::new(StaticRateSource::default()));
        let amount = BigDecimal::from_str("1.234").unwrap();
        assert_eq!(rates.quote(&amount, Currency::Mat, Currency::Mat).unwrap(), amount);
    }
}
