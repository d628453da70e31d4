use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::orders::error::{OrderError, OrderResult};
use crate::pricing::Quote;

/// Quotes awaiting attachment to an order
///
/// Entries are only valid until their `expires_at_ms`; expired quotes read as
/// `QuoteExpired` until purged.
#[derive(Debug, Default)]
pub struct QuoteBook {
    quotes: RwLock<HashMap<String, Quote>>,
}

impl QuoteBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, quote: Quote) {
        self.quotes
            .write()
            .await
            .insert(quote.quote_id.clone(), quote);
    }

    /// Live quote by id
    pub async fn get(&self, quote_id: &str, now_ms: i64) -> OrderResult<Quote> {
        let quotes = self.quotes.read().await;
        match quotes.get(quote_id) {
            Some(quote) if quote.is_expired(now_ms) => {
                Err(OrderError::QuoteExpired(quote_id.to_string()))
            }
            Some(quote) => Ok(quote.clone()),
            None => Err(OrderError::NotFound(format!("quote {}", quote_id))),
        }
    }

    pub async fn remove(&self, quote_id: &str) -> Option<Quote> {
        self.quotes.write().await.remove(quote_id)
    }

    /// Drop expired quotes; returns how many were removed
    pub async fn purge_expired(&self, now_ms: i64) -> usize {
        let mut quotes = self.quotes.write().await;
        let before = quotes.len();
        quotes.retain(|_, quote| !quote.is_expired(now_ms));
        let purged = before - quotes.len();
        if purged > 0 {
            tracing::debug!("Purged {} expired quotes", purged);
        }
        purged
    }

    pub async fn len(&self) -> usize {
        self.quotes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::calculator::{FareBreakdown, FareComponents};
    use crate::pricing::PricingContext;
    use rust_decimal::Decimal;

    fn quote(id: &str, expires_at_ms: i64) -> Quote {
        Quote {
            quote_id: id.to_string(),
            context: PricingContext::new("u-1", Decimal::ONE, Decimal::ONE, 0),
            codes: vec![],
            matched: vec![],
            breakdown: FareBreakdown {
                currency: "USD".to_string(),
                components: FareComponents::default(),
                original_amount: Decimal::ZERO,
                surged_amount: Decimal::ZERO,
                total_discount: Decimal::ZERO,
                platform_fee: Decimal::ZERO,
                discounted_amount: Decimal::ZERO,
                payment_amount: Decimal::ZERO,
                applied_rules: vec![],
                warnings: vec![],
            },
            created_at_ms: 0,
            expires_at_ms,
        }
    }

    #[tokio::test]
    async fn test_get_live_expired_and_missing() {
        let book = QuoteBook::new();
        book.insert(quote("q-1", 1_000)).await;

        assert!(book.get("q-1", 999).await.is_ok());
        assert!(matches!(book.get("q-1", 1_000).await, Err(OrderError::QuoteExpired(_))));
        assert!(matches!(book.get("q-2", 0).await, Err(OrderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let book = QuoteBook::new();
        book.insert(quote("old", 10)).await;
        book.insert(quote("new", 1_000)).await;

        assert_eq!(book.purge_expired(500).await, 1);
        assert_eq!(book.len().await, 1);
        assert!(book.remove("new").await.is_some());
    }
}
