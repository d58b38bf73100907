//! Mock Gateway
//!
//! For testing and running without Stripe credentials. Sessions get fake
//! hosted URLs; lookups answer from seeded tables and can be told to fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{CheckoutSessionRequest, CreatedSession, PaymentGateway};
use crate::error::{PaymentError, Result};

#[derive(Default)]
struct Seeded {
    prices: HashMap<String, String>,
    emails: HashMap<String, String>,
    amounts: HashMap<String, i64>,
}

/// Mock gateway with in-memory lookups
#[derive(Default)]
pub struct MockGateway {
    seeded: RwLock<Seeded>,
    sessions: RwLock<Vec<CheckoutSessionRequest>>,
    reject_sessions: AtomicBool,
    lookup_failures: AtomicU32,
    lookup_calls: AtomicU32,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `subscription_price` for a subscription
    #[must_use]
    pub fn with_subscription_price(self, subscription_id: &str, price_id: &str) -> Self {
        if let Ok(mut seeded) = self.seeded.write() {
            seeded.prices.insert(subscription_id.into(), price_id.into());
        }
        self
    }

    /// Answer `customer_email` for a customer
    #[must_use]
    pub fn with_customer_email(self, customer_id: &str, email: &str) -> Self {
        if let Ok(mut seeded) = self.seeded.write() {
            seeded.emails.insert(customer_id.into(), email.into());
        }
        self
    }

    /// Answer `amount_received` for a payment
    #[must_use]
    pub fn with_amount(self, transaction_id: &str, amount_minor: i64) -> Self {
        if let Ok(mut seeded) = self.seeded.write() {
            seeded.amounts.insert(transaction_id.into(), amount_minor);
        }
        self
    }

    /// Fail every session creation while set
    pub fn reject_sessions(&self, reject: bool) {
        self.reject_sessions.store(reject, Ordering::SeqCst);
    }

    /// Time out the next `count` lookups
    pub fn fail_lookups(&self, count: u32) {
        self.lookup_failures.store(count, Ordering::SeqCst);
    }

    /// Sessions created so far
    pub fn sessions(&self) -> Vec<CheckoutSessionRequest> {
        self.sessions.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Lookup calls made so far, failed ones included
    pub fn lookup_calls(&self) -> u32 {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    fn lookup<T>(
        &self,
        operation: &str,
        find: impl FnOnce(&Seeded) -> Option<T>,
    ) -> Result<Option<T>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PaymentError::Timeout(format!("{operation} (mock)")));
        }
        let seeded = self
            .seeded
            .read()
            .map_err(|_| PaymentError::Fatal("mock gateway lock poisoned".into()))?;
        Ok(find(&seeded))
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CreatedSession> {
        if self.reject_sessions.load(Ordering::SeqCst) {
            return Err(PaymentError::Transient("mock gateway unavailable".into()));
        }
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| PaymentError::Fatal("mock gateway lock poisoned".into()))?;
        let id = format!("cs_test_{}", sessions.len() + 1);
        sessions.push(request.clone());

        Ok(CreatedSession {
            url: format!("https://checkout.example.test/pay/{id}"),
            id,
        })
    }

    async fn subscription_price(&self, subscription_id: &str) -> Result<String> {
        self.lookup("subscriptions.retrieve", |s| s.prices.get(subscription_id).cloned())?
            .ok_or_else(|| {
                PaymentError::Gateway(format!("No such subscription: {subscription_id}"))
            })
    }

    async fn customer_email(&self, customer_id: &str) -> Result<Option<String>> {
        self.lookup("customers.retrieve", |s| s.emails.get(customer_id).cloned())
    }

    async fn amount_received(&self, transaction_id: &str) -> Result<i64> {
        self.lookup("payment_intents.retrieve", |s| s.amounts.get(transaction_id).copied())?
            .ok_or_else(|| {
                PaymentError::Gateway(format!("No such payment_intent: {transaction_id}"))
            })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CheckoutMode;

    #[tokio::test]
    async fn test_records_sessions() {
        let gateway = MockGateway::new();
        let request = CheckoutSessionRequest {
            price_id: "price_1".into(),
            mode: CheckoutMode::Recurring,
            customer_email: "ada@example.com".into(),
            client_reference_id: "u1".into(),
            shipping: None,
            metadata: HashMap::new(),
            success_url: "http://localhost/success".into(),
            cancel_url: "http://localhost/cancel".into(),
        };

        let session = gateway.create_checkout_session(&request).await.unwrap();
        assert!(session.url.ends_with(&session.id));
        assert_eq!(gateway.sessions(), vec![request.clone()]);

        gateway.reject_sessions(true);
        assert!(gateway.create_checkout_session(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_lookup_failures_are_transient() {
        let gateway = MockGateway::new().with_subscription_price("sub_1", "price_3mo");
        gateway.fail_lookups(1);

        let err = gateway.subscription_price("sub_1").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(gateway.subscription_price("sub_1").await.unwrap(), "price_3mo");
        assert_eq!(gateway.lookup_calls(), 2);
    }
}
