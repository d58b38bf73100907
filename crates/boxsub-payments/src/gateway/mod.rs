//! Payment Gateway Integration
//!
//! Hosted-checkout and lookup calls the rest of the crate makes against the
//! payment provider.

mod mock;
mod stripe;

pub use mock::MockGateway;
pub use self::stripe::StripeGateway;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use boxsub_core::AddressSnapshot;
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::plan::CheckoutMode;

/// Gateway credentials and limits
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| PaymentError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| PaymentError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;
        let timeout = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(Duration::from_secs(10), Duration::from_secs);

        Ok(Self {
            secret_key,
            webhook_secret,
            timeout,
        })
    }
}

/// Everything needed to open a hosted checkout page
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionRequest {
    pub price_id: String,
    pub mode: CheckoutMode,
    pub customer_email: String,
    /// Our user id, echoed back as the session's client reference
    pub client_reference_id: String,
    /// Embedded for one-off purchases only; recurring sessions carry the
    /// address id in metadata instead
    pub shipping: Option<AddressSnapshot>,
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

/// A created hosted checkout session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
}

/// Payment gateway trait
///
/// Every call is bounded by a timeout; a timeout surfaces as
/// [`PaymentError::Timeout`], which is retryable.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout session
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CreatedSession>;

    /// Price id a subscription bills against
    async fn subscription_price(&self, subscription_id: &str) -> Result<String>;

    /// Email on file for a gateway customer
    async fn customer_email(&self, customer_id: &str) -> Result<Option<String>>;

    /// Amount collected for a payment, in minor units
    async fn amount_received(&self, transaction_id: &str) -> Result<i64>;

    /// Gateway name
    fn name(&self) -> &str;
}
