//! Checkout Session Builder
//!
//! Turns a finished wizard into a hosted checkout session and returns the
//! URL to send the customer to. Nothing is written locally; orders only
//! appear once the gateway reports the payment.

use std::sync::Arc;

use boxsub_core::{ShippingAddress, User};

use crate::error::Result;
use crate::gateway::{CheckoutSessionRequest, CreatedSession, PaymentGateway};
use crate::metadata::{CheckoutMetadata, GiftDetails};
use crate::plan::{CheckoutMode, Plan, PriceCatalog};

/// Inputs for one checkout session
#[derive(Clone, Copy, Debug)]
pub struct SessionInput<'a> {
    pub user: &'a User,
    pub plan: Plan,
    pub address: &'a ShippingAddress,
    /// Present for gift purchases
    pub gift: Option<&'a GiftDetails>,
}

/// Builds and opens hosted checkout sessions
pub struct CheckoutSessionBuilder {
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PriceCatalog>,
    base_url: String,
}

impl CheckoutSessionBuilder {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PriceCatalog>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            catalog,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn success_url(&self) -> String {
        format!("{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}", self.base_url)
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/checkout/cancel", self.base_url)
    }

    /// Assemble the gateway request without sending it
    pub fn request(&self, input: &SessionInput<'_>) -> Result<CheckoutSessionRequest> {
        let mode = input.plan.mode();
        let price_id = self.catalog.price_for(input.plan, input.gift.is_some())?;

        let mut metadata = CheckoutMetadata::new(input.user.id, input.plan, input.address.id);
        if let Some(gift) = input.gift {
            metadata = metadata.with_gift(gift);
        }

        Ok(CheckoutSessionRequest {
            price_id: price_id.to_string(),
            mode,
            customer_email: input.user.email.clone(),
            client_reference_id: input.user.id.to_string(),
            shipping: (mode == CheckoutMode::OneOff).then(|| input.address.snapshot()),
            metadata: metadata.to_map(),
            success_url: self.success_url(),
            cancel_url: self.cancel_url(),
        })
    }

    /// Create the session; gateway failures are returned untouched
    pub async fn create(&self, input: &SessionInput<'_>) -> Result<CreatedSession> {
        let request = self.request(input)?;
        let session = self.gateway.create_checkout_session(&request).await?;

        tracing::info!(
            user_id = %input.user.id,
            plan = %input.plan,
            gift = input.gift.is_some(),
            gateway = self.gateway.name(),
            session_id = %session.id,
            "Checkout session created"
        );
        Ok(session)
    }
}
