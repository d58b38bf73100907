//! Stripe Gateway
//!
//! Hosted Checkout sessions plus the subscription, customer and payment
//! lookups reconciliation needs. Every call runs under the configured
//! timeout.

use std::future::Future;
use std::time::Duration;

use ::stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionPaymentIntentData,
    CreateCheckoutSessionPaymentIntentDataShipping,
    CreateCheckoutSessionPaymentIntentDataShippingAddress, CreateCheckoutSessionSubscriptionData,
    Customer, CustomerId, PaymentIntent, PaymentIntentId, StripeError, Subscription,
    SubscriptionId,
};
use async_trait::async_trait;
use boxsub_core::AddressSnapshot;

use super::{CheckoutSessionRequest, CreatedSession, GatewayConfig, PaymentGateway};
use crate::error::{PaymentError, Result};
use crate::plan::CheckoutMode;

/// Stripe client wrapper
pub struct StripeGateway {
    client: Client,
    timeout: Duration,
}

impl StripeGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            client: Client::new(config.secret_key.clone()),
            timeout: config.timeout,
        }
    }

    async fn call<T, F>(&self, operation: &str, request: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StripeError>>,
    {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| PaymentError::Timeout(format!("{operation} exceeded {:?}", self.timeout)))?
            .map_err(|e| map_stripe_error(operation, e))
    }
}

/// Rate limits, 5xx responses and transport failures are worth retrying
fn map_stripe_error(operation: &str, error: StripeError) -> PaymentError {
    match error {
        StripeError::Stripe(request)
            if request.http_status == 429 || (500..600).contains(&request.http_status) =>
        {
            PaymentError::Transient(format!("{operation}: HTTP {}", request.http_status))
        }
        StripeError::Timeout => PaymentError::Timeout(operation.to_string()),
        StripeError::ClientError(message) => {
            PaymentError::Transient(format!("{operation}: {message}"))
        }
        other => PaymentError::Gateway(format!("{operation}: {other}")),
    }
}

fn shipping_details(snapshot: &AddressSnapshot) -> CreateCheckoutSessionPaymentIntentDataShipping {
    CreateCheckoutSessionPaymentIntentDataShipping {
        address: CreateCheckoutSessionPaymentIntentDataShippingAddress {
            line1: snapshot.line1.clone(),
            line2: snapshot.line2.clone(),
            city: Some(snapshot.town_or_city.clone()),
            state: snapshot.county.clone(),
            postal_code: Some(snapshot.postcode.clone()),
            country: Some(snapshot.country.clone()),
        },
        name: snapshot.recipient_name.clone(),
        phone: snapshot.phone.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CreatedSession> {
        let mut params = CreateCheckoutSession::new();
        params.customer_email = Some(&request.customer_email);
        params.client_reference_id = Some(&request.client_reference_id);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.metadata = Some(request.metadata.clone());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);

        match request.mode {
            CheckoutMode::Recurring => {
                params.mode = Some(CheckoutSessionMode::Subscription);
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(request.metadata.clone()),
                    ..Default::default()
                });
            }
            CheckoutMode::OneOff => {
                params.mode = Some(CheckoutSessionMode::Payment);
                params.payment_intent_data = Some(CreateCheckoutSessionPaymentIntentData {
                    metadata: Some(request.metadata.clone()),
                    shipping: request.shipping.as_ref().map(shipping_details),
                    ..Default::default()
                });
            }
        }

        let session = self
            .call("checkout.sessions.create", CheckoutSession::create(&self.client, params))
            .await?;
        let url = session
            .url
            .ok_or_else(|| PaymentError::Gateway("No checkout URL returned".into()))?;

        tracing::info!(
            session_id = %session.id,
            mode = request.mode.as_str(),
            "Created Stripe checkout session"
        );

        Ok(CreatedSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn subscription_price(&self, subscription_id: &str) -> Result<String> {
        let id = subscription_id.parse::<SubscriptionId>().map_err(|e| {
            PaymentError::Validation(format!("invalid subscription id {subscription_id}: {e}"))
        })?;
        let subscription = self
            .call("subscriptions.retrieve", Subscription::retrieve(&self.client, &id, &[]))
            .await?;

        subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string())
            .ok_or_else(|| {
                PaymentError::Fatal(format!("subscription {subscription_id} has no priced item"))
            })
    }

    async fn customer_email(&self, customer_id: &str) -> Result<Option<String>> {
        let id = customer_id.parse::<CustomerId>().map_err(|e| {
            PaymentError::Validation(format!("invalid customer id {customer_id}: {e}"))
        })?;
        let customer = self
            .call("customers.retrieve", Customer::retrieve(&self.client, &id, &[]))
            .await?;
        Ok(customer.email)
    }

    async fn amount_received(&self, transaction_id: &str) -> Result<i64> {
        let id = transaction_id.parse::<PaymentIntentId>().map_err(|e| {
            PaymentError::Validation(format!("invalid payment intent id {transaction_id}: {e}"))
        })?;
        let intent = self
            .call("payment_intents.retrieve", PaymentIntent::retrieve(&self.client, &id, &[]))
            .await?;
        Ok(intent.amount_received)
    }

    fn name(&self) -> &str {
        "stripe"
    }
}
