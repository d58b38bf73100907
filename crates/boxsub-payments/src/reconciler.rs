//! Order Reconciliation
//!
//! Turns verified gateway events into local orders, payments and
//! subscription links. Every event may arrive more than once and in any
//! order, so each handler:
//!
//! 1. does its gateway lookups outside any lock (retried with backoff),
//! 2. re-reads and writes under [`ConcurrencyGuard`] keyed by the external id,
//! 3. notifies the customer only when this delivery created something.

use std::sync::Arc;

use boxsub_core::{
    BillingStore, CatalogBox, ConcurrencyGuard, Order, OrderStatus, Payment, PaymentStatus,
    RetryPolicy, ShippingAddress, SubscriptionMeta, User,
};
use chrono::Utc;

use crate::address::ShippingAddressResolver;
use crate::error::{PaymentError, Result};
use crate::event::{CheckoutCompleted, DispatchOutcome, GatewayEvent, InvoiceEvent};
use crate::gateway::PaymentGateway;
use crate::metadata::{CheckoutMetadata, GiftDetails};
use crate::notify::{Notification, Notifier};
use crate::plan::{CheckoutMode, Plan, PriceCatalog};

/// Applies gateway events to the billing store
pub struct OrderReconciler {
    store: Arc<dyn BillingStore>,
    guard: ConcurrencyGuard,
    resolver: ShippingAddressResolver,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    catalog: Arc<PriceCatalog>,
    policy: RetryPolicy,
}

impl OrderReconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        catalog: Arc<PriceCatalog>,
    ) -> Self {
        Self {
            guard: ConcurrencyGuard::new(store.clone()),
            resolver: ShippingAddressResolver::new(store.clone()),
            store,
            gateway,
            notifier,
            catalog,
            policy: RetryPolicy::default(),
        }
    }

    /// Use one retry policy for gateway lookups and guarded writes
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.guard = ConcurrencyGuard::new(self.store.clone()).with_policy(policy.clone());
        self.policy = policy;
        self
    }

    /// Apply one event
    pub async fn reconcile(&self, event: GatewayEvent) -> Result<DispatchOutcome> {
        match event {
            GatewayEvent::CheckoutCompleted(checkout) => match checkout.mode {
                CheckoutMode::Recurring => self.subscription_checkout(&checkout).await,
                CheckoutMode::OneOff => self.one_off_checkout(&checkout).await,
            },
            GatewayEvent::PaymentSucceeded(invoice) => self.payment_succeeded(&invoice).await,
            GatewayEvent::PaymentFailed(invoice) => self.payment_failed(&invoice).await,
            GatewayEvent::UpcomingRenewal(invoice) => self.upcoming_renewal(&invoice).await,
            GatewayEvent::SubscriptionCancelled { subscription_id } => {
                self.subscription_cancelled(&subscription_id).await
            }
            GatewayEvent::Ignored { kind } => {
                tracing::debug!(kind = %kind, "Unhandled webhook event");
                Ok(DispatchOutcome::Ignored)
            }
        }
    }

    // ========================================================================
    // Checkout completed
    // ========================================================================

    async fn subscription_checkout(&self, checkout: &CheckoutCompleted) -> Result<DispatchOutcome> {
        let subscription_id = checkout.subscription_id.as_deref().ok_or_else(|| {
            PaymentError::Validation(format!("session {} has no subscription", checkout.session_id))
        })?;
        let metadata = &checkout.metadata;
        let (user, address) = self.checkout_destination(metadata)?;

        if self.store.order_by_subscription(subscription_id)?.is_some() {
            tracing::info!(subscription_id, "Subscription already reconciled");
            return Ok(DispatchOutcome::Duplicate);
        }

        let price_id = self
            .policy
            .retry(|| self.gateway.subscription_price(subscription_id), PaymentError::is_retryable)
            .await?;
        let next_box = self.next_box()?;

        let key = format!("subscription:{subscription_id}");
        let created = self
            .guard
            .with_exclusive_lock(&key, |tx| {
                // Order and link commit together; a cancelled link stays cancelled
                if tx.order_by_subscription(subscription_id)?.is_some() {
                    return Ok(false);
                }
                if tx.subscription_meta(subscription_id)?.is_none() {
                    let mut meta = SubscriptionMeta::new(user.id, subscription_id, &price_id);
                    meta.shipping_address_id = Some(address.id);
                    meta.is_gift = metadata.gift;
                    tx.insert_subscription_meta(meta);
                }
                let mut order = processing_order(&user, &address, next_box.as_ref(), metadata.gift);
                order.subscription_id = Some(subscription_id.to_string());
                tx.insert_order(order);
                Ok(true)
            })
            .await?;

        if !created {
            tracing::info!(subscription_id, "Subscription reconciled by a concurrent delivery");
            return Ok(DispatchOutcome::Duplicate);
        }

        tracing::info!(
            subscription_id,
            user_id = %user.id,
            price_id = %price_id,
            gift = metadata.gift,
            "Subscription order created"
        );

        let plan = self
            .catalog
            .plan_for_price(&price_id)
            .or(metadata.plan)
            .map_or("Subscription", |plan| plan.label());
        let gift = metadata.gift.then(|| metadata.gift_details());
        if let Some(gift) = gift.filter(GiftDetails::is_deliverable) {
            self.notify_gift(&user, gift, plan).await;
        } else {
            if metadata.gift {
                tracing::warn!(
                    subscription_id,
                    user_id = %user.id,
                    "Gift is missing recipient details; sending a plain confirmation"
                );
            }
            self.notify(Notification::SubscriptionConfirmed {
                to: user.email.clone(),
                plan: plan.to_string(),
            })
            .await;
        }
        Ok(DispatchOutcome::Processed)
    }

    async fn one_off_checkout(&self, checkout: &CheckoutCompleted) -> Result<DispatchOutcome> {
        let transaction_id = checkout.transaction_id.as_deref().ok_or_else(|| {
            PaymentError::Validation(format!("session {} has no payment", checkout.session_id))
        })?;
        let metadata = &checkout.metadata;
        let (user, address) = self.checkout_destination(metadata)?;

        if self.store.payment_by_transaction(transaction_id)?.is_some() {
            tracing::info!(transaction_id, "Payment already recorded");
            return Ok(DispatchOutcome::Duplicate);
        }

        let amount = match checkout.amount_total {
            Some(amount) => amount,
            None => {
                self.policy
                    .retry(
                        || self.gateway.amount_received(transaction_id),
                        PaymentError::is_retryable,
                    )
                    .await?
            }
        };
        let next_box = self.next_box()?;

        let key = format!("transaction:{transaction_id}");
        let order = self
            .guard
            .with_exclusive_lock(&key, |tx| {
                if tx.payment_by_transaction(transaction_id)?.is_some()
                    || tx.order_by_transaction(transaction_id)?.is_some()
                {
                    return Ok(None);
                }
                let mut order = processing_order(&user, &address, next_box.as_ref(), metadata.gift);
                order.transaction_id = Some(transaction_id.to_string());
                tx.insert_order(order.clone());
                tx.insert_payment(Payment::card(
                    &order,
                    amount,
                    PaymentStatus::Paid,
                    transaction_id,
                ));
                Ok(Some(order))
            })
            .await?;

        let Some(order) = order else {
            tracing::info!(transaction_id, "Payment recorded by a concurrent delivery");
            return Ok(DispatchOutcome::Duplicate);
        };

        tracing::info!(
            transaction_id,
            order_id = %order.id,
            user_id = %user.id,
            amount,
            gift = metadata.gift,
            "One-off order created"
        );

        if metadata.gift {
            let gift = metadata.gift_details();
            if gift.is_deliverable() {
                self.notify_gift(&user, gift, Plan::OneOff.label()).await;
            } else {
                tracing::warn!(
                    order_id = %order.id,
                    "Gift order is missing recipient details; no gift notice sent"
                );
            }
        } else {
            self.notify(Notification::OrderConfirmed {
                to: user.email.clone(),
                order_id: order.id,
            })
            .await;
        }
        Ok(DispatchOutcome::Processed)
    }

    // ========================================================================
    // Invoices
    // ========================================================================

    async fn payment_succeeded(&self, invoice: &InvoiceEvent) -> Result<DispatchOutcome> {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            tracing::debug!(invoice_id = %invoice.invoice_id, "Invoice is not for a subscription");
            return Ok(DispatchOutcome::Ignored);
        };
        let Some(meta) = self.store.subscription_meta(subscription_id)? else {
            tracing::warn!(
                subscription_id,
                invoice_id = %invoice.invoice_id,
                "No subscription record for renewal; skipping"
            );
            return Ok(DispatchOutcome::Dropped);
        };

        let transaction_id = invoice.settlement_id();
        if self.store.payment_by_transaction(transaction_id)?.is_some() {
            tracing::info!(transaction_id, "Renewal payment already recorded");
            return Ok(DispatchOutcome::Duplicate);
        }

        let user = self
            .store
            .user(meta.user_id)?
            .ok_or_else(|| {
                PaymentError::Validation(format!("subscription {subscription_id} has no user"))
            })?;
        let address = match meta.shipping_address_id {
            Some(id) => self.store.address(id)?,
            None => None,
        };
        let next_box = self.next_box()?;

        let key = format!("subscription:{subscription_id}");
        let order = self
            .guard
            .with_exclusive_lock(&key, |tx| {
                if tx.payment_by_transaction(transaction_id)?.is_some() {
                    return Ok(None);
                }
                // First invoice pays for the order created at checkout
                let order = match tx.order_by_subscription(subscription_id)? {
                    Some(first) if tx.payments_for_order(first.id)?.is_empty() => first,
                    _ => match tx.order_by_transaction(transaction_id)? {
                        Some(existing) => existing,
                        None => {
                            let mut order = Order::new(meta.user_id);
                            if let Some(address) = &address {
                                order = order.ship_to(address);
                            }
                            order = order.scheduled_for(next_box.as_ref());
                            order.status = OrderStatus::Processing;
                            order.is_gift = meta.is_gift;
                            order.transaction_id = Some(transaction_id.to_string());
                            order.renewal_of = Some(subscription_id.to_string());
                            tx.insert_order(order.clone());
                            order
                        }
                    },
                };
                tx.insert_payment(Payment::card(
                    &order,
                    invoice.amount_paid,
                    PaymentStatus::Succeeded,
                    transaction_id,
                ));
                Ok(Some(order))
            })
            .await?;

        let Some(order) = order else {
            return Ok(DispatchOutcome::Duplicate);
        };

        tracing::info!(
            subscription_id,
            transaction_id,
            order_id = %order.id,
            renewal = order.renewal_of.is_some(),
            "Subscription payment recorded"
        );
        self.notify(Notification::OrderConfirmed {
            to: user.email,
            order_id: order.id,
        })
        .await;
        Ok(DispatchOutcome::Processed)
    }

    async fn payment_failed(&self, invoice: &InvoiceEvent) -> Result<DispatchOutcome> {
        let Some(user) = self.invoice_user(invoice).await? else {
            tracing::warn!(
                invoice_id = %invoice.invoice_id,
                "Failed payment for unknown customer; dropping"
            );
            return Ok(DispatchOutcome::Dropped);
        };

        tracing::warn!(
            invoice_id = %invoice.invoice_id,
            subscription_id = ?invoice.subscription_id,
            user_id = %user.id,
            "Subscription payment failed"
        );
        self.notify(Notification::PaymentFailed { to: user.email }).await;
        Ok(DispatchOutcome::Processed)
    }

    async fn upcoming_renewal(&self, invoice: &InvoiceEvent) -> Result<DispatchOutcome> {
        let Some(next_attempt) = invoice.next_payment_attempt else {
            tracing::warn!(
                subscription_id = ?invoice.subscription_id,
                "Upcoming invoice has no payment date; dropping"
            );
            return Ok(DispatchOutcome::Dropped);
        };
        let Some(user) = self.invoice_user(invoice).await? else {
            tracing::warn!(
                subscription_id = ?invoice.subscription_id,
                "Upcoming renewal for unknown customer; dropping"
            );
            return Ok(DispatchOutcome::Dropped);
        };

        self.notify(Notification::UpcomingRenewal {
            to: user.email,
            renewal_date: next_attempt.format("%B %d, %Y").to_string(),
        })
        .await;
        Ok(DispatchOutcome::Processed)
    }

    // ========================================================================
    // Subscription lifecycle
    // ========================================================================

    async fn subscription_cancelled(&self, subscription_id: &str) -> Result<DispatchOutcome> {
        let key = format!("subscription:{subscription_id}");
        let cancelled = self
            .guard
            .with_exclusive_lock(&key, |tx| {
                let Some(mut meta) = tx.subscription_meta(subscription_id)? else {
                    return Ok(None);
                };
                meta.cancelled_at = Some(Utc::now());
                tx.update_subscription_meta(meta.clone());
                Ok(Some(meta))
            })
            .await?;

        let Some(meta) = cancelled else {
            tracing::info!(subscription_id, "No active subscription to cancel");
            return Ok(DispatchOutcome::Dropped);
        };

        tracing::info!(subscription_id, user_id = %meta.user_id, "Subscription cancelled");
        if let Some(user) = self.store.user(meta.user_id)? {
            self.notify(Notification::SubscriptionCancelled { to: user.email }).await;
        }
        Ok(DispatchOutcome::Processed)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn checkout_destination(&self, metadata: &CheckoutMetadata) -> Result<(User, ShippingAddress)> {
        let user = self
            .store
            .user(metadata.user_id)?
            .ok_or_else(|| PaymentError::Validation(format!("unknown user {}", metadata.user_id)))?;
        let address_id = metadata
            .shipping_address_id
            .ok_or_else(|| {
                PaymentError::Validation("checkout metadata has no shipping address".into())
            })?;
        let address = self.resolver.resolve(user.id, address_id)?;
        Ok((user, address))
    }

    fn next_box(&self) -> Result<Option<CatalogBox>> {
        let next_box = self.store.latest_open_box()?;
        if next_box.is_none() {
            tracing::warn!("No open box in the catalog; order will be created unscheduled");
        }
        Ok(next_box)
    }

    /// Invoice email, else the gateway's customer record, then the user directory
    async fn invoice_user(&self, invoice: &InvoiceEvent) -> Result<Option<User>> {
        let email = match (&invoice.customer_email, &invoice.customer_id) {
            (Some(email), _) => Some(email.clone()),
            (None, Some(customer_id)) => {
                self.policy
                    .retry(|| self.gateway.customer_email(customer_id), PaymentError::is_retryable)
                    .await?
            }
            (None, None) => None,
        };
        match email {
            Some(email) => Ok(self.store.user_by_email(&email)?),
            None => Ok(None),
        }
    }

    /// Recipient first, then the buyer's receipt
    async fn notify_gift(&self, buyer: &User, gift: GiftDetails, plan: &str) {
        self.notify(Notification::GiftReceived {
            to: gift.recipient_email,
            recipient_name: gift.recipient_name.clone(),
            sender_name: gift.sender_name,
            message: gift.gift_message,
            plan: plan.to_string(),
        })
        .await;
        self.notify(Notification::GiftSent {
            to: buyer.email.clone(),
            recipient_name: gift.recipient_name,
            plan: plan.to_string(),
        })
        .await;
    }

    async fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        if let Err(error) = self.notifier.send(notification).await {
            tracing::warn!(kind, error = %error, "Failed to send notification");
        }
    }
}

fn processing_order(
    user: &User,
    address: &ShippingAddress,
    next_box: Option<&CatalogBox>,
    is_gift: bool,
) -> Order {
    let mut order = Order::new(user.id).ship_to(address).scheduled_for(next_box);
    order.status = OrderStatus::Processing;
    order.is_gift = is_gift;
    order
}
