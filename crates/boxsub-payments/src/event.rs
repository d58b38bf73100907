//! Gateway Events
//!
//! Typed view of the webhook envelope `{type, data: {object}}`. Decoding is
//! eager: a verified payload becomes a [`GatewayEvent`] with its checkout
//! metadata already parsed, before any reconciliation runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PaymentError, Result};
use crate::metadata::CheckoutMetadata;
use crate::plan::CheckoutMode;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const UPCOMING_RENEWAL: &str = "invoice.upcoming";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// How a delivery was handled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Records written or notifications sent
    Processed,
    /// Already reconciled; nothing changed
    Duplicate,
    /// Event kind we don't act on
    Ignored,
    /// Could not be tied to local data; logged and acknowledged
    Dropped,
    /// Fatal error; logged and acknowledged
    Failed,
}

/// Completed hosted checkout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub mode: CheckoutMode,
    pub subscription_id: Option<String>,
    /// Payment intent for one-off purchases
    pub transaction_id: Option<String>,
    pub amount_total: Option<i64>,
    pub customer_email: Option<String>,
    pub metadata: CheckoutMetadata,
}

/// Invoice lifecycle event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceEvent {
    /// Empty only for upcoming invoices, which are never settled
    pub invoice_id: String,
    pub subscription_id: Option<String>,
    pub transaction_id: Option<String>,
    pub amount_paid: i64,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub next_payment_attempt: Option<DateTime<Utc>>,
}

impl InvoiceEvent {
    /// Idempotency key for the payment this invoice settles
    pub fn settlement_id(&self) -> &str {
        self.transaction_id.as_deref().unwrap_or(&self.invoice_id)
    }
}

/// Decoded webhook event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    CheckoutCompleted(CheckoutCompleted),
    PaymentSucceeded(InvoiceEvent),
    PaymentFailed(InvoiceEvent),
    UpcomingRenewal(InvoiceEvent),
    SubscriptionCancelled { subscription_id: String },
    Ignored { kind: String },
}

impl GatewayEvent {
    /// Decode a raw webhook body
    ///
    /// Malformed JSON or objects surface as `PaymentError::Json`; checkout
    /// metadata that can't be tied to a user surfaces as
    /// `PaymentError::Validation`.
    pub fn from_json(payload: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        let object = envelope.data.object;

        let event = match envelope.kind.as_str() {
            CHECKOUT_COMPLETED => {
                let session: SessionObject = serde_json::from_value(object)?;
                let mode = match session.mode.as_str() {
                    "subscription" => CheckoutMode::Recurring,
                    "payment" => CheckoutMode::OneOff,
                    other => {
                        return Ok(Self::Ignored {
                            kind: format!("{CHECKOUT_COMPLETED} ({other})"),
                        });
                    }
                };
                Self::CheckoutCompleted(CheckoutCompleted {
                    metadata: CheckoutMetadata::from_map(&session.metadata)?,
                    session_id: session.id,
                    mode,
                    subscription_id: session.subscription.map(ExpandableId::into_id),
                    transaction_id: session.payment_intent.map(ExpandableId::into_id),
                    amount_total: session.amount_total,
                    customer_email: session
                        .customer_email
                        .or_else(|| session.customer_details.and_then(|d| d.email)),
                })
            }
            PAYMENT_SUCCEEDED => {
                let invoice: InvoiceObject = serde_json::from_value(object)?;
                Self::PaymentSucceeded(invoice.into_settlement()?)
            }
            PAYMENT_FAILED => {
                Self::PaymentFailed(serde_json::from_value::<InvoiceObject>(object)?.into())
            }
            UPCOMING_RENEWAL => {
                Self::UpcomingRenewal(serde_json::from_value::<InvoiceObject>(object)?.into())
            }
            SUBSCRIPTION_DELETED => {
                let subscription: SubscriptionObject = serde_json::from_value(object)?;
                Self::SubscriptionCancelled {
                    subscription_id: subscription.id,
                }
            }
            other => Self::Ignored { kind: other.to_string() },
        };
        Ok(event)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::CheckoutCompleted(_) => CHECKOUT_COMPLETED,
            Self::PaymentSucceeded(_) => PAYMENT_SUCCEEDED,
            Self::PaymentFailed(_) => PAYMENT_FAILED,
            Self::UpcomingRenewal(_) => UPCOMING_RENEWAL,
            Self::SubscriptionCancelled { .. } => SUBSCRIPTION_DELETED,
            Self::Ignored { kind } => kind.as_str(),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// An id the gateway may send bare or as an expanded object
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct SessionObject {
    id: String,
    mode: String,
    #[serde(default)]
    subscription: Option<ExpandableId>,
    #[serde(default)]
    payment_intent: Option<ExpandableId>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct InvoiceObject {
    // Upcoming invoices have no id yet
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subscription: Option<ExpandableId>,
    #[serde(default)]
    payment_intent: Option<ExpandableId>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    customer: Option<ExpandableId>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    next_payment_attempt: Option<i64>,
}

impl InvoiceObject {
    /// A paid invoice must carry an id to key its payment on
    fn into_settlement(self) -> Result<InvoiceEvent> {
        if self.id.as_deref().is_none_or(str::is_empty) && self.payment_intent.is_none() {
            return Err(PaymentError::Validation(
                "paid invoice has neither an id nor a payment intent".into(),
            ));
        }
        Ok(self.into())
    }
}

impl From<InvoiceObject> for InvoiceEvent {
    fn from(invoice: InvoiceObject) -> Self {
        Self {
            invoice_id: invoice.id.unwrap_or_default(),
            subscription_id: invoice.subscription.map(ExpandableId::into_id),
            transaction_id: invoice.payment_intent.map(ExpandableId::into_id),
            amount_paid: invoice.amount_paid,
            customer_id: invoice.customer.map(ExpandableId::into_id),
            customer_email: invoice.customer_email.filter(|e| !e.is_empty()),
            next_payment_attempt: invoice
                .next_payment_attempt
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn envelope(kind: &str, object: &Value) -> String {
        json!({ "id": "evt_1", "type": kind, "data": { "object": object } }).to_string()
    }

    #[test]
    fn test_decodes_recurring_checkout() {
        let user_id = Uuid::new_v4();
        let payload = envelope(
            CHECKOUT_COMPLETED,
            &json!({
                "id": "cs_1",
                "mode": "subscription",
                "subscription": "sub_1",
                "payment_intent": null,
                "customer_details": { "email": "ada@example.com" },
                "metadata": {
                    "user_id": user_id.to_string(),
                    "gift": "True",
                    "recipient_name": "Ada"
                }
            }),
        );

        let GatewayEvent::CheckoutCompleted(checkout) = GatewayEvent::from_json(&payload).unwrap()
        else {
            panic!("expected checkout event");
        };
        assert_eq!(checkout.mode, CheckoutMode::Recurring);
        assert_eq!(checkout.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(checkout.transaction_id, None);
        assert_eq!(checkout.customer_email.as_deref(), Some("ada@example.com"));
        assert_eq!(checkout.metadata.user_id, user_id);
        assert!(checkout.metadata.gift);
        assert_eq!(checkout.metadata.recipient_email, "");
    }

    #[test]
    fn test_expanded_ids_are_flattened() {
        let payload = envelope(
            PAYMENT_SUCCEEDED,
            &json!({
                "id": "in_1",
                "subscription": { "id": "sub_1", "object": "subscription" },
                "payment_intent": "pi_1",
                "amount_paid": 2999,
                "customer": "cus_1",
                "next_payment_attempt": 1_793_491_200
            }),
        );

        let GatewayEvent::PaymentSucceeded(invoice) = GatewayEvent::from_json(&payload).unwrap()
        else {
            panic!("expected invoice event");
        };
        assert_eq!(invoice.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(invoice.settlement_id(), "pi_1");
        assert_eq!(invoice.customer_id.as_deref(), Some("cus_1"));
        assert!(invoice.next_payment_attempt.is_some());
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let payload = envelope("charge.refunded", &json!({ "id": "ch_1" }));
        let event = GatewayEvent::from_json(&payload).unwrap();
        assert_eq!(event, GatewayEvent::Ignored { kind: "charge.refunded".into() });
        assert_eq!(event.kind(), "charge.refunded");
    }

    #[test]
    fn test_missing_user_metadata_is_validation_error() {
        let payload = envelope(
            CHECKOUT_COMPLETED,
            &json!({ "id": "cs_1", "mode": "payment", "payment_intent": "pi_1", "metadata": {} }),
        );
        let err = GatewayEvent::from_json(&payload).unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[test]
    fn test_malformed_payload_is_parse_error() {
        assert!(matches!(GatewayEvent::from_json("{not json"), Err(PaymentError::Json(_))));
        let payload = envelope(CHECKOUT_COMPLETED, &json!({ "mode": "payment" }));
        assert!(matches!(GatewayEvent::from_json(&payload), Err(PaymentError::Json(_))));
    }

    #[test]
    fn test_invoice_without_payment_intent_settles_by_invoice_id() {
        let payload = envelope(
            PAYMENT_SUCCEEDED,
            &json!({ "id": "in_9", "subscription": "sub_1", "amount_paid": 100 }),
        );
        let GatewayEvent::PaymentSucceeded(invoice) = GatewayEvent::from_json(&payload).unwrap()
        else {
            panic!("expected invoice event");
        };
        assert_eq!(invoice.settlement_id(), "in_9");
    }

    #[test]
    fn test_paid_invoice_without_any_id_is_rejected() {
        for object in [
            json!({ "subscription": "sub_1", "amount_paid": 100 }),
            json!({ "id": "", "subscription": "sub_1", "amount_paid": 100 }),
        ] {
            let payload = envelope(PAYMENT_SUCCEEDED, &object);
            let err = GatewayEvent::from_json(&payload).unwrap_err();
            assert!(matches!(err, PaymentError::Validation(_)), "{object}");
        }

        // Upcoming invoices legitimately have no id
        let payload = envelope(UPCOMING_RENEWAL, &json!({ "subscription": "sub_1" }));
        assert!(matches!(
            GatewayEvent::from_json(&payload),
            Ok(GatewayEvent::UpcomingRenewal(_))
        ));
    }
}
