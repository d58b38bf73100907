//! Customer Notifications
//!
//! One-way sink for customer emails triggered by reconciliation. Sent only
//! after the records they describe are committed; a failed send is logged
//! and never undoes the commit.

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PaymentError, Result};

/// A customer-facing message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    SubscriptionConfirmed {
        to: String,
        plan: String,
    },
    /// Sent to the gift recipient
    GiftReceived {
        to: String,
        recipient_name: String,
        sender_name: String,
        message: String,
        plan: String,
    },
    /// Sent to the buyer of a gift
    GiftSent {
        to: String,
        recipient_name: String,
        plan: String,
    },
    OrderConfirmed {
        to: String,
        order_id: Uuid,
    },
    PaymentFailed {
        to: String,
    },
    UpcomingRenewal {
        to: String,
        renewal_date: String,
    },
    SubscriptionCancelled {
        to: String,
    },
}

impl Notification {
    pub fn recipient(&self) -> &str {
        match self {
            Self::SubscriptionConfirmed { to, .. }
            | Self::GiftReceived { to, .. }
            | Self::GiftSent { to, .. }
            | Self::OrderConfirmed { to, .. }
            | Self::PaymentFailed { to }
            | Self::UpcomingRenewal { to, .. }
            | Self::SubscriptionCancelled { to } => to,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SubscriptionConfirmed { .. } => "subscription_confirmed",
            Self::GiftReceived { .. } => "gift_received",
            Self::GiftSent { .. } => "gift_sent",
            Self::OrderConfirmed { .. } => "order_confirmed",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::UpcomingRenewal { .. } => "upcoming_renewal",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
        }
    }
}

/// Notification sender trait
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Writes notifications to the log instead of sending them
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            kind = notification.kind(),
            to = %notification.recipient(),
            "Customer notification"
        );
        Ok(())
    }
}

/// Keeps sent notifications in memory (for testing)
#[derive(Default)]
pub struct MemoryNotifier {
    sent: RwLock<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent().iter().filter(|n| n.kind() == kind).count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        self.sent
            .write()
            .map_err(|_| PaymentError::Fatal("notifier lock poisoned".into()))?
            .push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_notifier_records_in_order() {
        let notifier = MemoryNotifier::new();
        notifier
            .send(Notification::PaymentFailed {
                to: "ada@example.com".into(),
            })
            .await
            .unwrap();
        notifier
            .send(Notification::SubscriptionCancelled {
                to: "ada@example.com".into(),
            })
            .await
            .unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind(), "payment_failed");
        assert_eq!(sent[1].recipient(), "ada@example.com");
        assert_eq!(notifier.count("subscription_cancelled"), 1);
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let json = serde_json::to_value(Notification::UpcomingRenewal {
            to: "ada@example.com".into(),
            renewal_date: "November 01, 2026".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "upcoming_renewal");
        assert_eq!(json["renewal_date"], "November 01, 2026");
    }
}
