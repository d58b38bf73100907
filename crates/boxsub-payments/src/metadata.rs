//! Checkout Metadata
//!
//! The gateway echoes a flat string map back on every event for a session.
//! It is the only state that survives the trip through hosted checkout, so
//! everything reconciliation needs is encoded here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PaymentError, Result};
use crate::plan::Plan;

pub const USER_ID: &str = "user_id";
pub const SHIPPING_ADDRESS_ID: &str = "shipping_address_id";
pub const PLAN: &str = "plan";
pub const GIFT: &str = "gift";
pub const RECIPIENT_NAME: &str = "recipient_name";
pub const RECIPIENT_EMAIL: &str = "recipient_email";
pub const SENDER_NAME: &str = "sender_name";
pub const GIFT_MESSAGE: &str = "gift_message";

/// Gift card details collected by the wizard
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftDetails {
    pub recipient_name: String,
    pub recipient_email: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub gift_message: String,
}

impl GiftDetails {
    /// Both fields needed to deliver a gift notice are present
    pub fn is_deliverable(&self) -> bool {
        !self.recipient_name.trim().is_empty() && !self.recipient_email.trim().is_empty()
    }
}

/// Decoded checkout metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub user_id: Uuid,
    pub shipping_address_id: Option<Uuid>,
    pub plan: Option<Plan>,
    pub gift: bool,
    pub recipient_name: String,
    pub recipient_email: String,
    pub sender_name: String,
    pub gift_message: String,
}

impl CheckoutMetadata {
    pub fn new(user_id: Uuid, plan: Plan, shipping_address_id: Uuid) -> Self {
        Self {
            user_id,
            shipping_address_id: Some(shipping_address_id),
            plan: Some(plan),
            gift: false,
            recipient_name: String::new(),
            recipient_email: String::new(),
            sender_name: String::new(),
            gift_message: String::new(),
        }
    }

    #[must_use]
    pub fn with_gift(mut self, details: &GiftDetails) -> Self {
        self.gift = true;
        self.recipient_name.clone_from(&details.recipient_name);
        self.recipient_email.clone_from(&details.recipient_email);
        self.sender_name.clone_from(&details.sender_name);
        self.gift_message.clone_from(&details.gift_message);
        self
    }

    pub fn gift_details(&self) -> GiftDetails {
        GiftDetails {
            recipient_name: self.recipient_name.clone(),
            recipient_email: self.recipient_email.clone(),
            sender_name: self.sender_name.clone(),
            gift_message: self.gift_message.clone(),
        }
    }

    /// Encode into the gateway's metadata map
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(USER_ID.to_string(), self.user_id.to_string());
        if let Some(id) = self.shipping_address_id {
            map.insert(SHIPPING_ADDRESS_ID.to_string(), id.to_string());
        }
        if let Some(plan) = self.plan {
            map.insert(PLAN.to_string(), plan.as_str().to_string());
        }
        map.insert(GIFT.to_string(), self.gift.to_string());
        map.insert(RECIPIENT_NAME.to_string(), self.recipient_name.clone());
        map.insert(RECIPIENT_EMAIL.to_string(), self.recipient_email.clone());
        map.insert(SENDER_NAME.to_string(), self.sender_name.clone());
        map.insert(GIFT_MESSAGE.to_string(), self.gift_message.clone());
        map
    }

    /// Decode from the gateway's metadata map
    ///
    /// `user_id` is required. Gift fields default to empty strings, the gift
    /// flag is `true` only for a case-insensitive `"true"`, and an
    /// unparseable address id or plan is treated as absent.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let raw_user = map
            .get(USER_ID)
            .ok_or_else(|| PaymentError::Validation("metadata is missing user_id".into()))?;
        let user_id = Uuid::parse_str(raw_user.trim()).map_err(|_| {
            PaymentError::Validation(format!("metadata user_id is not a valid id: {raw_user}"))
        })?;

        let text = |key: &str| map.get(key).cloned().unwrap_or_default();

        Ok(Self {
            user_id,
            shipping_address_id: map
                .get(SHIPPING_ADDRESS_ID)
                .and_then(|v| Uuid::parse_str(v.trim()).ok()),
            plan: map.get(PLAN).and_then(|v| v.parse().ok()),
            gift: map.get(GIFT).is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            recipient_name: text(RECIPIENT_NAME),
            recipient_email: text(RECIPIENT_EMAIL),
            sender_name: text(SENDER_NAME),
            gift_message: text(GIFT_MESSAGE),
        })
    }
}
