//! Domain Records
//!
//! Users, shipping addresses, catalog boxes and the order, payment and
//! subscription rows written by reconciliation.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account holder (owned by the user directory)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

impl User {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
        }
    }
}

/// Whether an address is the user's own or only used for gifts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Personal,
    Gift,
}

/// A user-owned delivery address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: AddressKind,
    pub first_name: String,
    pub last_name: String,
    pub line1: String,
    pub line2: Option<String>,
    pub town_or_city: String,
    pub county: Option<String>,
    pub postcode: String,
    pub country: String,
    pub phone: Option<String>,
    pub is_default: bool,
}

impl ShippingAddress {
    /// Create an empty address of the given kind
    pub fn new(user_id: Uuid, kind: AddressKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            first_name: String::new(),
            last_name: String::new(),
            line1: String::new(),
            line2: None,
            town_or_city: String::new(),
            county: None,
            postcode: String::new(),
            country: String::new(),
            phone: None,
            is_default: false,
        }
    }

    #[must_use]
    pub fn with_recipient(mut self, first_name: &str, last_name: &str) -> Self {
        self.first_name = first_name.to_string();
        self.last_name = last_name.to_string();
        self
    }

    #[must_use]
    pub fn with_street(
        mut self,
        line1: &str,
        town_or_city: &str,
        postcode: &str,
        country: &str,
    ) -> Self {
        self.line1 = line1.to_string();
        self.town_or_city = town_or_city.to_string();
        self.postcode = postcode.to_string();
        self.country = country.to_string();
        self
    }

    #[must_use]
    pub const fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn is_gift(&self) -> bool {
        self.kind == AddressKind::Gift
    }

    pub fn recipient_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    /// Copy the delivery fields so later edits don't rewrite order history
    pub fn snapshot(&self) -> AddressSnapshot {
        AddressSnapshot {
            recipient_name: self.recipient_name(),
            line1: self.line1.clone(),
            line2: self.line2.clone(),
            town_or_city: self.town_or_city.clone(),
            county: self.county.clone(),
            postcode: self.postcode.clone(),
            country: self.country.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// Delivery fields frozen onto an order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub recipient_name: String,
    pub line1: String,
    pub line2: Option<String>,
    pub town_or_city: String,
    pub county: Option<String>,
    pub postcode: String,
    pub country: String,
    pub phone: Option<String>,
}

/// A box in the catalog (owned by catalog management)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogBox {
    pub id: Uuid,
    pub name: String,
    pub shipping_date: NaiveDate,
    pub archived: bool,
}

impl CatalogBox {
    pub fn new(name: impl Into<String>, shipping_date: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            shipping_date,
            archived: false,
        }
    }
}

/// Fulfilment state of an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A box shipment owed to a user
///
/// `subscription_id` and `transaction_id` are unique when present and act as
/// the idempotency keys for reconciliation. Billing-cycle orders created by
/// renewals carry the invoice transaction id and point back at their
/// subscription through `renewal_of`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub shipping_address_id: Option<Uuid>,
    pub shipping_address: Option<AddressSnapshot>,
    pub box_id: Option<Uuid>,
    pub subscription_id: Option<String>,
    pub transaction_id: Option<String>,
    pub renewal_of: Option<String>,
    pub created_on: DateTime<Utc>,
    pub scheduled_ship_date: Option<NaiveDate>,
    pub status: OrderStatus,
    pub is_gift: bool,
}

impl Order {
    /// New pending order with no address or box
    pub fn new(user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            shipping_address_id: None,
            shipping_address: None,
            box_id: None,
            subscription_id: None,
            transaction_id: None,
            renewal_of: None,
            created_on: Utc::now(),
            scheduled_ship_date: None,
            status: OrderStatus::Pending,
            is_gift: false,
        }
    }

    /// Ship to a resolved address
    #[must_use]
    pub fn ship_to(mut self, address: &ShippingAddress) -> Self {
        self.shipping_address_id = Some(address.id);
        self.shipping_address = Some(address.snapshot());
        self
    }

    /// Schedule against a catalog box (its shipping date becomes ours)
    #[must_use]
    pub fn scheduled_for(mut self, next_box: Option<&CatalogBox>) -> Self {
        self.box_id = next_box.map(|b| b.id);
        self.scheduled_ship_date = next_box.map(|b| b.shipping_date);
        self
    }
}

/// Settlement state of a payment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Failed,
    Refunded,
    Succeeded,
}

/// One settled gateway charge
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub method: String,
    pub transaction_id: Option<String>,
    pub paid_at: DateTime<Utc>,
}

impl Payment {
    /// Card payment for an amount in minor currency units (cents)
    pub fn card(
        order: &Order,
        amount_minor: i64,
        status: PaymentStatus,
        transaction_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            order_id: order.id,
            amount: Decimal::new(amount_minor, 2),
            status,
            method: "card".into(),
            transaction_id: Some(transaction_id.to_string()),
            paid_at: Utc::now(),
        }
    }
}

/// Durable link between a gateway subscription and a shipping destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMeta {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: String,
    pub price_id: String,
    pub shipping_address_id: Option<Uuid>,
    pub is_gift: bool,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl SubscriptionMeta {
    pub fn new(user_id: Uuid, subscription_id: &str, price_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subscription_id: subscription_id.to_string(),
            price_id: price_id.to_string(),
            shipping_address_id: None,
            is_gift: false,
            created_at: Utc::now(),
            cancelled_at: None,
        }
    }

    pub const fn is_active(&self) -> bool {
        self.cancelled_at.is_none()
    }
}
