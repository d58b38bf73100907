//! Plans and Prices
//!
//! Subscription plans offered at checkout and the gateway price ids they
//! bill against.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};

/// How the gateway bills a plan
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutMode {
    Recurring,
    OneOff,
}

impl CheckoutMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recurring => "recurring",
            Self::OneOff => "oneoff",
        }
    }
}

/// Subscription plan
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plan {
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "3mo")]
    ThreeMonth,
    #[serde(rename = "6mo")]
    SixMonth,
    #[serde(rename = "12mo")]
    TwelveMonth,
    #[serde(rename = "oneoff")]
    OneOff,
}

impl Plan {
    pub const ALL: [Self; 5] = [
        Self::Monthly,
        Self::ThreeMonth,
        Self::SixMonth,
        Self::TwelveMonth,
        Self::OneOff,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::ThreeMonth => "3mo",
            Self::SixMonth => "6mo",
            Self::TwelveMonth => "12mo",
            Self::OneOff => "oneoff",
        }
    }

    pub const fn mode(self) -> CheckoutMode {
        match self {
            Self::OneOff => CheckoutMode::OneOff,
            _ => CheckoutMode::Recurring,
        }
    }

    /// Billing interval in months (`None` for a single box)
    pub const fn months(self) -> Option<u32> {
        match self {
            Self::Monthly => Some(1),
            Self::ThreeMonth => Some(3),
            Self::SixMonth => Some(6),
            Self::TwelveMonth => Some(12),
            Self::OneOff => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Monthly => "Monthly Subscription",
            Self::ThreeMonth => "3 Month Subscription",
            Self::SixMonth => "6 Month Subscription",
            Self::TwelveMonth => "12 Month Subscription",
            Self::OneOff => "One-off Box",
        }
    }

    const fn price_env_var(self) -> &'static str {
        match self {
            Self::Monthly => "STRIPE_MONTHLY_PRICE_ID",
            Self::ThreeMonth => "STRIPE_3MO_PRICE_ID",
            Self::SixMonth => "STRIPE_6MO_PRICE_ID",
            Self::TwelveMonth => "STRIPE_12MO_PRICE_ID",
            Self::OneOff => "STRIPE_ONEOFF_PRICE_ID",
        }
    }
}

impl FromStr for Plan {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|plan| plan.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PaymentError::Validation(format!("unknown plan: {s}")))
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway price ids per plan
#[derive(Clone, Debug, Default)]
pub struct PriceCatalog {
    prices: HashMap<Plan, String>,
    gift_price: Option<String>,
}

impl PriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_price(mut self, plan: Plan, price_id: impl Into<String>) -> Self {
        self.prices.insert(plan, price_id.into());
        self
    }

    /// Separate price for one-off boxes bought as gifts
    #[must_use]
    pub fn with_gift_price(mut self, price_id: impl Into<String>) -> Self {
        self.gift_price = Some(price_id.into());
        self
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let mut catalog = Self::new();
        for plan in Plan::ALL {
            let var = plan.price_env_var();
            let price = std::env::var(var)
                .map_err(|_| PaymentError::Config(format!("{var} not set")))?;
            catalog = catalog.with_price(plan, price);
        }
        if let Ok(gift) = std::env::var("STRIPE_GIFT_PRICE_ID") {
            catalog = catalog.with_gift_price(gift);
        }
        Ok(catalog)
    }

    /// Placeholder ids for running against the mock gateway
    pub fn demo() -> Self {
        Plan::ALL
            .into_iter()
            .fold(Self::new(), |catalog, plan| {
                catalog.with_price(plan, format!("price_demo_{}", plan.as_str()))
            })
            .with_gift_price("price_demo_gift")
    }

    /// Price to bill for a plan
    pub fn price_for(&self, plan: Plan, is_gift: bool) -> Result<&str> {
        if is_gift && plan == Plan::OneOff {
            if let Some(gift) = self.gift_price.as_deref() {
                return Ok(gift);
            }
        }
        self.prices
            .get(&plan)
            .map(String::as_str)
            .ok_or_else(|| PaymentError::Config(format!("no price configured for plan {plan}")))
    }

    /// Reverse lookup from a gateway price id
    pub fn plan_for_price(&self, price_id: &str) -> Option<Plan> {
        if self.gift_price.as_deref() == Some(price_id) {
            return Some(Plan::OneOff);
        }
        self.prices
            .iter()
            .find(|(_, id)| id.as_str() == price_id)
            .map(|(plan, _)| *plan)
    }
}
