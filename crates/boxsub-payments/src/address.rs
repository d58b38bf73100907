//! Shipping Address Resolution

use std::sync::Arc;

use boxsub_core::{BillingStore, ShippingAddress};
use uuid::Uuid;

use crate::error::{PaymentError, Result};

/// Read-only lookup of a user's shipping addresses
#[derive(Clone)]
pub struct ShippingAddressResolver {
    store: Arc<dyn BillingStore>,
}

impl ShippingAddressResolver {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Resolve an address id the user owns
    ///
    /// Another user's address is reported exactly like a missing one.
    pub fn resolve(&self, user_id: Uuid, address_id: Uuid) -> Result<ShippingAddress> {
        self.store
            .address(address_id)?
            .filter(|address| address.user_id == user_id)
            .ok_or_else(|| {
                PaymentError::Validation(format!("shipping address {address_id} not found"))
            })
    }

    /// Resolve an address and check it matches the gift choice
    pub fn resolve_for_checkout(
        &self,
        user_id: Uuid,
        address_id: Uuid,
        is_gift: bool,
    ) -> Result<ShippingAddress> {
        let address = self.resolve(user_id, address_id)?;
        match (is_gift, address.is_gift()) {
            (true, false) => Err(PaymentError::Validation(
                "gift orders must ship to a gift address".into(),
            )),
            (false, true) => Err(PaymentError::Validation(
                "gift addresses can only be used for gift orders".into(),
            )),
            _ => Ok(address),
        }
    }

    /// Addresses offered at the address step
    pub fn choices(&self, user_id: Uuid, is_gift: bool) -> Result<Vec<ShippingAddress>> {
        Ok(self
            .store
            .addresses_for_user(user_id)?
            .into_iter()
            .filter(|address| address.is_gift() == is_gift)
            .collect())
    }
}
