//! Billing Store
//!
//! Storage seam for reconciliation. Reads are plain lookups; writes are
//! collected into a [`Change`] set and applied by [`BillingStore::commit`]
//! all-or-nothing, with unique external ids re-checked at apply time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{
    CatalogBox, Order, OrderStatus, Payment, ShippingAddress, SubscriptionMeta, User,
};

/// A single write inside a commit
#[derive(Clone, Debug)]
pub enum Change {
    InsertOrder(Order),
    InsertPayment(Payment),
    InsertSubscriptionMeta(SubscriptionMeta),
    UpdateSubscriptionMeta(SubscriptionMeta),
}

/// Storage trait for billing records
pub trait BillingStore: Send + Sync {
    /// Get a user by id
    fn user(&self, id: Uuid) -> Result<Option<User>>;

    /// Get a user by email (case-insensitive)
    fn user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Get an address by id, regardless of owner
    fn address(&self, id: Uuid) -> Result<Option<ShippingAddress>>;

    /// All addresses a user owns
    fn addresses_for_user(&self, user_id: Uuid) -> Result<Vec<ShippingAddress>>;

    /// Non-archived box with the latest shipping date
    fn latest_open_box(&self) -> Result<Option<CatalogBox>>;

    fn order_by_subscription(&self, subscription_id: &str) -> Result<Option<Order>>;

    fn order_by_transaction(&self, transaction_id: &str) -> Result<Option<Order>>;

    /// A user's orders, newest first
    fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>>;

    fn payment_by_transaction(&self, transaction_id: &str) -> Result<Option<Payment>>;

    fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<Payment>>;

    /// Active (non-cancelled) subscription link
    fn subscription_meta(&self, subscription_id: &str) -> Result<Option<SubscriptionMeta>>;

    /// Apply every change or none of them
    fn commit(&self, changes: Vec<Change>) -> Result<()>;

    /// Move an order to a new fulfilment state
    fn update_order_status(&self, order_id: Uuid, status: OrderStatus) -> Result<Order>;

    /// Remove an address that nothing live points at
    fn delete_address(&self, user_id: Uuid, address_id: Uuid) -> Result<()>;
}

/// Pending change set with reads that see its own writes
pub struct Transaction<'a> {
    store: &'a dyn BillingStore,
    pending: Vec<Change>,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a dyn BillingStore) -> Self {
        Self {
            store,
            pending: Vec::new(),
        }
    }

    /// Underlying store for reads the change set can't affect
    pub fn store(&self) -> &dyn BillingStore {
        self.store
    }

    pub fn order_by_subscription(&self, subscription_id: &str) -> Result<Option<Order>> {
        let pending = self.pending_order(|o| o.subscription_id.as_deref() == Some(subscription_id));
        if let Some(order) = pending {
            return Ok(Some(order));
        }
        self.store.order_by_subscription(subscription_id)
    }

    pub fn order_by_transaction(&self, transaction_id: &str) -> Result<Option<Order>> {
        let pending = self.pending_order(|o| o.transaction_id.as_deref() == Some(transaction_id));
        if let Some(order) = pending {
            return Ok(Some(order));
        }
        self.store.order_by_transaction(transaction_id)
    }

    pub fn payment_by_transaction(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let pending = self.pending.iter().find_map(|change| match change {
            Change::InsertPayment(p) if p.transaction_id.as_deref() == Some(transaction_id) => {
                Some(p.clone())
            }
            _ => None,
        });
        match pending {
            Some(payment) => Ok(Some(payment)),
            None => self.store.payment_by_transaction(transaction_id),
        }
    }

    pub fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<Payment>> {
        let mut payments = self.store.payments_for_order(order_id)?;
        payments.extend(self.pending.iter().filter_map(|change| match change {
            Change::InsertPayment(p) if p.order_id == order_id => Some(p.clone()),
            _ => None,
        }));
        Ok(payments)
    }

    pub fn subscription_meta(&self, subscription_id: &str) -> Result<Option<SubscriptionMeta>> {
        let latest = self.pending.iter().rev().find_map(|change| match change {
            Change::InsertSubscriptionMeta(m) | Change::UpdateSubscriptionMeta(m)
                if m.subscription_id == subscription_id =>
            {
                Some(m.clone())
            }
            _ => None,
        });
        match latest {
            Some(meta) => Ok(Some(meta).filter(SubscriptionMeta::is_active)),
            None => self.store.subscription_meta(subscription_id),
        }
    }

    pub fn insert_order(&mut self, order: Order) {
        self.pending.push(Change::InsertOrder(order));
    }

    pub fn insert_payment(&mut self, payment: Payment) {
        self.pending.push(Change::InsertPayment(payment));
    }

    pub fn insert_subscription_meta(&mut self, meta: SubscriptionMeta) {
        self.pending.push(Change::InsertSubscriptionMeta(meta));
    }

    pub fn update_subscription_meta(&mut self, meta: SubscriptionMeta) {
        self.pending.push(Change::UpdateSubscriptionMeta(meta));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.pending
    }

    fn pending_order(&self, matches: impl Fn(&Order) -> bool) -> Option<Order> {
        self.pending.iter().find_map(|change| match change {
            Change::InsertOrder(o) if matches(o) => Some(o.clone()),
            _ => None,
        })
    }
}

#[derive(Clone, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    addresses: HashMap<Uuid, ShippingAddress>,
    boxes: HashMap<Uuid, CatalogBox>,
    orders: HashMap<Uuid, Order>,
    payments: HashMap<Uuid, Payment>,
    subscriptions: HashMap<Uuid, SubscriptionMeta>,
}

impl Tables {
    fn apply(&mut self, change: Change) -> Result<()> {
        match change {
            Change::InsertOrder(order) => {
                if let Some(sub) = order.subscription_id.as_deref() {
                    if self.orders.values().any(|o| o.subscription_id.as_deref() == Some(sub)) {
                        return Err(StoreError::UniqueViolation(format!(
                            "orders.subscription_id = {sub}"
                        )));
                    }
                }
                if let Some(txn) = order.transaction_id.as_deref() {
                    if self.orders.values().any(|o| o.transaction_id.as_deref() == Some(txn)) {
                        return Err(StoreError::UniqueViolation(format!(
                            "orders.transaction_id = {txn}"
                        )));
                    }
                }
                self.orders.insert(order.id, order);
            }
            Change::InsertPayment(payment) => {
                if !self.orders.contains_key(&payment.order_id) {
                    return Err(StoreError::NotFound(format!("order {}", payment.order_id)));
                }
                if let Some(txn) = payment.transaction_id.as_deref() {
                    if self.payments.values().any(|p| p.transaction_id.as_deref() == Some(txn)) {
                        return Err(StoreError::UniqueViolation(format!(
                            "payments.transaction_id = {txn}"
                        )));
                    }
                }
                self.payments.insert(payment.id, payment);
            }
            Change::InsertSubscriptionMeta(meta) => {
                if self
                    .subscriptions
                    .values()
                    .any(|m| m.is_active() && m.subscription_id == meta.subscription_id)
                {
                    return Err(StoreError::UniqueViolation(format!(
                        "subscriptions.subscription_id = {}",
                        meta.subscription_id
                    )));
                }
                self.subscriptions.insert(meta.id, meta);
            }
            Change::UpdateSubscriptionMeta(meta) => {
                if !self.subscriptions.contains_key(&meta.id) {
                    return Err(StoreError::NotFound(format!("subscription meta {}", meta.id)));
                }
                self.subscriptions.insert(meta.id, meta);
            }
        }
        Ok(())
    }

    fn address_in_use(&self, address_id: Uuid) -> bool {
        let by_order = self
            .orders
            .values()
            .any(|o| {
                o.shipping_address_id == Some(address_id) && o.status != OrderStatus::Cancelled
            });
        let by_subscription = self
            .subscriptions
            .values()
            .any(|m| m.is_active() && m.shipping_address_id == Some(address_id));
        by_order || by_subscription
    }
}

/// In-memory billing store (for development/testing)
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_before_payments: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            fail_before_payments: AtomicBool::new(false),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    pub fn insert_user(&self, user: User) -> Result<()> {
        self.write()?.users.insert(user.id, user);
        Ok(())
    }

    pub fn insert_address(&self, address: ShippingAddress) -> Result<()> {
        self.write()?.addresses.insert(address.id, address);
        Ok(())
    }

    pub fn insert_box(&self, catalog_box: CatalogBox) -> Result<()> {
        self.write()?.boxes.insert(catalog_box.id, catalog_box);
        Ok(())
    }

    /// Make the next commit that reaches a payment insert fail, after its
    /// order inserts have been applied
    pub fn fail_next_commit_before_payments(&self) {
        self.fail_before_payments.store(true, Ordering::SeqCst);
    }

    pub fn order_count(&self) -> Result<usize> {
        Ok(self.read()?.orders.len())
    }

    pub fn payment_count(&self) -> Result<usize> {
        Ok(self.read()?.payments.len())
    }

    pub fn subscription_count(&self) -> Result<usize> {
        Ok(self.read()?.subscriptions.len())
    }
}

impl BillingStore for MemoryStore {
    fn user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let tables = self.read()?;
        Ok(tables
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    fn address(&self, id: Uuid) -> Result<Option<ShippingAddress>> {
        Ok(self.read()?.addresses.get(&id).cloned())
    }

    fn addresses_for_user(&self, user_id: Uuid) -> Result<Vec<ShippingAddress>> {
        let tables = self.read()?;
        let mut addresses: Vec<_> = tables
            .addresses
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        addresses.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then_with(|| a.line1.cmp(&b.line1))
        });
        Ok(addresses)
    }

    fn latest_open_box(&self) -> Result<Option<CatalogBox>> {
        let tables = self.read()?;
        Ok(tables
            .boxes
            .values()
            .filter(|b| !b.archived)
            .max_by_key(|b| b.shipping_date)
            .cloned())
    }

    fn order_by_subscription(&self, subscription_id: &str) -> Result<Option<Order>> {
        let tables = self.read()?;
        Ok(tables
            .orders
            .values()
            .find(|o| o.subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    fn order_by_transaction(&self, transaction_id: &str) -> Result<Option<Order>> {
        let tables = self.read()?;
        Ok(tables
            .orders
            .values()
            .find(|o| o.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let tables = self.read()?;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_on.cmp(&a.created_on));
        Ok(orders)
    }

    fn payment_by_transaction(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let tables = self.read()?;
        Ok(tables
            .payments
            .values()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<Payment>> {
        let tables = self.read()?;
        let mut payments: Vec<_> = tables
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| a.paid_at.cmp(&b.paid_at));
        Ok(payments)
    }

    fn subscription_meta(&self, subscription_id: &str) -> Result<Option<SubscriptionMeta>> {
        let tables = self.read()?;
        Ok(tables
            .subscriptions
            .values()
            .find(|m| m.is_active() && m.subscription_id == subscription_id)
            .cloned())
    }

    fn commit(&self, changes: Vec<Change>) -> Result<()> {
        let mut tables = self.write()?;
        let mut next = tables.clone();

        for change in changes {
            let is_payment = matches!(change, Change::InsertPayment(_));
            if is_payment && self.fail_before_payments.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Injected(
                    "commit interrupted before payment insert".into(),
                ));
            }
            next.apply(change)?;
        }

        *tables = next;
        Ok(())
    }

    fn update_order_status(&self, order_id: Uuid, status: OrderStatus) -> Result<Order> {
        let mut tables = self.write()?;
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;
        order.status = status;
        Ok(order.clone())
    }

    fn delete_address(&self, user_id: Uuid, address_id: Uuid) -> Result<()> {
        let mut tables = self.write()?;
        match tables.addresses.get(&address_id) {
            Some(address) if address.user_id == user_id => {}
            _ => return Err(StoreError::NotFound(format!("address {address_id}"))),
        }
        if tables.address_in_use(address_id) {
            return Err(StoreError::Referenced(format!("address {address_id}")));
        }
        tables.addresses.remove(&address_id);
        Ok(())
    }
}
