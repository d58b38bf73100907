//! # boxsub-core
//!
//! Records and storage for subscription-box billing.
//!
//! Gateway notifications arrive at least once, in any order, and may race
//! each other or the customer's own browser. This crate holds the pieces
//! that keep the resulting writes idempotent:
//!
//! - [`model`]: orders, payments, subscription links and the user, address
//!   and catalog records they reference
//! - [`store`]: the [`BillingStore`] seam, all-or-nothing [`Change`] sets and
//!   an in-memory implementation
//! - [`guard`]: [`ConcurrencyGuard`], a per-key exclusive lock with bounded
//!   retry around a store transaction
//! - [`retry`]: [`RetryPolicy`], randomized exponential backoff
//!
//! ```rust,ignore
//! let guard = ConcurrencyGuard::new(store.clone());
//! let created = guard
//!     .with_exclusive_lock("subscription:sub_123", |tx| {
//!         if tx.order_by_subscription("sub_123")?.is_some() {
//!             return Ok(false);
//!         }
//!         tx.insert_order(order.clone());
//!         Ok(true)
//!     })
//!     .await?;
//! ```

pub mod error;
pub mod guard;
pub mod model;
pub mod retry;
pub mod store;

pub use error::{Result, StoreError};
pub use guard::ConcurrencyGuard;
pub use model::{
    AddressKind, AddressSnapshot, CatalogBox, Order, OrderStatus, Payment, PaymentStatus,
    ShippingAddress, SubscriptionMeta, User,
};
pub use retry::RetryPolicy;
pub use store::{BillingStore, Change, MemoryStore, Transaction};
