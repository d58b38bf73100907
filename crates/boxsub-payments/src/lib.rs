//! # boxsub-payments
//!
//! Checkout and payment reconciliation for subscription boxes.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐  session   ┌─────────────────┐  webhook   ┌──────────────────┐
//! │   Checkout   │───────────▶│  Stripe Hosted  │───────────▶│    Webhook       │
//! │   Wizard     │  metadata  │  Checkout Page  │  (signed)  │    Dispatcher    │
//! └──────────────┘            └─────────────────┘            └────────┬─────────┘
//!                                                                     │
//!                                                           ┌─────────▼────────┐
//!                                                           │ OrderReconciler  │
//!                                                           │ (guarded writes) │
//!                                                           └──────────────────┘
//! ```
//!
//! The wizard never writes orders. Everything the reconciler needs to build
//! them travels through the gateway as flat checkout metadata and comes back
//! on the completion event.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use boxsub_payments::{OrderReconciler, WebhookDispatcher, WebhookVerifier};
//!
//! let reconciler = Arc::new(OrderReconciler::new(store, gateway, notifier, catalog));
//! let dispatcher = WebhookDispatcher::new(WebhookVerifier::new("whsec_xxx"), reconciler);
//!
//! // In the webhook handler:
//! let outcome = dispatcher.dispatch(&body, signature_header).await?;
//! ```

mod address;
mod checkout;
mod error;
mod event;
mod gateway;
mod metadata;
mod notify;
mod plan;
mod reconciler;
mod webhook;
mod wizard;

pub use address::ShippingAddressResolver;
pub use checkout::{CheckoutSessionBuilder, SessionInput};
pub use error::{PaymentError, Result};
pub use event::{CheckoutCompleted, DispatchOutcome, GatewayEvent, InvoiceEvent};
pub use gateway::{
    CheckoutSessionRequest, CreatedSession, GatewayConfig, MockGateway, PaymentGateway,
    StripeGateway,
};
pub use metadata::{CheckoutMetadata, GiftDetails};
pub use notify::{LogNotifier, MemoryNotifier, Notification, Notifier};
pub use plan::{CheckoutMode, Plan, PriceCatalog};
pub use reconciler::OrderReconciler;
pub use webhook::{DEFAULT_TOLERANCE_SECS, WebhookDispatcher, WebhookVerifier};
pub use wizard::{
    ACCOUNT_NOTICE, ADDRESS_NOTICE, CANCELLED_NOTICE, CheckoutWizard, GATEWAY_NOTICE, GiftForm,
    INVALID_PLAN_NOTICE, Transition, WizardState, WizardStep,
};
