//! Application State

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use boxsub_core::{BillingStore, RetryPolicy};
use boxsub_payments::{
    CheckoutSessionBuilder, CheckoutWizard, Notifier, OrderReconciler, PaymentGateway,
    PriceCatalog, WebhookDispatcher, WebhookVerifier, WizardState,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Orders, payments, users and addresses
    pub store: Arc<dyn BillingStore>,

    /// Verifies and reconciles gateway webhooks
    pub dispatcher: Arc<WebhookDispatcher>,

    /// Checkout steps that need the store or the gateway
    pub wizard: Arc<CheckoutWizard>,

    /// In-progress checkouts, keyed by browser session
    pub sessions: Arc<WizardSessions>,

    /// "stripe" or "mock"
    pub gateway_name: String,
}

/// Everything needed to assemble [`AppState`]
pub struct Components {
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub catalog: PriceCatalog,
    pub webhook_secret: String,
    pub base_url: String,
    pub policy: RetryPolicy,
    pub sessions: WizardSessions,
}

impl AppState {
    pub fn new(components: Components) -> Self {
        let catalog = Arc::new(components.catalog);

        let reconciler = OrderReconciler::new(
            components.store.clone(),
            components.gateway.clone(),
            components.notifier,
            catalog.clone(),
        )
        .with_policy(components.policy);
        let verifier = WebhookVerifier::new(components.webhook_secret);
        let dispatcher = WebhookDispatcher::new(verifier, Arc::new(reconciler));

        let builder =
            CheckoutSessionBuilder::new(components.gateway.clone(), catalog, components.base_url);
        let wizard = CheckoutWizard::new(components.store.clone(), builder);

        Self {
            store: components.store,
            dispatcher: Arc::new(dispatcher),
            wizard: Arc::new(wizard),
            sessions: Arc::new(components.sessions),
            gateway_name: components.gateway.name().to_string(),
        }
    }
}

/// Idle time after which an unfinished checkout is forgotten
pub const DEFAULT_SESSION_TTL_SECS: i64 = 2 * 60 * 60;

/// Upper bound on in-progress checkouts held in memory
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

struct Entry {
    state: WizardState,
    touched_at: DateTime<Utc>,
}

/// Wizard state per browser session
///
/// Session ids come from the client, so the map is bounded two ways: entries
/// idle longer than the TTL are treated as absent and swept on every save,
/// and past `max_entries` the least recently saved entries are evicted.
pub struct WizardSessions {
    entries: RwLock<HashMap<String, Entry>>,
    ttl_secs: i64,
    max_entries: usize,
}

impl Default for WizardSessions {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL_SECS, DEFAULT_MAX_SESSIONS)
    }
}

impl WizardSessions {
    pub fn new(ttl_secs: i64, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_secs,
            max_entries: max_entries.max(1),
        }
    }

    /// Current state for a session, or a fresh one
    ///
    /// A session that belongs to another user starts over.
    pub fn load(&self, session_id: &str, user_id: Uuid) -> WizardState {
        self.load_at(session_id, user_id, Utc::now())
    }

    fn load_at(&self, session_id: &str, user_id: Uuid, now: DateTime<Utc>) -> WizardState {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .filter(|entry| self.is_live(entry, now) && entry.state.user_id == user_id)
            .map_or_else(|| WizardState::new(user_id), |entry| entry.state.clone())
    }

    pub fn save(&self, session_id: &str, state: WizardState) {
        self.save_at(session_id, state, Utc::now());
    }

    fn save_at(&self, session_id: &str, state: WizardState, now: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| self.is_live(entry, now));
        entries.insert(
            session_id.to_string(),
            Entry {
                state,
                touched_at: now,
            },
        );

        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched_at)
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else { break };
            entries.remove(&oldest);
            tracing::debug!(session_id = %oldest, "Evicted wizard session over capacity");
        }
    }

    /// Drop and return the state for a session
    pub fn take(&self, session_id: &str, user_id: Uuid) -> Option<WizardState> {
        self.take_at(session_id, user_id, Utc::now())
    }

    fn take_at(&self, session_id: &str, user_id: Uuid, now: DateTime<Utc>) -> Option<WizardState> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let owned = entries
            .get(session_id)
            .is_some_and(|entry| entry.state.user_id == user_id);
        if !owned {
            return None;
        }
        entries
            .remove(session_id)
            .filter(|entry| self.is_live(entry, now))
            .map(|entry| entry.state)
    }

    /// Remove every expired session, returning how many went
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| self.is_live(entry, now));
        before - entries.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn is_live(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.touched_at).num_seconds() < self.ttl_secs
    }
}
