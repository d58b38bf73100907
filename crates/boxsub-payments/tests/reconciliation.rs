//! Webhook delivery scenarios against the in-memory store and mock gateway.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use boxsub_core::{
    AddressKind, BillingStore, CatalogBox, MemoryStore, RetryPolicy, ShippingAddress, User,
};
use boxsub_payments::{
    CheckoutMetadata, CheckoutSessionBuilder, CheckoutWizard, DispatchOutcome, GiftDetails,
    GiftForm, MemoryNotifier, MockGateway, Notification, Notifier, OrderReconciler, PaymentError,
    Plan, PriceCatalog, WebhookDispatcher, WebhookVerifier, WizardState, WizardStep,
};
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use serde_json::json;

const SECRET: &str = "whsec_integration";

struct World {
    store: Arc<MemoryStore>,
    gateway: Arc<MockGateway>,
    notifier: Arc<MemoryNotifier>,
    catalog: Arc<PriceCatalog>,
    dispatcher: Arc<WebhookDispatcher>,
    verifier: WebhookVerifier,
    user: User,
    home: ShippingAddress,
    gift_address: ShippingAddress,
}

impl World {
    fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    fn with_policy(policy: RetryPolicy) -> Self {
        Self::build(policy, None)
    }

    /// Reconciler sends through `sender`; `notifier` stays empty
    fn with_notifier(sender: Arc<dyn Notifier>) -> Self {
        Self::build(RetryPolicy::default(), Some(sender))
    }

    fn build(policy: RetryPolicy, sender: Option<Arc<dyn Notifier>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let user = User::new("charles", "charles@example.com");
        let home = ShippingAddress::new(user.id, AddressKind::Personal)
            .with_recipient("Charles", "Babbage")
            .with_street("1 Engine Row", "London", "N1 1AA", "GB")
            .as_default();
        let gift_address = ShippingAddress::new(user.id, AddressKind::Gift)
            .with_recipient("Ada", "Lovelace")
            .with_street("2 Analytical Way", "London", "N1 1AB", "GB");
        store.insert_user(user.clone()).unwrap();
        store.insert_address(home.clone()).unwrap();
        store.insert_address(gift_address.clone()).unwrap();
        let ships_on = NaiveDate::from_ymd_opt(2026, 12, 1).unwrap();
        store.insert_box(CatalogBox::new("Winter Box", ships_on)).unwrap();

        let gateway = Arc::new(
            MockGateway::new()
                .with_subscription_price("sub_1", "price_demo_3mo")
                .with_amount("pi_1", 3500),
        );
        let notifier = Arc::new(MemoryNotifier::new());
        let sender: Arc<dyn Notifier> = match sender {
            Some(sender) => sender,
            None => notifier.clone(),
        };
        let catalog = Arc::new(PriceCatalog::demo());
        let reconciler =
            OrderReconciler::new(store.clone(), gateway.clone(), sender, catalog.clone())
                .with_policy(policy);
        let verifier = WebhookVerifier::new(SECRET);
        let dispatcher = Arc::new(WebhookDispatcher::new(verifier.clone(), Arc::new(reconciler)));

        Self {
            store,
            gateway,
            notifier,
            catalog,
            dispatcher,
            verifier,
            user,
            home,
            gift_address,
        }
    }

    /// Personal order to the home address
    fn metadata(&self, plan: Plan) -> HashMap<String, String> {
        CheckoutMetadata::new(self.user.id, plan, self.home.id).to_map()
    }

    fn sign(&self, payload: &str) -> String {
        self.verifier.sign(payload, Utc::now().timestamp()).unwrap()
    }

    async fn deliver(&self, payload: &str) -> boxsub_payments::Result<DispatchOutcome> {
        let header = self.sign(payload);
        self.dispatcher.dispatch(payload, Some(&header)).await
    }

    /// Deliver the same payload `n` times from separate tasks
    async fn deliver_concurrently(&self, payload: &str, n: usize) -> Vec<DispatchOutcome> {
        let header = self.sign(payload);
        let tasks = (0..n).map(|_| {
            let dispatcher = self.dispatcher.clone();
            let payload = payload.to_string();
            let header = header.clone();
            tokio::spawn(async move { dispatcher.dispatch(&payload, Some(&header)).await })
        });
        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect()
    }
}

/// Counts sends and fails every one of them
#[derive(Default)]
struct FailingNotifier {
    attempts: AtomicUsize,
}

impl FailingNotifier {
    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _notification: Notification) -> boxsub_payments::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PaymentError::Transient("mail relay unavailable".into()))
    }
}

fn subscription_checkout(subscription_id: &str, metadata: &HashMap<String, String>) -> String {
    json!({
        "id": "evt_checkout",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_test_1",
            "mode": "subscription",
            "subscription": subscription_id,
            "payment_intent": null,
            "customer_email": "charles@example.com",
            "metadata": metadata,
        }}
    })
    .to_string()
}

fn one_off_checkout(transaction_id: &str, metadata: &HashMap<String, String>) -> String {
    json!({
        "id": "evt_checkout",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": "cs_test_2",
            "mode": "payment",
            "subscription": null,
            "payment_intent": transaction_id,
            "amount_total": 3500,
            "metadata": metadata,
        }}
    })
    .to_string()
}

fn renewal(subscription_id: &str, transaction_id: &str) -> String {
    json!({
        "id": "evt_invoice",
        "type": "invoice.payment_succeeded",
        "data": { "object": {
            "id": format!("in_{transaction_id}"),
            "subscription": subscription_id,
            "payment_intent": transaction_id,
            "amount_paid": 2999,
            "customer_email": "charles@example.com",
        }}
    })
    .to_string()
}

async fn assert_single_subscription(concurrency: usize) {
    let world = World::new();
    let metadata = world.metadata(Plan::ThreeMonth);
    let payload = subscription_checkout("sub_1", &metadata);

    let outcomes = world.deliver_concurrently(&payload, concurrency).await;

    assert_eq!(outcomes.iter().filter(|o| **o == DispatchOutcome::Processed).count(), 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, DispatchOutcome::Processed | DispatchOutcome::Duplicate)));
    assert_eq!(world.store.subscription_count().unwrap(), 1);
    assert_eq!(world.store.order_count().unwrap(), 1);
    assert_eq!(world.notifier.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_concurrent_deliveries_create_one_subscription() {
    assert_single_subscription(2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_concurrent_deliveries_create_one_subscription() {
    assert_single_subscription(5).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twenty_concurrent_deliveries_create_one_subscription() {
    assert_single_subscription(20).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_external_ids_stay_unique_under_mixed_traffic() {
    let world = World::new();
    let recurring = subscription_checkout("sub_1", &world.metadata(Plan::ThreeMonth));
    let one_off = one_off_checkout("pi_1", &world.metadata(Plan::OneOff));

    let (a, b) = tokio::join!(
        world.deliver_concurrently(&recurring, 8),
        world.deliver_concurrently(&one_off, 8),
    );
    assert_eq!(a.len() + b.len(), 16);

    let renewal_r1 = renewal("sub_1", "pi_r1");
    let renewal_r2 = renewal("sub_1", "pi_r2");
    let (c, d) = tokio::join!(
        world.deliver_concurrently(&renewal_r1, 4),
        world.deliver_concurrently(&renewal_r2, 4),
    );
    assert_eq!(c.len() + d.len(), 8);

    let orders = world.store.orders_for_user(world.user.id).unwrap();
    let subscriptions: Vec<_> = orders
        .iter()
        .filter_map(|o| o.subscription_id.as_deref())
        .collect();
    let transactions: Vec<_> = orders
        .iter()
        .filter_map(|o| o.transaction_id.as_deref())
        .collect();
    assert_eq!(subscriptions.len(), subscriptions.iter().collect::<HashSet<_>>().len());
    assert_eq!(transactions.len(), transactions.iter().collect::<HashSet<_>>().len());

    // Checkout order (paid by pi_r1 or pi_r2), one renewal order, one one-off order
    assert_eq!(orders.len(), 3);
    assert_eq!(world.store.payment_count().unwrap(), 3);
}

#[tokio::test]
async fn test_failed_commit_leaves_no_partial_one_off_order() {
    let world = World::new();
    let payload = one_off_checkout("pi_1", &world.metadata(Plan::OneOff));

    world.store.fail_next_commit_before_payments();
    let outcome = world.deliver(&payload).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Failed);
    assert_eq!(world.store.order_count().unwrap(), 0);
    assert_eq!(world.store.payment_count().unwrap(), 0);
    assert!(world.notifier.sent().is_empty());

    // Redelivery after the fault goes through cleanly
    assert_eq!(world.deliver(&payload).await.unwrap(), DispatchOutcome::Processed);
    assert_eq!(world.store.order_count().unwrap(), 1);
    assert_eq!(world.store.payment_count().unwrap(), 1);
}

#[tokio::test]
async fn test_exhausted_gateway_retries_ask_for_redelivery() {
    let world = World::with_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter: false,
    });
    world.gateway.fail_lookups(10);
    let payload = subscription_checkout("sub_1", &world.metadata(Plan::ThreeMonth));

    let err = world.deliver(&payload).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(world.gateway.lookup_calls(), 3);
    assert_eq!(world.store.order_count().unwrap(), 0);
}

#[tokio::test]
async fn test_unsigned_or_forged_deliveries_are_rejected() {
    let world = World::new();
    let payload = subscription_checkout("sub_1", &world.metadata(Plan::ThreeMonth));

    let missing = world.dispatcher.dispatch(&payload, None).await.unwrap_err();
    assert!(matches!(missing, PaymentError::Authentication(_)));

    let forged = WebhookVerifier::new("whsec_attacker")
        .sign(&payload, Utc::now().timestamp())
        .unwrap();
    let err = world.dispatcher.dispatch(&payload, Some(&forged)).await.unwrap_err();
    assert!(matches!(err, PaymentError::Authentication(_)));

    assert_eq!(world.store.order_count().unwrap(), 0);
    assert_eq!(world.gateway.lookup_calls(), 0);
}

#[tokio::test]
async fn test_unusable_metadata_is_acknowledged_and_dropped() {
    let world = World::new();
    let mut metadata = world.metadata(Plan::ThreeMonth);
    metadata.remove("user_id");

    let outcome = world.deliver(&subscription_checkout("sub_1", &metadata)).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Dropped);
    assert_eq!(world.store.order_count().unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_a_parse_error() {
    let world = World::new();
    let err = world.deliver("{\"type\": ").await.unwrap_err();
    assert!(matches!(err, PaymentError::Json(_)));
}

#[tokio::test]
async fn test_unknown_event_kinds_are_acknowledged() {
    let world = World::new();
    let payload =
        json!({ "type": "charge.refunded", "data": { "object": { "id": "ch_1" } } }).to_string();
    assert_eq!(world.deliver(&payload).await.unwrap(), DispatchOutcome::Ignored);
}

#[tokio::test]
async fn test_renewal_for_unknown_subscription_is_skipped() {
    let world = World::new();
    let outcome = world.deliver(&renewal("sub_missing", "pi_r1")).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Dropped);
    assert_eq!(world.store.order_count().unwrap(), 0);
    assert_eq!(world.store.payment_count().unwrap(), 0);
}

#[test]
fn test_gift_wizard_never_skips_prerequisites() {
    let world = World::new();
    let gift = GiftForm {
        recipient_name: "Ada".into(),
        recipient_email: "ada@example.com".into(),
        ..GiftForm::default()
    };

    let (state, _) = WizardState::start(world.user.id);
    let (state, _) = state.select_plan("3mo", true);
    let (state, transition) = state.submit_gift_message(&gift);
    assert_eq!(transition.next, WizardStep::ChooseAddress);
    assert!(state.gift.is_none());

    let (state, transition) = state.select_address(&world.gift_address);
    assert_eq!(transition.next, WizardStep::GiftMessage);
    assert!(state.ready_for_session().is_err());
}

#[tokio::test]
async fn test_gift_subscription_end_to_end() {
    let world = World::new();
    let builder = CheckoutSessionBuilder::new(
        world.gateway.clone(),
        world.catalog.clone(),
        "https://boxes.test",
    );
    let store: Arc<dyn BillingStore> = world.store.clone();
    let wizard = CheckoutWizard::new(store, builder);

    // Wizard: plan → gift address → gift message → hosted session
    let (state, _) = WizardState::start(world.user.id);
    let (state, _) = state.select_plan("3mo", true);
    let (state, transition) = wizard.choose_address(state, world.gift_address.id);
    assert_eq!(transition.next, WizardStep::GiftMessage);
    let (state, transition) = state.submit_gift_message(&GiftForm {
        recipient_name: "Ada".into(),
        recipient_email: "ada@example.com".into(),
        sender_name: "Charles".into(),
        gift_message: "Happy birthday!".into(),
    });
    assert_eq!(transition.next, WizardStep::CreateSession);
    let (_, transition) = wizard.create_session(state).await;
    assert_eq!(transition.next, WizardStep::AwaitingPayment);
    assert!(transition.redirect_url.is_some());
    assert_eq!(world.store.order_count().unwrap(), 0);

    let sessions = world.gateway.sessions();
    assert_eq!(sessions.len(), 1);
    let metadata = &sessions[0].metadata;
    assert_eq!(metadata["gift"], "true");
    let decoded = CheckoutMetadata::from_map(metadata).unwrap();
    assert_eq!(decoded.shipping_address_id, Some(world.gift_address.id));
    assert_eq!(
        decoded.gift_details(),
        GiftDetails {
            recipient_name: "Ada".into(),
            recipient_email: "ada@example.com".into(),
            sender_name: "Charles".into(),
            gift_message: "Happy birthday!".into(),
        }
    );

    // Settlement echoes the session metadata back
    let payload = subscription_checkout("sub_1", metadata);
    assert_eq!(world.deliver(&payload).await.unwrap(), DispatchOutcome::Processed);

    let order = world.store.order_by_subscription("sub_1").unwrap().unwrap();
    assert!(order.is_gift);
    assert_eq!(order.shipping_address_id, Some(world.gift_address.id));
    let meta = world.store.subscription_meta("sub_1").unwrap().unwrap();
    assert!(meta.is_gift);
    assert_eq!(world.notifier.count("gift_received"), 1);
    assert_eq!(world.notifier.count("gift_sent"), 1);

    // Duplicate delivery changes nothing
    assert_eq!(world.deliver(&payload).await.unwrap(), DispatchOutcome::Duplicate);
    assert_eq!(world.store.order_count().unwrap(), 1);
    assert_eq!(world.store.subscription_count().unwrap(), 1);
    assert_eq!(world.notifier.sent().len(), 2);
}

#[tokio::test]
async fn test_notification_failures_never_undo_committed_records() {
    let failing = Arc::new(FailingNotifier::default());
    let world = World::with_notifier(failing.clone());
    let gift = GiftDetails {
        recipient_name: "Ada".into(),
        recipient_email: "ada@example.com".into(),
        sender_name: "Charles".into(),
        gift_message: "Happy birthday!".into(),
    };

    // Gift subscription: recipient and buyer notices both fail
    let metadata = CheckoutMetadata::new(world.user.id, Plan::ThreeMonth, world.gift_address.id)
        .with_gift(&gift)
        .to_map();
    let checkout = subscription_checkout("sub_1", &metadata);
    assert_eq!(world.deliver(&checkout).await.unwrap(), DispatchOutcome::Processed);
    let order = world.store.order_by_subscription("sub_1").unwrap().unwrap();
    assert!(order.is_gift);
    assert!(world.store.subscription_meta("sub_1").unwrap().is_some());
    assert_eq!(failing.attempts(), 2);

    // First invoice pays the checkout order
    let invoice = renewal("sub_1", "pi_first");
    assert_eq!(world.deliver(&invoice).await.unwrap(), DispatchOutcome::Processed);
    let payment = world.store.payment_by_transaction("pi_first").unwrap().unwrap();
    assert_eq!(payment.order_id, order.id);
    assert_eq!(failing.attempts(), 3);

    // One-off gift
    let one_off = CheckoutMetadata::new(world.user.id, Plan::OneOff, world.gift_address.id)
        .with_gift(&gift)
        .to_map();
    let purchase = one_off_checkout("pi_1", &one_off);
    assert_eq!(world.deliver(&purchase).await.unwrap(), DispatchOutcome::Processed);
    assert!(world.store.payment_by_transaction("pi_1").unwrap().is_some());
    assert!(world.store.order_by_transaction("pi_1").unwrap().is_some());
    assert_eq!(failing.attempts(), 5);

    // Redeliveries find the committed records
    for payload in [&checkout, &invoice, &purchase] {
        assert_eq!(world.deliver(payload).await.unwrap(), DispatchOutcome::Duplicate);
    }
    assert_eq!(world.store.order_count().unwrap(), 2);
    assert_eq!(world.store.payment_count().unwrap(), 2);
    assert_eq!(failing.attempts(), 5);
    assert!(world.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_paid_invoice_without_ids_is_dropped() {
    let world = World::new();
    let payload = json!({
        "id": "evt_invoice",
        "type": "invoice.payment_succeeded",
        "data": { "object": { "subscription": "sub_1", "amount_paid": 2999 } }
    })
    .to_string();

    assert_eq!(world.deliver(&payload).await.unwrap(), DispatchOutcome::Dropped);
    assert_eq!(world.store.payment_count().unwrap(), 0);
}
