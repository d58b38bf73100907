//! Checkout Wizard
//!
//! Plan → address → gift message (gift orders only) → hosted checkout.
//!
//! [`WizardState`] is plain data owned by the caller's session. Its methods
//! are pure transitions returning the new state plus where to send the
//! customer next. A step whose prerequisites are missing redirects back to
//! the earliest missing step instead of failing. [`CheckoutWizard`] adds the
//! effectful parts: address lookups and session creation.

use std::sync::Arc;

use boxsub_core::{BillingStore, ShippingAddress};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::address::ShippingAddressResolver;
use crate::checkout::{CheckoutSessionBuilder, SessionInput};
use crate::error::{PaymentError, Result};
use crate::gateway::CreatedSession;
use crate::metadata::GiftDetails;
use crate::plan::Plan;

pub const INVALID_PLAN_NOTICE: &str = "Invalid subscription plan.";
pub const ADDRESS_NOTICE: &str = "Please choose one of your saved addresses for this order.";
pub const ACCOUNT_NOTICE: &str = "We couldn't find your account. Please sign in again to continue.";
pub const GATEWAY_NOTICE: &str =
    "There was a problem connecting to the payment service. Please try again shortly.";
pub const CANCELLED_NOTICE: &str = "Your checkout was cancelled. You have not been charged.";

/// First failing field wins
const GIFT_FORM_NOTICES: [(&str, &str); 4] = [
    ("recipient_name", "Please enter the recipient's name (at most 100 characters)."),
    ("recipient_email", "Please enter a valid email address for the recipient."),
    ("sender_name", "Your name must be at most 100 characters."),
    ("gift_message", "Gift messages must be at most 250 characters."),
];

/// Wizard steps, in flow order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    ChoosePlan,
    ChooseAddress,
    GiftMessage,
    CreateSession,
    /// Customer is on the gateway's hosted page
    AwaitingPayment,
    Success,
    Cancelled,
}

impl WizardStep {
    pub const fn path(self) -> &'static str {
        match self {
            Self::ChoosePlan => "/checkout/plan",
            Self::ChooseAddress => "/checkout/address",
            Self::GiftMessage => "/checkout/gift",
            Self::CreateSession | Self::AwaitingPayment => "/checkout/session",
            Self::Success => "/checkout/success",
            Self::Cancelled => "/checkout/cancel",
        }
    }
}

/// Where to go after a wizard action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub next: WizardStep,
    pub notice: Option<String>,
    /// Hosted checkout page, once a session exists
    pub redirect_url: Option<String>,
}

impl Transition {
    pub const fn to(next: WizardStep) -> Self {
        Self {
            next,
            notice: None,
            redirect_url: None,
        }
    }

    pub fn with_notice(next: WizardStep, notice: impl Into<String>) -> Self {
        Self {
            next,
            notice: Some(notice.into()),
            redirect_url: None,
        }
    }

    fn redirect(url: &str) -> Self {
        Self {
            next: WizardStep::AwaitingPayment,
            notice: None,
            redirect_url: Some(url.to_string()),
        }
    }
}

/// Gift message form as submitted
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct GiftForm {
    #[serde(default)]
    #[validate(length(min = 1, max = 100))]
    pub recipient_name: String,
    #[serde(default)]
    #[validate(email)]
    pub recipient_email: String,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub sender_name: String,
    #[serde(default)]
    #[validate(length(max = 250))]
    pub gift_message: String,
}

impl GiftForm {
    /// Whitespace-trimmed copy of every field
    #[must_use]
    pub fn trimmed(&self) -> Self {
        Self {
            recipient_name: self.recipient_name.trim().to_string(),
            recipient_email: self.recipient_email.trim().to_string(),
            sender_name: self.sender_name.trim().to_string(),
            gift_message: self.gift_message.trim().to_string(),
        }
    }

    /// Trim and validate, returning the details to carry through checkout
    ///
    /// The error is the notice for the first invalid field.
    pub fn gift_details(&self) -> std::result::Result<GiftDetails, &'static str> {
        let form = self.trimmed();
        if let Err(errors) = form.validate() {
            let fields = errors.field_errors();
            let notice = GIFT_FORM_NOTICES
                .iter()
                .find(|(field, _)| fields.contains_key(*field))
                .map_or(GIFT_FORM_NOTICES[0].1, |(_, notice)| *notice);
            return Err(notice);
        }

        Ok(GiftDetails {
            recipient_name: form.recipient_name,
            recipient_email: form.recipient_email,
            sender_name: form.sender_name,
            gift_message: form.gift_message,
        })
    }
}

/// Session-scoped wizard data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WizardState {
    pub user_id: Uuid,
    pub plan: Option<Plan>,
    pub is_gift: bool,
    pub address_id: Option<Uuid>,
    pub gift: Option<GiftDetails>,
    /// Step to come back to after leaving the flow (e.g. to add an address)
    pub return_to: Option<WizardStep>,
    /// Gateway session created for this run
    pub session_id: Option<String>,
}

impl WizardState {
    pub const fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            plan: None,
            is_gift: false,
            address_id: None,
            gift: None,
            return_to: None,
            session_id: None,
        }
    }

    /// Fresh state; anything from an earlier run is dropped
    pub const fn start(user_id: Uuid) -> (Self, Transition) {
        (Self::new(user_id), Transition::to(WizardStep::ChoosePlan))
    }

    /// Earliest step whose data is still missing
    pub const fn required_step(&self) -> WizardStep {
        if self.plan.is_none() {
            WizardStep::ChoosePlan
        } else if self.address_id.is_none() {
            WizardStep::ChooseAddress
        } else if self.is_gift && self.gift.is_none() {
            WizardStep::GiftMessage
        } else {
            WizardStep::CreateSession
        }
    }

    /// Pick a plan; downstream choices are cleared
    pub fn select_plan(mut self, plan_key: &str, is_gift: bool) -> (Self, Transition) {
        let Ok(plan) = plan_key.parse::<Plan>() else {
            return (self, Transition::with_notice(WizardStep::ChoosePlan, INVALID_PLAN_NOTICE));
        };

        self.plan = Some(plan);
        self.is_gift = is_gift;
        self.address_id = None;
        self.gift = None;
        self.session_id = None;
        (self, Transition::to(WizardStep::ChooseAddress))
    }

    /// Pick a resolved address
    pub fn select_address(mut self, address: &ShippingAddress) -> (Self, Transition) {
        if self.plan.is_none() {
            return (self, Transition::to(WizardStep::ChoosePlan));
        }
        if address.user_id != self.user_id || address.is_gift() != self.is_gift {
            return (self, Transition::with_notice(WizardStep::ChooseAddress, ADDRESS_NOTICE));
        }

        self.address_id = Some(address.id);
        self.session_id = None;
        let next = if self.is_gift {
            WizardStep::GiftMessage
        } else {
            WizardStep::CreateSession
        };
        (self, Transition::to(next))
    }

    /// Submit the gift message form
    pub fn submit_gift_message(mut self, form: &GiftForm) -> (Self, Transition) {
        if !self.is_gift {
            let next = self.required_step();
            return (self, Transition::to(next));
        }
        let required = self.required_step();
        if required < WizardStep::GiftMessage {
            return (self, Transition::to(required));
        }

        match form.gift_details() {
            Ok(details) => {
                self.gift = Some(details);
                self.session_id = None;
                (self, Transition::to(WizardStep::CreateSession))
            }
            Err(notice) => (self, Transition::with_notice(WizardStep::GiftMessage, notice)),
        }
    }

    /// Plan and address, if every prerequisite for a session is present
    pub fn ready_for_session(&self) -> std::result::Result<(Plan, Uuid), Transition> {
        match (self.required_step(), self.plan, self.address_id) {
            (WizardStep::CreateSession, Some(plan), Some(address_id)) => Ok((plan, address_id)),
            (step, _, _) => Err(Transition::to(step)),
        }
    }

    /// Record a session created at the gateway
    pub fn session_created(mut self, session: &CreatedSession) -> (Self, Transition) {
        self.session_id = Some(session.id.clone());
        (self, Transition::redirect(&session.url))
    }

    /// Remember where to resume after a detour
    #[must_use]
    pub const fn remember_return(mut self, step: WizardStep) -> Self {
        self.return_to = Some(step);
        self
    }

    /// Go back to the remembered step, never past a missing prerequisite
    pub fn resume(mut self) -> (Self, Transition) {
        let required = self.required_step();
        let target = self.return_to.take().map_or(required, |step| step.min(required));
        (self, Transition::to(target))
    }

    /// Payment finished; the state is consumed
    pub fn complete(self) -> Transition {
        Transition::to(WizardStep::Success)
    }

    /// Customer backed out of hosted checkout; the state is consumed
    pub fn cancel(self) -> Transition {
        Transition::with_notice(WizardStep::Cancelled, CANCELLED_NOTICE)
    }
}

/// Wizard steps that touch the store or the gateway
pub struct CheckoutWizard {
    store: Arc<dyn BillingStore>,
    resolver: ShippingAddressResolver,
    builder: CheckoutSessionBuilder,
}

impl CheckoutWizard {
    pub fn new(store: Arc<dyn BillingStore>, builder: CheckoutSessionBuilder) -> Self {
        Self {
            resolver: ShippingAddressResolver::new(store.clone()),
            store,
            builder,
        }
    }

    /// Addresses to offer at the address step
    pub fn address_choices(&self, state: &WizardState) -> Result<Vec<ShippingAddress>> {
        self.resolver.choices(state.user_id, state.is_gift)
    }

    /// Resolve and select an address by id
    pub fn choose_address(
        &self,
        state: WizardState,
        address_id: Uuid,
    ) -> (WizardState, Transition) {
        if state.plan.is_none() {
            return (state, Transition::to(WizardStep::ChoosePlan));
        }
        match self
            .resolver
            .resolve_for_checkout(state.user_id, address_id, state.is_gift)
        {
            Ok(address) => state.select_address(&address),
            Err(PaymentError::Validation(reason)) => {
                tracing::info!(
                    user_id = %state.user_id,
                    %address_id,
                    %reason,
                    "Rejected checkout address"
                );
                (state, Transition::with_notice(WizardStep::ChooseAddress, ADDRESS_NOTICE))
            }
            Err(e) => {
                tracing::error!(user_id = %state.user_id, error = %e, "Address lookup failed");
                let notice = e.user_message().to_string();
                (state, Transition::with_notice(WizardStep::ChooseAddress, notice))
            }
        }
    }

    /// Open a hosted checkout session for a finished wizard
    ///
    /// Any gateway failure sends the customer back to plan selection with a
    /// notice; no local record is written either way.
    pub async fn create_session(&self, mut state: WizardState) -> (WizardState, Transition) {
        let (plan, address_id) = match state.ready_for_session() {
            Ok(ready) => ready,
            Err(transition) => return (state, transition),
        };

        let user = match self.store.user(state.user_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(user_id = %state.user_id, "Checkout for unknown user");
                return (state, Transition::with_notice(WizardStep::ChoosePlan, ACCOUNT_NOTICE));
            }
            Err(e) => {
                tracing::error!(user_id = %state.user_id, error = %e, "User lookup failed");
                return (state, Transition::with_notice(WizardStep::ChoosePlan, GATEWAY_NOTICE));
            }
        };

        let address = match self.resolver.resolve_for_checkout(user.id, address_id, state.is_gift) {
            Ok(address) => address,
            Err(e) => {
                tracing::info!(
                    user_id = %user.id,
                    %address_id,
                    error = %e,
                    "Selected address no longer usable"
                );
                state.address_id = None;
                return (state, Transition::with_notice(WizardStep::ChooseAddress, ADDRESS_NOTICE));
            }
        };

        let input = SessionInput {
            user: &user,
            plan,
            address: &address,
            gift: state.gift.as_ref().filter(|_| state.is_gift),
        };
        let created = self.builder.create(&input).await;
        match created {
            Ok(session) => state.session_created(&session),
            Err(e) => {
                tracing::warn!(
                    user_id = %user.id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Checkout session creation failed"
                );
                (state, Transition::with_notice(WizardStep::ChoosePlan, GATEWAY_NOTICE))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::plan::PriceCatalog;
    use boxsub_core::{AddressKind, MemoryStore, User};

    struct Fixture {
        wizard: CheckoutWizard,
        gateway: Arc<MockGateway>,
        user: User,
        home: ShippingAddress,
        gift_address: ShippingAddress,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let user = User::new("ada", "ada@example.com");
        let home = ShippingAddress::new(user.id, AddressKind::Personal)
            .with_recipient("Ada", "Lovelace")
            .with_street("1 Analytical Way", "London", "N1 1AA", "GB");
        let gift_address = ShippingAddress::new(user.id, AddressKind::Gift)
            .with_recipient("Mary", "Somerville")
            .with_street("2 Orbit Lane", "Jedburgh", "TD8 6AA", "GB");
        store.insert_user(user.clone()).unwrap();
        store.insert_address(home.clone()).unwrap();
        store.insert_address(gift_address.clone()).unwrap();

        let gateway = Arc::new(MockGateway::new());
        let catalog = Arc::new(PriceCatalog::demo());
        let builder =
            CheckoutSessionBuilder::new(gateway.clone(), catalog, "http://localhost:3000");
        Fixture {
            wizard: CheckoutWizard::new(store, builder),
            gateway,
            user,
            home,
            gift_address,
        }
    }

    fn gift_form() -> GiftForm {
        GiftForm {
            recipient_name: "Ada".into(),
            recipient_email: "ada@example.com".into(),
            sender_name: "Charles".into(),
            gift_message: "Enjoy!".into(),
        }
    }

    #[test]
    fn test_unknown_plan_stays_on_plan_step() {
        let (state, _) = WizardState::start(Uuid::new_v4());
        let (state, transition) = state.select_plan("weekly", false);
        assert_eq!(transition.next, WizardStep::ChoosePlan);
        assert_eq!(transition.notice.as_deref(), Some(INVALID_PLAN_NOTICE));
        assert!(state.plan.is_none());
    }

    #[test]
    fn test_new_plan_clears_address() {
        let f = fixture();
        let (state, _) = WizardState::start(f.user.id);
        let (state, _) = state.select_plan("monthly", false);
        let (state, _) = state.select_address(&f.home);
        assert_eq!(state.address_id, Some(f.home.id));

        let (state, transition) = state.select_plan("6mo", false);
        assert_eq!(transition.next, WizardStep::ChooseAddress);
        assert!(state.address_id.is_none());
    }

    #[test]
    fn test_gift_address_goes_to_gift_message() {
        let f = fixture();
        let (state, _) = WizardState::start(f.user.id);
        let (state, _) = state.select_plan("3mo", true);
        let (state, transition) = state.select_address(&f.gift_address);
        assert_eq!(transition.next, WizardStep::GiftMessage);
        assert_ne!(transition.next, WizardStep::CreateSession);
        assert_eq!(state.required_step(), WizardStep::GiftMessage);
    }

    #[test]
    fn test_gift_message_without_address_redirects_back() {
        let (state, _) = WizardState::start(Uuid::new_v4());
        let (state, _) = state.select_plan("3mo", true);
        let (state, transition) = state.submit_gift_message(&gift_form());
        assert_eq!(transition.next, WizardStep::ChooseAddress);
        assert!(state.gift.is_none());
    }

    #[test]
    fn test_gift_message_without_plan_redirects_to_plan() {
        let (state, _) = WizardState::start(Uuid::new_v4());
        let (_, transition) = state.submit_gift_message(&gift_form());
        assert_eq!(transition.next, WizardStep::ChoosePlan);
    }

    #[test]
    fn test_gift_form_validation() {
        let mut form = gift_form();
        form.recipient_email = "not-an-email".into();
        assert_eq!(form.gift_details().unwrap_err(), GIFT_FORM_NOTICES[1].1);

        let mut form = gift_form();
        form.recipient_name = "   ".into();
        assert_eq!(form.gift_details().unwrap_err(), GIFT_FORM_NOTICES[0].1);

        let mut form = gift_form();
        form.recipient_name = "n".repeat(101);
        assert_eq!(form.gift_details().unwrap_err(), GIFT_FORM_NOTICES[0].1);

        let mut form = gift_form();
        form.sender_name = "s".repeat(101);
        assert_eq!(form.gift_details().unwrap_err(), GIFT_FORM_NOTICES[2].1);

        let mut form = gift_form();
        form.gift_message = "x".repeat(251);
        assert_eq!(form.gift_details().unwrap_err(), GIFT_FORM_NOTICES[3].1);

        let mut form = gift_form();
        form.gift_message = format!("  {}  ", "x".repeat(250));
        assert!(form.gift_details().is_ok());
    }

    #[test]
    fn test_gift_details_are_trimmed() {
        let form = GiftForm {
            recipient_name: "  Ada ".into(),
            recipient_email: " ada@example.com ".into(),
            sender_name: String::new(),
            gift_message: " Enjoy! ".into(),
        };
        let details = form.gift_details().unwrap();
        assert_eq!(details.recipient_name, "Ada");
        assert_eq!(details.recipient_email, "ada@example.com");
        assert_eq!(details.sender_name, "");
        assert_eq!(details.gift_message, "Enjoy!");
    }

    #[test]
    fn test_invalid_gift_form_stays_with_notice() {
        let f = fixture();
        let (state, _) = WizardState::start(f.user.id);
        let (state, _) = state.select_plan("oneoff", true);
        let (state, _) = state.select_address(&f.gift_address);
        let (state, transition) = state.submit_gift_message(&GiftForm::default());
        assert_eq!(transition.next, WizardStep::GiftMessage);
        assert!(transition.notice.is_some());
        assert!(state.gift.is_none());
    }

    #[test]
    fn test_personal_address_rejected_for_gift() {
        let f = fixture();
        let (state, _) = WizardState::start(f.user.id);
        let (state, _) = state.select_plan("monthly", true);
        let (state, transition) = f.wizard.choose_address(state, f.home.id);
        assert_eq!(transition.next, WizardStep::ChooseAddress);
        assert_eq!(transition.notice.as_deref(), Some(ADDRESS_NOTICE));
        assert!(state.address_id.is_none());
    }

    #[test]
    fn test_foreign_address_rejected() {
        let f = fixture();
        let (state, _) = WizardState::start(Uuid::new_v4());
        let (state, _) = state.select_plan("monthly", false);
        let (_, transition) = f.wizard.choose_address(state, f.home.id);
        assert_eq!(transition.next, WizardStep::ChooseAddress);
    }

    #[test]
    fn test_resume_never_skips_prerequisites() {
        let (state, _) = WizardState::start(Uuid::new_v4());
        let (state, _) = state.select_plan("monthly", false);
        let state = state.remember_return(WizardStep::CreateSession);
        let (state, transition) = state.resume();
        assert_eq!(transition.next, WizardStep::ChooseAddress);
        assert!(state.return_to.is_none());
    }

    #[tokio::test]
    async fn test_session_without_prerequisites_redirects() {
        let f = fixture();
        let (state, _) = WizardState::start(f.user.id);
        let (_, transition) = f.wizard.create_session(state).await;
        assert_eq!(transition.next, WizardStep::ChoosePlan);
        assert!(f.gateway.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_full_gift_flow_creates_session() {
        let f = fixture();
        let (state, _) = WizardState::start(f.user.id);
        let (state, _) = state.select_plan("3mo", true);
        let (state, _) = f.wizard.choose_address(state, f.gift_address.id);
        let (state, _) = state.submit_gift_message(&gift_form());
        let (state, transition) = f.wizard.create_session(state).await;

        assert_eq!(transition.next, WizardStep::AwaitingPayment);
        assert!(transition.redirect_url.is_some());
        assert!(state.session_id.is_some());

        let sessions = f.gateway.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].metadata["gift"], "true");
        assert_eq!(sessions[0].metadata["recipient_name"], "Ada");
    }

    #[tokio::test]
    async fn test_unknown_user_is_asked_to_sign_in() {
        let f = fixture();
        let (state, _) = WizardState::start(f.user.id);
        let (state, _) = state.select_plan("monthly", false);
        let (mut state, _) = state.select_address(&f.home);
        state.user_id = Uuid::new_v4();

        let (state, transition) = f.wizard.create_session(state).await;
        assert_eq!(transition.next, WizardStep::ChoosePlan);
        assert_eq!(transition.notice.as_deref(), Some(ACCOUNT_NOTICE));
        assert!(state.session_id.is_none());
        assert!(f.gateway.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_returns_to_plan() {
        let f = fixture();
        f.gateway.reject_sessions(true);
        let (state, _) = WizardState::start(f.user.id);
        let (state, _) = state.select_plan("monthly", false);
        let (state, _) = f.wizard.choose_address(state, f.home.id);
        let (state, transition) = f.wizard.create_session(state).await;

        assert_eq!(transition.next, WizardStep::ChoosePlan);
        assert_eq!(transition.notice.as_deref(), Some(GATEWAY_NOTICE));
        assert!(state.session_id.is_none());
    }

    #[test]
    fn test_terminal_steps() {
        let (state, _) = WizardState::start(Uuid::new_v4());
        assert_eq!(state.clone().complete().next, WizardStep::Success);
        let cancelled = state.cancel();
        assert_eq!(cancelled.next, WizardStep::Cancelled);
        assert_eq!(cancelled.next.path(), "/checkout/cancel");
    }
}
