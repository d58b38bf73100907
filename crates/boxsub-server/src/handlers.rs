//! HTTP Handlers

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use boxsub_core::{Order, Payment, ShippingAddress, StoreError};
use boxsub_payments::{
    CANCELLED_NOTICE, DispatchOutcome, GiftForm, PaymentError, Plan, Transition, WizardState,
    WizardStep,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::extract::{Caller, CheckoutCaller};
use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub gateway: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub plan: String,
    #[serde(default)]
    pub gift: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub address_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SuccessQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Where the wizard is and what to show there
#[derive(Debug, Serialize, Deserialize)]
pub struct WizardResponse {
    pub step: WizardStep,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    /// Hosted checkout page to send the customer to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub plan: Option<Plan>,
    pub is_gift: bool,
    /// Choices for the address step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<ShippingAddress>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub payments: Vec<Payment>,
}

fn error(status: StatusCode, message: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.into(),
        }),
    )
}

fn store_error(e: &StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => error(StatusCode::NOT_FOUND, "Not found", "NOT_FOUND"),
        StoreError::Referenced(_) => error(
            StatusCode::CONFLICT,
            "This address is used by an active order or subscription.",
            "ADDRESS_IN_USE",
        ),
        _ => {
            tracing::error!(error = %e, "Store error");
            error(StatusCode::SERVICE_UNAVAILABLE, "Please try again shortly.", "STORE_UNAVAILABLE")
        }
    }
}

// ============================================================================
// Health & Webhook
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        gateway: state.gateway_name.clone(),
    })
}

/// Gateway webhook endpoint
///
/// 400 tells the gateway the delivery is bad; 500 asks it to redeliver.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<WebhookResponse> {
    let signature = headers.get("stripe-signature").and_then(|v| v.to_str().ok());

    match state.dispatcher.dispatch(&body, signature).await {
        Ok(outcome) => Ok(Json(WebhookResponse { received: true, outcome })),
        Err(PaymentError::Authentication(_)) => {
            Err(error(StatusCode::BAD_REQUEST, "Invalid signature", "INVALID_SIGNATURE"))
        }
        Err(PaymentError::Json(_)) => {
            Err(error(StatusCode::BAD_REQUEST, "Invalid payload", "INVALID_PAYLOAD"))
        }
        Err(e) => Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.user_message(), "RETRY_LATER")),
    }
}

// ============================================================================
// Checkout Wizard
// ============================================================================

/// Save the new state and describe the next step
fn advance(
    state: &AppState,
    caller: &CheckoutCaller,
    mut wizard: WizardState,
    transition: Transition,
) -> Json<WizardResponse> {
    let addresses = if transition.next == WizardStep::ChooseAddress {
        state.wizard.address_choices(&wizard).unwrap_or_else(|e| {
            tracing::error!(
                user_id = %caller.user_id,
                error = %e,
                "Could not load address choices"
            );
            Vec::new()
        })
    } else {
        Vec::new()
    };
    // No usable address yet; come back here once one is added
    if transition.next == WizardStep::ChooseAddress && addresses.is_empty() {
        wizard = wizard.remember_return(WizardStep::ChooseAddress);
    }

    let response = view(&transition, Some(&wizard), addresses);
    state.sessions.save(&caller.session_id, wizard);
    Json(response)
}

fn view(
    transition: &Transition,
    wizard: Option<&WizardState>,
    addresses: Vec<ShippingAddress>,
) -> WizardResponse {
    WizardResponse {
        step: transition.next,
        path: transition.next.path().to_string(),
        notice: transition.notice.clone(),
        redirect_url: transition.redirect_url.clone(),
        plan: wizard.and_then(|w| w.plan),
        is_gift: wizard.is_some_and(|w| w.is_gift),
        addresses,
    }
}

/// Begin a new checkout, discarding any earlier one in this session
pub async fn start_checkout(
    State(state): State<AppState>,
    caller: CheckoutCaller,
) -> ApiResult<WizardResponse> {
    match state.store.user(caller.user_id) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(error(StatusCode::NOT_FOUND, "Unknown user", "UNKNOWN_USER")),
        Err(e) => return Err(store_error(&e)),
    }

    let (wizard, transition) = WizardState::start(caller.user_id);
    Ok(advance(&state, &caller, wizard, transition))
}

pub async fn select_plan(
    State(state): State<AppState>,
    caller: CheckoutCaller,
    Json(request): Json<PlanRequest>,
) -> Json<WizardResponse> {
    let current = state.sessions.load(&caller.session_id, caller.user_id);
    let (wizard, transition) = current.select_plan(&request.plan, request.gift);
    advance(&state, &caller, wizard, transition)
}

pub async fn choose_address(
    State(state): State<AppState>,
    caller: CheckoutCaller,
    Json(request): Json<AddressRequest>,
) -> Json<WizardResponse> {
    let current = state.sessions.load(&caller.session_id, caller.user_id);
    let (wizard, transition) = state.wizard.choose_address(current, request.address_id);
    advance(&state, &caller, wizard, transition)
}

pub async fn submit_gift(
    State(state): State<AppState>,
    caller: CheckoutCaller,
    Json(form): Json<GiftForm>,
) -> Json<WizardResponse> {
    let current = state.sessions.load(&caller.session_id, caller.user_id);
    let (wizard, transition) = current.submit_gift_message(&form);
    advance(&state, &caller, wizard, transition)
}

/// Open the hosted checkout page
pub async fn create_session(
    State(state): State<AppState>,
    caller: CheckoutCaller,
) -> Json<WizardResponse> {
    let current = state.sessions.load(&caller.session_id, caller.user_id);
    let (wizard, transition) = state.wizard.create_session(current).await;
    advance(&state, &caller, wizard, transition)
}

/// Return to the step remembered before a detour
pub async fn resume_checkout(
    State(state): State<AppState>,
    caller: CheckoutCaller,
) -> Json<WizardResponse> {
    let current = state.sessions.load(&caller.session_id, caller.user_id);
    let (wizard, transition) = current.resume();
    advance(&state, &caller, wizard, transition)
}

/// Gateway redirect after payment
///
/// Orders are created by the webhook, not here.
pub async fn checkout_success(
    State(state): State<AppState>,
    caller: CheckoutCaller,
    Query(query): Query<SuccessQuery>,
) -> Json<WizardResponse> {
    let finished = state.sessions.take(&caller.session_id, caller.user_id);
    if let (Some(wizard), Some(returned)) = (finished.as_ref(), query.session_id.as_deref()) {
        if wizard.session_id.as_deref() != Some(returned) {
            tracing::warn!(
                user_id = %caller.user_id,
                returned,
                "Checkout returned with an unexpected session id"
            );
        }
    }
    tracing::info!(user_id = %caller.user_id, "Checkout completed");

    let transition =
        finished.map_or_else(|| Transition::to(WizardStep::Success), WizardState::complete);
    Json(view(&transition, None, Vec::new()))
}

/// Gateway redirect after the customer backs out
pub async fn checkout_cancel(
    State(state): State<AppState>,
    caller: CheckoutCaller,
) -> Json<WizardResponse> {
    let transition = state
        .sessions
        .take(&caller.session_id, caller.user_id)
        .map_or_else(
            || Transition::with_notice(WizardStep::Cancelled, CANCELLED_NOTICE),
            WizardState::cancel,
        );
    tracing::info!(user_id = %caller.user_id, "Checkout cancelled");
    Json(view(&transition, None, Vec::new()))
}

// ============================================================================
// Account
// ============================================================================

/// Caller's orders, newest first, with their payments
pub async fn list_orders(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> ApiResult<Vec<OrderView>> {
    let orders = state.store.orders_for_user(user_id).map_err(|e| store_error(&e))?;
    let views = orders
        .into_iter()
        .map(|order| {
            let payments = state.store.payments_for_order(order.id)?;
            Ok(OrderView { order, payments })
        })
        .collect::<boxsub_core::Result<Vec<_>>>()
        .map_err(|e| store_error(&e))?;
    Ok(Json(views))
}

/// Remove a saved address that nothing active depends on
pub async fn delete_address(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(address_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .delete_address(user_id, address_id)
        .map_err(|e| store_error(&e))?;
    tracing::info!(%user_id, %address_id, "Address deleted");
    Ok(StatusCode::NO_CONTENT)
}
