//! Router

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    checkout_cancel, checkout_success, choose_address, create_session, delete_address,
    health_check, list_orders, payment_webhook, resume_checkout, select_plan, start_checkout,
    submit_gift,
};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_check))
        // Gateway
        .route("/webhook", post(payment_webhook))
        // Checkout wizard
        .route("/checkout/start", post(start_checkout))
        .route("/checkout/plan", post(select_plan))
        .route("/checkout/address", post(choose_address))
        .route("/checkout/gift", post(submit_gift))
        .route("/checkout/session", post(create_session))
        .route("/checkout/resume", post(resume_checkout))
        .route("/checkout/success", get(checkout_success))
        .route("/checkout/cancel", get(checkout_cancel))
        // Account
        .route("/orders", get(list_orders))
        .route("/addresses/{id}", delete(delete_address))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
