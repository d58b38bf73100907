//! boxsub HTTP Server
//!
//! Axum server for the subscription-box checkout wizard and the payment
//! gateway's webhooks. Runs against Stripe when credentials are configured
//! and against the mock gateway otherwise.

mod config;
mod extract;
mod handlers;
mod routes;
mod seed;
mod state;

use std::sync::Arc;
use std::time::Duration;

use boxsub_core::{BillingStore, MemoryStore, RetryPolicy};
use boxsub_payments::{
    GatewayConfig, LogNotifier, MockGateway, PaymentGateway, PriceCatalog, StripeGateway,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::state::{AppState, Components, WizardSessions};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env();

    // Payment gateway
    let (gateway, catalog, webhook_secret): (Arc<dyn PaymentGateway>, PriceCatalog, String) =
        match GatewayConfig::from_env() {
            Ok(gateway_config) => {
                let catalog = PriceCatalog::from_env()?;
                let stripe: Arc<dyn PaymentGateway> =
                    Arc::new(StripeGateway::new(&gateway_config));
                tracing::info!("✓ Stripe configured");
                (stripe, catalog, gateway_config.webhook_secret)
            }
            Err(e) => {
                tracing::warn!("⚠ Stripe not configured ({e}) - using mock gateway");
                tracing::warn!("  Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
                let secret = std::env::var("WEBHOOK_DEV_SECRET")
                    .unwrap_or_else(|_| "whsec_dev".into());
                let mock: Arc<dyn PaymentGateway> = Arc::new(MockGateway::new());
                (mock, PriceCatalog::demo(), secret)
            }
        };

    // Storage
    let memory = Arc::new(MemoryStore::new());
    if config.seed_demo_data {
        let user = seed::seed_demo_data(&memory)?;
        tracing::info!("  Demo user: x-user-id: {}", user.id);
    }
    let store: Arc<dyn BillingStore> = memory;

    let state = AppState::new(Components {
        store,
        gateway,
        notifier: Arc::new(LogNotifier),
        catalog,
        webhook_secret,
        base_url: config.base_url.clone(),
        policy: RetryPolicy::from_env(),
        sessions: WizardSessions::new(config.session_ttl_secs, config.max_wizard_sessions),
    });

    // Expired checkouts are swept on save too; this covers quiet periods
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = sessions.sweep();
            if removed > 0 {
                tracing::debug!(
                    removed,
                    remaining = sessions.entry_count(),
                    "Swept expired checkout sessions"
                );
            }
        }
    });

    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("📦 boxsub server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health             - Health check");
    tracing::info!("  POST   /webhook            - Payment gateway webhook");
    tracing::info!("  POST   /checkout/start     - Begin checkout");
    tracing::info!("  POST   /checkout/plan      - Choose plan");
    tracing::info!("  POST   /checkout/address   - Choose shipping address");
    tracing::info!("  POST   /checkout/gift      - Gift message");
    tracing::info!("  POST   /checkout/session   - Open hosted checkout");
    tracing::info!("  POST   /checkout/resume    - Resume after a detour");
    tracing::info!("  GET    /checkout/success   - Return from checkout");
    tracing::info!("  GET    /checkout/cancel    - Cancelled checkout");
    tracing::info!("  GET    /orders             - Order history");
    tracing::info!("  DELETE /addresses/{{id}}     - Remove an address");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
