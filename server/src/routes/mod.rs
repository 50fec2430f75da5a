use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, with_security_headers, Config, TenantRegistry};
use crate::handlers::{
    cancel_payment, get_payment, health_check, materialize_event, open_order, payment_webhook, resync_payment,
    scan_ticket,
};
use crate::sales::Sales;

#[derive(Clone)]
pub struct AppState {
    pub sales: Sales,
    pub tenants: Arc<TenantRegistry>,
    /// Signing secret of the provider webhook; unset skips verification.
    pub webhook_secret: Option<String>,
}

pub fn create_routes(state: AppState, config: &Config) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/payment", post(payment_webhook))
        .route("/api/events/:id/materialize", post(materialize_event))
        .route("/api/orders", post(open_order))
        .route("/api/payments/:id", get(get_payment))
        .route("/api/payments/:id/resync", post(resync_payment))
        .route("/api/payments/:id/cancel", post(cancel_payment))
        .route("/api/tickets/:id/scan", post(scan_ticket))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer(config.cors_allowed_origins.as_deref()));

    with_security_headers(router, config.production).with_state(state)
}
