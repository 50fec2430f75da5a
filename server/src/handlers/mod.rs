use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub mod events;
pub mod orders;
pub mod payments;
pub mod tenant;
pub mod tickets;

pub use events::materialize_event;
pub use orders::open_order;
pub use payments::{cancel_payment, get_payment, payment_webhook, resync_payment};
pub use tenant::{Operator, Tenant};
pub use tickets::scan_ticket;

use crate::utils::response::success;

#[derive(Serialize)]
struct HealthPayload {
    status: &'static str,
    service: &'static str,
}

pub async fn health_check() -> Response {
    let payload = HealthPayload {
        status: "ok",
        service: "tibillet-api",
    };

    success(payload, "Health check successful").into_response()
}
