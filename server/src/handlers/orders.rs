use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tenant::Tenant;
use crate::models::PaymentSource;
use crate::routes::AppState;
use crate::sales::{OpenedOrder, OrderLine, OrderRequest};
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Deserialize)]
pub struct HolderBody {
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderLineBody {
    pub price_sold_id: Uuid,
    pub qty: i32,
    #[serde(default)]
    pub holders: Vec<HolderBody>,
}

#[derive(Debug, Deserialize)]
pub struct OrderBody {
    pub user_id: Uuid,
    pub event_id: Option<Uuid>,
    pub lines: Vec<OrderLineBody>,
}

#[derive(Debug, Serialize)]
pub struct OrderPayload {
    payment: Uuid,
    reservation: Option<Uuid>,
    status: &'static str,
    checkout_url: Option<String>,
    tickets: Vec<Uuid>,
}

impl From<OpenedOrder> for OrderPayload {
    fn from(order: OpenedOrder) -> Self {
        Self {
            payment: order.payment.uuid,
            reservation: order.reservation.map(|r| r.uuid),
            status: order.payment.status.code(),
            checkout_url: order.checkout_url,
            tickets: order.tickets.iter().map(|t| t.uuid).collect(),
        }
    }
}

pub async fn open_order(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(body): Json<OrderBody>,
) -> Result<Response, AppError> {
    let request = OrderRequest {
        user_id: body.user_id,
        event_id: body.event_id,
        lines: body
            .lines
            .into_iter()
            .map(|line| OrderLine {
                price_sold_id: line.price_sold_id,
                qty: line.qty,
                holders: line
                    .holders
                    .into_iter()
                    .map(|h| (h.first_name, h.last_name))
                    .collect(),
            })
            .collect(),
        source: PaymentSource::Ticketing,
    };
    let order = state.sales.open_order(&tenant, request).await?;
    Ok(success(OrderPayload::from(order), "Order opened").into_response())
}
