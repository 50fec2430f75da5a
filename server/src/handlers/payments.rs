use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::tenant::{Operator, Tenant};
use crate::config::ApiPermission;
use crate::models::{Payment, ProcessingSource};
use crate::routes::AppState;
use crate::services::payment_provider::verify_webhook_signature;
use crate::utils::error::AppError;
use crate::utils::response::success;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Provider events that move a checkout session forward.
const HANDLED_EVENTS: &[&str] = &[
    "checkout.session.completed",
    "checkout.session.async_payment_succeeded",
    "checkout.session.async_payment_failed",
    "checkout.session.expired",
];

#[derive(Debug, Serialize)]
pub struct PaymentPayload {
    uuid: Uuid,
    status: &'static str,
    label: &'static str,
    processing: bool,
    total: Decimal,
    invoice_number: String,
}

impl From<&Payment> for PaymentPayload {
    fn from(payment: &Payment) -> Self {
        Self {
            uuid: payment.uuid,
            status: payment.status.code(),
            label: payment.status.label(),
            processing: payment.processing,
            total: payment.total,
            invoice_number: payment.invoice_number(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    #[serde(rename = "type")]
    kind: String,
    data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
struct ProviderEventData {
    object: ProviderEventObject,
}

#[derive(Debug, Deserialize)]
struct ProviderEventObject {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Payment provider webhook. The tenant and payment attempt come from the
/// checkout session metadata set when the order was opened.
pub async fn payment_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match handle_webhook(&state, &headers, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_webhook(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Response, AppError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::AuthError("Missing signature header".to_string()))?;
        verify_webhook_signature(body, header, secret, Utc::now())?;
    }

    let event: ProviderEvent = serde_json::from_slice(body)
        .map_err(|e| AppError::ValidationError(format!("Malformed webhook payload: {e}")))?;
    if !HANDLED_EVENTS.contains(&event.kind.as_str()) {
        tracing::debug!(kind = %event.kind, "Webhook event ignored");
        return Ok(success(None::<PaymentPayload>, "Event ignored").into_response());
    }

    let metadata = event.data.object.metadata;
    let (Some(slug), Some(payment_id)) = (metadata.get("tenant"), metadata.get("payment")) else {
        tracing::warn!(kind = %event.kind, "Webhook without tenant or payment metadata");
        return Ok(success(None::<PaymentPayload>, "Event without order reference").into_response());
    };
    let payment_id = Uuid::parse_str(payment_id)
        .map_err(|_| AppError::ValidationError(format!("Invalid payment id '{payment_id}'")))?;
    let tenant = state.tenants.resolve(slug)?;

    let payment = state
        .sales
        .confirm(&tenant, payment_id, ProcessingSource::Webhook)
        .await?;
    Ok(success(Some(PaymentPayload::from(&payment)), "Webhook processed").into_response())
}

/// Polls the provider for the attempt and returns where it stands. Also the
/// return link of the hosted checkout page.
pub async fn get_payment(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(payment_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let payment = state.sales.confirm(&tenant, payment_id, ProcessingSource::Get).await?;
    Ok(success(PaymentPayload::from(&payment), payment.status.label()).into_response())
}

pub async fn resync_payment(
    State(state): State<AppState>,
    operator: Operator,
    Path(payment_id): Path<Uuid>,
) -> Result<Response, AppError> {
    operator.require(ApiPermission::Reservation)?;
    let payment = state.sales.resync(&operator.tenant, payment_id).await?;
    Ok(success(PaymentPayload::from(&payment), "Payment re-synchronised").into_response())
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    operator: Operator,
    Path(payment_id): Path<Uuid>,
) -> Result<Response, AppError> {
    operator.require(ApiPermission::Reservation)?;
    let payment = state.sales.cancel(&operator.tenant, payment_id).await?;
    Ok(success(PaymentPayload::from(&payment), "Payment canceled").into_response())
}
