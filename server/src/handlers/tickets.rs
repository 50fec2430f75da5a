use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use super::tenant::Operator;
use crate::config::ApiPermission;
use crate::routes::AppState;
use crate::utils::error::AppError;
use crate::utils::response::success;

/// Door check. Answers 409 `TICKET_ALREADY_SCANNED` on every scan after the
/// first one.
pub async fn scan_ticket(
    State(state): State<AppState>,
    operator: Operator,
    Path(ticket_id): Path<Uuid>,
) -> Result<Response, AppError> {
    operator.require(ApiPermission::Ticket)?;
    let ticket = state.sales.scan_ticket(&operator.tenant, ticket_id).await?;
    Ok(success(ticket, "Ticket scanned").into_response())
}
