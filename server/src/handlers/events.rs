use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use super::tenant::Operator;
use crate::config::ApiPermission;
use crate::routes::AppState;
use crate::utils::error::AppError;
use crate::utils::response::success;

/// Snapshots the event's catalog and publishes it to the payment provider.
/// Safe to call again after the catalog changed.
pub async fn materialize_event(
    State(state): State<AppState>,
    operator: Operator,
    Path(event_id): Path<Uuid>,
) -> Result<Response, AppError> {
    operator.require(ApiPermission::Event)?;
    let prices = state.sales.materialize_event(&operator.tenant, event_id).await?;
    let message = format!("{} prices on sale", prices.len());
    Ok(success(prices, message).into_response())
}
