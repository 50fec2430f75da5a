use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use super::Sales;
use crate::config::TenantContext;
use crate::models::ticket::ScanRejection;
use crate::models::Ticket;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rejected(#[from] ScanRejection),
}

impl Sales {
    /// Validates a ticket at the door. Succeeds at most once per ticket.
    pub async fn scan_ticket(&self, tenant: &TenantContext, ticket_id: Uuid) -> Result<Ticket, ScanError> {
        match self.store.scan_ticket(tenant, ticket_id, Utc::now()).await? {
            Ok(ticket) => {
                tracing::info!(tenant = %tenant.slug(), ticket = %ticket.short_id(), "Ticket scanned");
                Ok(ticket)
            }
            Err(rejection) => {
                tracing::warn!(tenant = %tenant.slug(), ticket = %ticket_id, reason = %rejection, "Scan rejected");
                Err(rejection.into())
            }
        }
    }
}
