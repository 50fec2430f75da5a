//! Sale lifecycle: catalog snapshots, checkout, confirmation and the
//! per-category completion handlers.
//!
//! [`Sales`] is built once at start-up with its collaborators and is shared
//! by the HTTP handlers and the reconciliation loop. Tenant settings are not
//! held here; every entry point takes the [`TenantContext`] it acts for.
//!
//! [`TenantContext`]: crate::config::TenantContext

use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::catalog::SnapshotFrozen;
use crate::models::order::InvalidTransition;
use crate::services::{LedgerBridge, LedgerError, PaymentProvider, ProviderError, TaskQueue};
use crate::store::{Store, StoreError};

pub mod catalog;
pub mod checkout;
pub mod pipeline;
pub mod scan;
pub mod triggers;

#[cfg(test)]
mod tests;

pub use checkout::{OpenedOrder, OrderLine, OrderRequest, StatusUpdate};
pub use scan::ScanError;
pub use triggers::{Handler, TriggerOutcome};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payment provider: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Frozen(#[from] SnapshotFrozen),
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payment provider: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("cart is empty")]
    EmptyCart,

    #[error("at most {max} of price {price} per user")]
    OverLimit { price: Uuid, max: i32 },

    #[error("a recurring subscription must be bought on its own")]
    RecurringMixed,

    #[error("at most {max} tickets per reservation for event {event}")]
    TooManyTickets { event: Uuid, max: i32 },

    #[error("event {0} is full")]
    EventFull(Uuid),

    #[error("payment {0} was modified concurrently")]
    Conflict(Uuid),
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payment provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("line item {0} is not attached to a payment")]
    Detached(Uuid),

    #[error("payment {0} has no buyer")]
    NoBuyer(Uuid),

    #[error("provider did not report a charged amount for payment {0}")]
    MissingAmount(Uuid),
}

impl TriggerError {
    /// Remote trouble that a later re-sync may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            TriggerError::Ledger(e) => e.is_transient(),
            TriggerError::Provider(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Entry point of the sale lifecycle.
#[derive(Clone)]
pub struct Sales {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    bridge: LedgerBridge,
    tasks: TaskQueue,
    public_url: String,
}

impl Sales {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        bridge: LedgerBridge,
        tasks: TaskQueue,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            bridge,
            tasks,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
