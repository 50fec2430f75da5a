//! Tenant-scoped persistence.
//!
//! Every call takes the [`TenantContext`] explicitly. Two rows carry
//! concurrency guarantees:
//!
//! - payment attempts are written with [`Store::compare_and_swap_payment`],
//!   a conditional update on `revision`;
//! - tickets are scanned with [`Store::scan_ticket`], a conditional update on
//!   the not-yet-scanned status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::TenantContext;
use crate::models::ticket::ScanRejection;
use crate::models::{
    Event, LineItem, Membership, Payment, Price, PriceSold, Product, ProductSold, Reservation,
    Ticket, User, Webhook, WebhookEvent,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // catalog
    async fn insert_product(&self, tenant: &TenantContext, product: &Product) -> StoreResult<()>;
    async fn get_product(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Product>;
    async fn insert_price(&self, tenant: &TenantContext, price: &Price) -> StoreResult<()>;
    async fn get_price(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Price>;
    async fn prices_for_product(&self, tenant: &TenantContext, product_id: Uuid) -> StoreResult<Vec<Price>>;
    async fn insert_event(&self, tenant: &TenantContext, event: &Event) -> StoreResult<()>;
    async fn get_event(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Event>;

    /// Returns the existing snapshot for (event, product) or stores
    /// `candidate`. The flag tells whether the candidate was inserted.
    async fn get_or_insert_product_sold(
        &self,
        tenant: &TenantContext,
        candidate: ProductSold,
    ) -> StoreResult<(ProductSold, bool)>;
    async fn get_product_sold(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<ProductSold>;
    async fn update_product_sold(&self, tenant: &TenantContext, sold: &ProductSold) -> StoreResult<()>;

    /// Same as [`Store::get_or_insert_product_sold`], keyed by
    /// (product snapshot, price).
    async fn get_or_insert_price_sold(
        &self,
        tenant: &TenantContext,
        candidate: PriceSold,
    ) -> StoreResult<(PriceSold, bool)>;
    async fn get_price_sold(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<PriceSold>;
    async fn update_price_sold(&self, tenant: &TenantContext, sold: &PriceSold) -> StoreResult<()>;

    // users
    async fn insert_user(&self, tenant: &TenantContext, user: &User) -> StoreResult<()>;
    async fn get_user(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<User>;

    // orders
    async fn insert_reservation(&self, tenant: &TenantContext, reservation: &Reservation) -> StoreResult<()>;
    async fn get_reservation(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Reservation>;
    async fn update_reservation(&self, tenant: &TenantContext, reservation: &Reservation) -> StoreResult<()>;

    async fn insert_payment(&self, tenant: &TenantContext, payment: &Payment) -> StoreResult<()>;
    async fn get_payment(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Payment>;
    /// Writes `payment` only if the stored revision still equals
    /// `payment.revision`, then bumps the stored revision. Returns false
    /// when another writer got there first.
    async fn compare_and_swap_payment(&self, tenant: &TenantContext, payment: &Payment) -> StoreResult<bool>;
    /// PAID attempts whose last action is older than `before`.
    async fn stale_paid_payments(
        &self,
        tenant: &TenantContext,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<Payment>>;

    async fn insert_line_item(&self, tenant: &TenantContext, item: &LineItem) -> StoreResult<()>;
    async fn get_line_item(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<LineItem>;
    async fn line_items_for_payment(&self, tenant: &TenantContext, payment_id: Uuid) -> StoreResult<Vec<LineItem>>;
    async fn update_line_item(&self, tenant: &TenantContext, item: &LineItem) -> StoreResult<()>;

    async fn insert_ticket(&self, tenant: &TenantContext, ticket: &Ticket) -> StoreResult<()>;
    async fn get_ticket(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Ticket>;
    async fn tickets_for_reservation(&self, tenant: &TenantContext, reservation_id: Uuid) -> StoreResult<Vec<Ticket>>;
    async fn update_ticket(&self, tenant: &TenantContext, ticket: &Ticket) -> StoreResult<()>;
    /// Atomically moves a NOT_SCANNED ticket to SCANNED.
    async fn scan_ticket(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Result<Ticket, ScanRejection>>;
    async fn count_issued_tickets(&self, tenant: &TenantContext, event_id: Uuid) -> StoreResult<i64>;

    async fn find_membership(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        price_id: Uuid,
    ) -> StoreResult<Option<Membership>>;
    async fn get_membership(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Membership>;
    async fn insert_membership(&self, tenant: &TenantContext, membership: &Membership) -> StoreResult<()>;
    async fn update_membership(&self, tenant: &TenantContext, membership: &Membership) -> StoreResult<()>;

    async fn active_webhooks(&self, tenant: &TenantContext, event: WebhookEvent) -> StoreResult<Vec<Webhook>>;
    async fn record_webhook_response(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        response: &str,
    ) -> StoreResult<()>;
}
