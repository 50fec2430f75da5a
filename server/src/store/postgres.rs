//! Postgres store. One schema per tenant, tables qualified at query time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::config::TenantContext;
use crate::models::ticket::ScanRejection;
use crate::models::{
    Event, LineItem, Membership, Payment, PaymentStatus, Price, PriceSold, Product, ProductSold,
    Reservation, Ticket, TicketStatus, User, Webhook, WebhookEvent,
};

const TENANT_DDL: &str = include_str!("../../migrations/tenant.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the tenant schema and its tables if missing.
    pub async fn ensure_schema(&self, tenant: &TenantContext) -> StoreResult<()> {
        let ddl = TENANT_DDL.replace("{schema}", tenant.schema());
        self.pool.execute(ddl.as_str()).await?;
        tracing::info!(tenant = %tenant.slug(), schema = %tenant.schema(), "Tenant schema ready");
        Ok(())
    }
}

fn map_err(e: sqlx::Error) -> StoreError {
    if let Some(db) = e.as_database_error() {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Database(e)
}

fn found<T>(row: Option<T>, entity: &'static str, id: Uuid) -> StoreResult<T> {
    row.ok_or_else(|| StoreError::not_found(entity, id))
}

fn affected(rows: u64, entity: &'static str, id: Uuid) -> StoreResult<()> {
    if rows == 0 {
        Err(StoreError::not_found(entity, id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_product(&self, tenant: &TenantContext, product: &Product) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, name, category, nominative, send_to_cashless, archive, img_url, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            tenant.table("products")
        ))
        .bind(product.uuid)
        .bind(&product.name)
        .bind(product.category.code())
        .bind(product.nominative)
        .bind(product.send_to_cashless)
        .bind(product.archive)
        .bind(&product.img_url)
        .bind(product.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_product(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Product> {
        let row = sqlx::query_as::<_, Product>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("products")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "product", id)
    }

    async fn insert_price(&self, tenant: &TenantContext, price: &Price) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, product_id, name, amount, vat, subscription_type,
                             recurring_payment, free_price, max_per_user, stock)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            tenant.table("prices")
        ))
        .bind(price.uuid)
        .bind(price.product_id)
        .bind(&price.name)
        .bind(price.amount)
        .bind(price.vat.code())
        .bind(price.subscription_type.code())
        .bind(price.recurring_payment)
        .bind(price.free_price)
        .bind(price.max_per_user)
        .bind(price.stock)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_price(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Price> {
        let row = sqlx::query_as::<_, Price>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("prices")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "price", id)
    }

    async fn prices_for_product(&self, tenant: &TenantContext, product_id: Uuid) -> StoreResult<Vec<Price>> {
        let rows = sqlx::query_as::<_, Price>(&format!(
            "SELECT * FROM {} WHERE product_id = $1 ORDER BY amount",
            tenant.table("prices")
        ))
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_event(&self, tenant: &TenantContext, event: &Event) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, name, slug, start_time, max_capacity, max_per_user,
                             published, product_ids, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            tenant.table("events")
        ))
        .bind(event.uuid)
        .bind(&event.name)
        .bind(&event.slug)
        .bind(event.start_time)
        .bind(event.max_capacity)
        .bind(event.max_per_user)
        .bind(event.published)
        .bind(&event.product_ids)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_event(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Event> {
        let row = sqlx::query_as::<_, Event>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("events")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "event", id)
    }

    async fn get_or_insert_product_sold(
        &self,
        tenant: &TenantContext,
        candidate: ProductSold,
    ) -> StoreResult<(ProductSold, bool)> {
        let table = tenant.table("products_sold");
        let inserted = sqlx::query_as::<_, ProductSold>(&format!(
            "INSERT INTO {table} (uuid, event_id, product_id, category, external_product_id)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (event_id, product_id) DO NOTHING
             RETURNING *"
        ))
        .bind(candidate.uuid)
        .bind(candidate.event_id)
        .bind(candidate.product_id)
        .bind(candidate.category.code())
        .bind(&candidate.external_product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }
        let existing = sqlx::query_as::<_, ProductSold>(&format!(
            "SELECT * FROM {table} WHERE event_id IS NOT DISTINCT FROM $1 AND product_id = $2"
        ))
        .bind(candidate.event_id)
        .bind(candidate.product_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((existing, false))
    }

    async fn get_product_sold(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<ProductSold> {
        let row = sqlx::query_as::<_, ProductSold>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("products_sold")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "product sold", id)
    }

    async fn update_product_sold(&self, tenant: &TenantContext, sold: &ProductSold) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET category = $2, external_product_id = $3 WHERE uuid = $1",
            tenant.table("products_sold")
        ))
        .bind(sold.uuid)
        .bind(sold.category.code())
        .bind(&sold.external_product_id)
        .execute(&self.pool)
        .await?;
        affected(result.rows_affected(), "product sold", sold.uuid)
    }

    async fn get_or_insert_price_sold(
        &self,
        tenant: &TenantContext,
        candidate: PriceSold,
    ) -> StoreResult<(PriceSold, bool)> {
        let table = tenant.table("prices_sold");
        let inserted = sqlx::query_as::<_, PriceSold>(&format!(
            "INSERT INTO {table} (uuid, product_sold_id, price_id, external_price_id, qty_sold, amount, gift)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (product_sold_id, price_id) DO NOTHING
             RETURNING *"
        ))
        .bind(candidate.uuid)
        .bind(candidate.product_sold_id)
        .bind(candidate.price_id)
        .bind(&candidate.external_price_id)
        .bind(candidate.qty_sold)
        .bind(candidate.amount)
        .bind(candidate.gift)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }
        let existing = sqlx::query_as::<_, PriceSold>(&format!(
            "SELECT * FROM {table} WHERE product_sold_id = $1 AND price_id = $2"
        ))
        .bind(candidate.product_sold_id)
        .bind(candidate.price_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((existing, false))
    }

    async fn get_price_sold(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<PriceSold> {
        let row = sqlx::query_as::<_, PriceSold>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("prices_sold")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "price sold", id)
    }

    async fn update_price_sold(&self, tenant: &TenantContext, sold: &PriceSold) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET external_price_id = $2, qty_sold = $3, amount = $4, gift = $5 WHERE uuid = $1",
            tenant.table("prices_sold")
        ))
        .bind(sold.uuid)
        .bind(&sold.external_price_id)
        .bind(sold.qty_sold)
        .bind(sold.amount)
        .bind(sold.gift)
        .execute(&self.pool)
        .await?;
        affected(result.rows_affected(), "price sold", sold.uuid)
    }

    async fn insert_user(&self, tenant: &TenantContext, user: &User) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, email, first_name, last_name, created_at) VALUES ($1, $2, $3, $4, $5)",
            tenant.table("users")
        ))
        .bind(user.uuid)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_user(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<User> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("users")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "user", id)
    }

    async fn insert_reservation(&self, tenant: &TenantContext, reservation: &Reservation) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, user_id, event_id, status, to_mail, mail_send, mail_error, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            tenant.table("reservations")
        ))
        .bind(reservation.uuid)
        .bind(reservation.user_id)
        .bind(reservation.event_id)
        .bind(reservation.status.code())
        .bind(reservation.to_mail)
        .bind(reservation.mail_send)
        .bind(reservation.mail_error)
        .bind(reservation.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_reservation(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Reservation> {
        let row = sqlx::query_as::<_, Reservation>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("reservations")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "reservation", id)
    }

    async fn update_reservation(&self, tenant: &TenantContext, reservation: &Reservation) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = $2, to_mail = $3, mail_send = $4, mail_error = $5 WHERE uuid = $1",
            tenant.table("reservations")
        ))
        .bind(reservation.uuid)
        .bind(reservation.status.code())
        .bind(reservation.to_mail)
        .bind(reservation.mail_send)
        .bind(reservation.mail_error)
        .execute(&self.pool)
        .await?;
        affected(result.rows_affected(), "reservation", reservation.uuid)
    }

    async fn insert_payment(&self, tenant: &TenantContext, payment: &Payment) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, reservation_id, user_id, status, checkout_session_id,
                             payment_intent_id, customer_id, invoice_id, subscription_id,
                             processing, processing_source, source, total, order_date,
                             last_action, revision)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            tenant.table("payments")
        ))
        .bind(payment.uuid)
        .bind(payment.reservation_id)
        .bind(payment.user_id)
        .bind(payment.status.code())
        .bind(&payment.checkout_session_id)
        .bind(&payment.payment_intent_id)
        .bind(&payment.customer_id)
        .bind(&payment.invoice_id)
        .bind(&payment.subscription_id)
        .bind(payment.processing)
        .bind(payment.processing_source.code())
        .bind(payment.source.code())
        .bind(payment.total)
        .bind(payment.order_date)
        .bind(payment.last_action)
        .bind(payment.revision)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_payment(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Payment> {
        let row = sqlx::query_as::<_, Payment>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("payments")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "payment", id)
    }

    async fn compare_and_swap_payment(&self, tenant: &TenantContext, payment: &Payment) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = $3, checkout_session_id = $4, payment_intent_id = $5,
                           customer_id = $6, invoice_id = $7, subscription_id = $8,
                           processing = $9, processing_source = $10, total = $11,
                           last_action = $12, revision = revision + 1
             WHERE uuid = $1 AND revision = $2",
            tenant.table("payments")
        ))
        .bind(payment.uuid)
        .bind(payment.revision)
        .bind(payment.status.code())
        .bind(&payment.checkout_session_id)
        .bind(&payment.payment_intent_id)
        .bind(&payment.customer_id)
        .bind(&payment.invoice_id)
        .bind(&payment.subscription_id)
        .bind(payment.processing)
        .bind(payment.processing_source.code())
        .bind(payment.total)
        .bind(payment.last_action)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn stale_paid_payments(
        &self,
        tenant: &TenantContext,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, Payment>(&format!(
            "SELECT * FROM {} WHERE status = $1 AND last_action < $2 ORDER BY last_action",
            tenant.table("payments")
        ))
        .bind(PaymentStatus::Paid.code())
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_line_item(&self, tenant: &TenantContext, item: &LineItem) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, price_sold_id, payment_id, qty, vat, amount, status, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            tenant.table("line_items")
        ))
        .bind(item.uuid)
        .bind(item.price_sold_id)
        .bind(item.payment_id)
        .bind(item.qty)
        .bind(item.vat)
        .bind(item.amount)
        .bind(item.status.code())
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_line_item(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<LineItem> {
        let row = sqlx::query_as::<_, LineItem>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("line_items")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "line item", id)
    }

    async fn line_items_for_payment(&self, tenant: &TenantContext, payment_id: Uuid) -> StoreResult<Vec<LineItem>> {
        let rows = sqlx::query_as::<_, LineItem>(&format!(
            "SELECT * FROM {} WHERE payment_id = $1 ORDER BY updated_at",
            tenant.table("line_items")
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_line_item(&self, tenant: &TenantContext, item: &LineItem) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET payment_id = $2, qty = $3, amount = $4, status = $5, updated_at = $6
             WHERE uuid = $1",
            tenant.table("line_items")
        ))
        .bind(item.uuid)
        .bind(item.payment_id)
        .bind(item.qty)
        .bind(item.amount)
        .bind(item.status.code())
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        affected(result.rows_affected(), "line item", item.uuid)
    }

    async fn insert_ticket(&self, tenant: &TenantContext, ticket: &Ticket) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, reservation_id, price_sold_id, first_name, last_name, status, seat, scanned_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            tenant.table("tickets")
        ))
        .bind(ticket.uuid)
        .bind(ticket.reservation_id)
        .bind(ticket.price_sold_id)
        .bind(&ticket.first_name)
        .bind(&ticket.last_name)
        .bind(ticket.status.code())
        .bind(&ticket.seat)
        .bind(ticket.scanned_at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_ticket(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Ticket> {
        let row = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("tickets")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "ticket", id)
    }

    async fn tickets_for_reservation(&self, tenant: &TenantContext, reservation_id: Uuid) -> StoreResult<Vec<Ticket>> {
        let rows = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT * FROM {} WHERE reservation_id = $1",
            tenant.table("tickets")
        ))
        .bind(reservation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_ticket(&self, tenant: &TenantContext, ticket: &Ticket) -> StoreResult<()> {
        // Scans go through scan_ticket; a plain update never overwrites one.
        let result = sqlx::query(&format!(
            "UPDATE {} SET first_name = $2, last_name = $3, status = $4, seat = $5
             WHERE uuid = $1 AND status <> $6",
            tenant.table("tickets")
        ))
        .bind(ticket.uuid)
        .bind(&ticket.first_name)
        .bind(&ticket.last_name)
        .bind(ticket.status.code())
        .bind(&ticket.seat)
        .bind(TicketStatus::Scanned.code())
        .execute(&self.pool)
        .await?;
        affected(result.rows_affected(), "ticket", ticket.uuid)
    }

    async fn scan_ticket(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Result<Ticket, ScanRejection>> {
        let table = tenant.table("tickets");
        let scanned = sqlx::query_as::<_, Ticket>(&format!(
            "UPDATE {table} SET status = $2, scanned_at = $3
             WHERE uuid = $1 AND status = $4
             RETURNING *"
        ))
        .bind(id)
        .bind(TicketStatus::Scanned.code())
        .bind(at)
        .bind(TicketStatus::NotScanned.code())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ticket) = scanned {
            return Ok(Ok(ticket));
        }

        let current = sqlx::query_as::<_, Ticket>(&format!("SELECT * FROM {table} WHERE uuid = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(Err(match current {
            None => ScanRejection::NotFound(id),
            Some(ticket) if ticket.status == TicketStatus::Scanned => ScanRejection::AlreadyScanned(id),
            Some(ticket) => ScanRejection::NotActive {
                ticket: id,
                status: ticket.status,
            },
        }))
    }

    async fn count_issued_tickets(&self, tenant: &TenantContext, event_id: Uuid) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} t JOIN {} r ON r.uuid = t.reservation_id
             WHERE r.event_id = $1 AND t.status IN ($2, $3)",
            tenant.table("tickets"),
            tenant.table("reservations")
        ))
        .bind(event_id)
        .bind(TicketStatus::NotScanned.code())
        .bind(TicketStatus::Scanned.code())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn find_membership(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        price_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        let row = sqlx::query_as::<_, Membership>(&format!(
            "SELECT * FROM {} WHERE user_id = $1 AND price_id = $2",
            tenant.table("memberships")
        ))
        .bind(user_id)
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_membership(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Membership> {
        let row = sqlx::query_as::<_, Membership>(&format!(
            "SELECT * FROM {} WHERE uuid = $1",
            tenant.table("memberships")
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        found(row, "membership", id)
    }

    async fn insert_membership(&self, tenant: &TenantContext, membership: &Membership) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (uuid, user_id, price_id, subscription_id, last_invoice_id,
                             first_contribution, last_contribution, contribution_value,
                             first_name, last_name, pseudo, newsletter, status, payment_ids,
                             ledger_transaction_id, ledger_reference, date_added, last_action)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            tenant.table("memberships")
        ))
        .bind(membership.uuid)
        .bind(membership.user_id)
        .bind(membership.price_id)
        .bind(&membership.subscription_id)
        .bind(&membership.last_invoice_id)
        .bind(membership.first_contribution)
        .bind(membership.last_contribution)
        .bind(membership.contribution_value)
        .bind(&membership.first_name)
        .bind(&membership.last_name)
        .bind(&membership.pseudo)
        .bind(membership.newsletter)
        .bind(membership.status.code())
        .bind(&membership.payment_ids)
        .bind(membership.ledger_transaction_id)
        .bind(membership.ledger_reference)
        .bind(membership.date_added)
        .bind(membership.last_action)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn update_membership(&self, tenant: &TenantContext, membership: &Membership) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET subscription_id = $2, last_invoice_id = $3, first_contribution = $4,
                           last_contribution = $5, contribution_value = $6, newsletter = $7,
                           status = $8, payment_ids = $9, ledger_transaction_id = $10,
                           ledger_reference = $11, last_action = $12
             WHERE uuid = $1",
            tenant.table("memberships")
        ))
        .bind(membership.uuid)
        .bind(&membership.subscription_id)
        .bind(&membership.last_invoice_id)
        .bind(membership.first_contribution)
        .bind(membership.last_contribution)
        .bind(membership.contribution_value)
        .bind(membership.newsletter)
        .bind(membership.status.code())
        .bind(&membership.payment_ids)
        .bind(membership.ledger_transaction_id)
        .bind(membership.ledger_reference)
        .bind(membership.last_action)
        .execute(&self.pool)
        .await?;
        affected(result.rows_affected(), "membership", membership.uuid)
    }

    async fn active_webhooks(&self, tenant: &TenantContext, event: WebhookEvent) -> StoreResult<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT * FROM {} WHERE active AND event = $1",
            tenant.table("webhooks")
        ))
        .bind(event.code())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_webhook_response(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        response: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET last_response = $2 WHERE uuid = $1",
            tenant.table("webhooks")
        ))
        .bind(id)
        .bind(response)
        .execute(&self.pool)
        .await?;
        affected(result.rows_affected(), "webhook", id)
    }
}
