//! In-process store used by tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::config::TenantContext;
use crate::models::ticket::ScanRejection;
use crate::models::{
    Event, LineItem, Membership, Payment, PaymentStatus, Price, PriceSold, Product, ProductSold,
    Reservation, Ticket, User, Webhook, WebhookEvent,
};

#[derive(Debug, Default)]
struct Tables {
    products: HashMap<Uuid, Product>,
    prices: HashMap<Uuid, Price>,
    events: HashMap<Uuid, Event>,
    products_sold: HashMap<Uuid, ProductSold>,
    prices_sold: HashMap<Uuid, PriceSold>,
    users: HashMap<Uuid, User>,
    reservations: HashMap<Uuid, Reservation>,
    payments: HashMap<Uuid, Payment>,
    line_items: Vec<LineItem>,
    tickets: Vec<Ticket>,
    memberships: HashMap<Uuid, Membership>,
    webhooks: Vec<Webhook>,
}

/// Tables are kept per tenant schema behind a single lock, so every call is
/// atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    schemas: Mutex<HashMap<String, Tables>>,
    #[cfg(test)]
    line_item_read_failures: std::sync::atomic::AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an outgoing webhook. Operators do this through the admin
    /// surface, which lives outside this service.
    pub async fn insert_webhook(&self, tenant: &TenantContext, webhook: Webhook) {
        let mut schemas = self.schemas.lock().await;
        schemas
            .entry(tenant.schema().to_string())
            .or_default()
            .webhooks
            .push(webhook);
    }

    pub async fn webhook(&self, tenant: &TenantContext, id: Uuid) -> Option<Webhook> {
        let schemas = self.schemas.lock().await;
        schemas
            .get(tenant.schema())
            .and_then(|t| t.webhooks.iter().find(|w| w.uuid == id).cloned())
    }
}

fn get<T: Clone>(map: &HashMap<Uuid, T>, entity: &'static str, id: Uuid) -> StoreResult<T> {
    map.get(&id)
        .cloned()
        .ok_or_else(|| StoreError::not_found(entity, id))
}

fn replace<T>(map: &mut HashMap<Uuid, T>, entity: &'static str, id: Uuid, value: T) -> StoreResult<()> {
    match map.get_mut(&id) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(StoreError::not_found(entity, id)),
    }
}

macro_rules! with_tables {
    ($self:ident, $tenant:ident, $tables:ident => $body:expr) => {{
        let mut schemas = $self.schemas.lock().await;
        let $tables = schemas.entry($tenant.schema().to_string()).or_default();
        $body
    }};
}

#[cfg(test)]
impl MemoryStore {
    /// The next `n` line item listings fail as if the pool timed out.
    pub(crate) fn fail_line_item_reads(&self, n: u32) {
        self.line_item_read_failures
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) async fn payments(&self, tenant: &TenantContext) -> Vec<Payment> {
        with_tables!(self, tenant, t => t.payments.values().cloned().collect())
    }

    pub(crate) async fn reservations(&self, tenant: &TenantContext) -> Vec<Reservation> {
        with_tables!(self, tenant, t => t.reservations.values().cloned().collect())
    }

    pub(crate) async fn line_items(&self, tenant: &TenantContext) -> Vec<LineItem> {
        with_tables!(self, tenant, t => t.line_items.clone())
    }

    pub(crate) async fn tickets(&self, tenant: &TenantContext) -> Vec<Ticket> {
        with_tables!(self, tenant, t => t.tickets.clone())
    }

    fn line_item_read_failure(&self) -> StoreResult<()> {
        use std::sync::atomic::Ordering;
        match self
            .line_item_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_product(&self, tenant: &TenantContext, product: &Product) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            if t.products
                .values()
                .any(|p| p.category == product.category && p.name == product.name)
            {
                return Err(StoreError::Conflict(format!(
                    "product '{}' already exists in category {}",
                    product.name, product.category
                )));
            }
            t.products.insert(product.uuid, product.clone());
            Ok(())
        })
    }

    async fn get_product(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Product> {
        with_tables!(self, tenant, t => get(&t.products, "product", id))
    }

    async fn insert_price(&self, tenant: &TenantContext, price: &Price) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            if t.prices
                .values()
                .any(|p| p.product_id == price.product_id && p.name == price.name)
            {
                return Err(StoreError::Conflict(format!(
                    "price '{}' already exists for product {}",
                    price.name, price.product_id
                )));
            }
            t.prices.insert(price.uuid, price.clone());
            Ok(())
        })
    }

    async fn get_price(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Price> {
        with_tables!(self, tenant, t => get(&t.prices, "price", id))
    }

    async fn prices_for_product(&self, tenant: &TenantContext, product_id: Uuid) -> StoreResult<Vec<Price>> {
        with_tables!(self, tenant, t => {
            let mut prices: Vec<Price> = t
                .prices
                .values()
                .filter(|p| p.product_id == product_id)
                .cloned()
                .collect();
            prices.sort_by(|a, b| a.amount.cmp(&b.amount));
            Ok(prices)
        })
    }

    async fn insert_event(&self, tenant: &TenantContext, event: &Event) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            t.events.insert(event.uuid, event.clone());
            Ok(())
        })
    }

    async fn get_event(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Event> {
        with_tables!(self, tenant, t => get(&t.events, "event", id))
    }

    async fn get_or_insert_product_sold(
        &self,
        tenant: &TenantContext,
        candidate: ProductSold,
    ) -> StoreResult<(ProductSold, bool)> {
        with_tables!(self, tenant, t => {
            if let Some(existing) = t
                .products_sold
                .values()
                .find(|s| s.event_id == candidate.event_id && s.product_id == candidate.product_id)
            {
                return Ok((existing.clone(), false));
            }
            t.products_sold.insert(candidate.uuid, candidate.clone());
            Ok((candidate, true))
        })
    }

    async fn get_product_sold(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<ProductSold> {
        with_tables!(self, tenant, t => get(&t.products_sold, "product sold", id))
    }

    async fn update_product_sold(&self, tenant: &TenantContext, sold: &ProductSold) -> StoreResult<()> {
        with_tables!(self, tenant, t => replace(&mut t.products_sold, "product sold", sold.uuid, sold.clone()))
    }

    async fn get_or_insert_price_sold(
        &self,
        tenant: &TenantContext,
        candidate: PriceSold,
    ) -> StoreResult<(PriceSold, bool)> {
        with_tables!(self, tenant, t => {
            if let Some(existing) = t.prices_sold.values().find(|s| {
                s.product_sold_id == candidate.product_sold_id && s.price_id == candidate.price_id
            }) {
                return Ok((existing.clone(), false));
            }
            t.prices_sold.insert(candidate.uuid, candidate.clone());
            Ok((candidate, true))
        })
    }

    async fn get_price_sold(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<PriceSold> {
        with_tables!(self, tenant, t => get(&t.prices_sold, "price sold", id))
    }

    async fn update_price_sold(&self, tenant: &TenantContext, sold: &PriceSold) -> StoreResult<()> {
        with_tables!(self, tenant, t => replace(&mut t.prices_sold, "price sold", sold.uuid, sold.clone()))
    }

    async fn insert_user(&self, tenant: &TenantContext, user: &User) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            t.users.insert(user.uuid, user.clone());
            Ok(())
        })
    }

    async fn get_user(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<User> {
        with_tables!(self, tenant, t => get(&t.users, "user", id))
    }

    async fn insert_reservation(&self, tenant: &TenantContext, reservation: &Reservation) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            t.reservations.insert(reservation.uuid, reservation.clone());
            Ok(())
        })
    }

    async fn get_reservation(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Reservation> {
        with_tables!(self, tenant, t => get(&t.reservations, "reservation", id))
    }

    async fn update_reservation(&self, tenant: &TenantContext, reservation: &Reservation) -> StoreResult<()> {
        with_tables!(self, tenant, t => replace(&mut t.reservations, "reservation", reservation.uuid, reservation.clone()))
    }

    async fn insert_payment(&self, tenant: &TenantContext, payment: &Payment) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            t.payments.insert(payment.uuid, payment.clone());
            Ok(())
        })
    }

    async fn get_payment(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Payment> {
        with_tables!(self, tenant, t => get(&t.payments, "payment", id))
    }

    async fn compare_and_swap_payment(&self, tenant: &TenantContext, payment: &Payment) -> StoreResult<bool> {
        with_tables!(self, tenant, t => {
            let slot = t
                .payments
                .get_mut(&payment.uuid)
                .ok_or_else(|| StoreError::not_found("payment", payment.uuid))?;
            if slot.revision != payment.revision {
                return Ok(false);
            }
            *slot = Payment {
                revision: payment.revision + 1,
                ..payment.clone()
            };
            Ok(true)
        })
    }

    async fn stale_paid_payments(
        &self,
        tenant: &TenantContext,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<Payment>> {
        with_tables!(self, tenant, t => Ok(t
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Paid && p.last_action < before)
            .cloned()
            .collect()))
    }

    async fn insert_line_item(&self, tenant: &TenantContext, item: &LineItem) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            t.line_items.push(item.clone());
            Ok(())
        })
    }

    async fn get_line_item(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<LineItem> {
        with_tables!(self, tenant, t => t
            .line_items
            .iter()
            .find(|l| l.uuid == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("line item", id)))
    }

    async fn line_items_for_payment(&self, tenant: &TenantContext, payment_id: Uuid) -> StoreResult<Vec<LineItem>> {
        #[cfg(test)]
        self.line_item_read_failure()?;
        with_tables!(self, tenant, t => Ok(t
            .line_items
            .iter()
            .filter(|l| l.payment_id == Some(payment_id))
            .cloned()
            .collect()))
    }

    async fn update_line_item(&self, tenant: &TenantContext, item: &LineItem) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            match t.line_items.iter_mut().find(|l| l.uuid == item.uuid) {
                Some(slot) => {
                    *slot = item.clone();
                    Ok(())
                }
                None => Err(StoreError::not_found("line item", item.uuid)),
            }
        })
    }

    async fn insert_ticket(&self, tenant: &TenantContext, ticket: &Ticket) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            t.tickets.push(ticket.clone());
            Ok(())
        })
    }

    async fn get_ticket(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Ticket> {
        with_tables!(self, tenant, t => t
            .tickets
            .iter()
            .find(|ticket| ticket.uuid == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("ticket", id)))
    }

    async fn tickets_for_reservation(&self, tenant: &TenantContext, reservation_id: Uuid) -> StoreResult<Vec<Ticket>> {
        with_tables!(self, tenant, t => Ok(t
            .tickets
            .iter()
            .filter(|ticket| ticket.reservation_id == reservation_id)
            .cloned()
            .collect()))
    }

    async fn update_ticket(&self, tenant: &TenantContext, ticket: &Ticket) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            match t.tickets.iter_mut().find(|slot| slot.uuid == ticket.uuid) {
                Some(slot) => {
                    *slot = ticket.clone();
                    Ok(())
                }
                None => Err(StoreError::not_found("ticket", ticket.uuid)),
            }
        })
    }

    async fn scan_ticket(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Result<Ticket, ScanRejection>> {
        with_tables!(self, tenant, t => {
            let Some(ticket) = t.tickets.iter_mut().find(|ticket| ticket.uuid == id) else {
                return Ok(Err(ScanRejection::NotFound(id)));
            };
            Ok(ticket.scan(at).map(|()| ticket.clone()))
        })
    }

    async fn count_issued_tickets(&self, tenant: &TenantContext, event_id: Uuid) -> StoreResult<i64> {
        with_tables!(self, tenant, t => {
            let count = t
                .tickets
                .iter()
                .filter(|ticket| ticket.status.is_issued())
                .filter(|ticket| {
                    t.reservations
                        .get(&ticket.reservation_id)
                        .map(|r| r.event_id == event_id)
                        .unwrap_or(false)
                })
                .count();
            Ok(count as i64)
        })
    }

    async fn find_membership(
        &self,
        tenant: &TenantContext,
        user_id: Uuid,
        price_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        with_tables!(self, tenant, t => Ok(t
            .memberships
            .values()
            .find(|m| m.user_id == user_id && m.price_id == Some(price_id))
            .cloned()))
    }

    async fn get_membership(&self, tenant: &TenantContext, id: Uuid) -> StoreResult<Membership> {
        with_tables!(self, tenant, t => get(&t.memberships, "membership", id))
    }

    async fn insert_membership(&self, tenant: &TenantContext, membership: &Membership) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            if t.memberships
                .values()
                .any(|m| m.user_id == membership.user_id && m.price_id == membership.price_id)
            {
                return Err(StoreError::Conflict(format!(
                    "membership already exists for user {}",
                    membership.user_id
                )));
            }
            t.memberships.insert(membership.uuid, membership.clone());
            Ok(())
        })
    }

    async fn update_membership(&self, tenant: &TenantContext, membership: &Membership) -> StoreResult<()> {
        with_tables!(self, tenant, t => replace(&mut t.memberships, "membership", membership.uuid, membership.clone()))
    }

    async fn active_webhooks(&self, tenant: &TenantContext, event: WebhookEvent) -> StoreResult<Vec<Webhook>> {
        with_tables!(self, tenant, t => Ok(t
            .webhooks
            .iter()
            .filter(|w| w.active && w.event == event)
            .cloned()
            .collect()))
    }

    async fn record_webhook_response(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        response: &str,
    ) -> StoreResult<()> {
        with_tables!(self, tenant, t => {
            match t.webhooks.iter_mut().find(|w| w.uuid == id) {
                Some(webhook) => {
                    webhook.last_response = Some(response.to_string());
                    Ok(())
                }
                None => Err(StoreError::not_found("webhook", id)),
            }
        })
    }
}
