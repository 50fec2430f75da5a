//! Order opening and the payment attempt state machine.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use super::{CheckoutError, Sales};
use crate::config::TenantContext;
use crate::models::{
    LineItem, LineItemStatus, Payment, PaymentSource, PaymentStatus, Price, PriceSold, ProcessingSource, Product,
    Reservation, ReservationStatus, Ticket,
};
use crate::services::{CheckoutLine, CheckoutSession, NewCheckout};

#[derive(Debug, Clone)]
pub struct OrderLine {
    pub price_sold_id: Uuid,
    pub qty: i32,
    /// Ticket holders as (first name, last name), one per unit. Missing
    /// holders default to the buyer.
    pub holders: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub user_id: Uuid,
    /// Set for ticket sales; membership and donation carts have no event.
    pub event_id: Option<Uuid>,
    pub lines: Vec<OrderLine>,
    pub source: PaymentSource,
}

#[derive(Debug, Clone)]
pub struct OpenedOrder {
    pub reservation: Option<Reservation>,
    pub payment: Payment,
    pub line_items: Vec<LineItem>,
    pub tickets: Vec<Ticket>,
    /// Hosted checkout page; `None` for a free cart.
    pub checkout_url: Option<String>,
}

/// Result of reading the provider session into the payment attempt.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub payment: Payment,
    /// True only for the caller whose write moved the attempt to PAID. That
    /// caller, and no other, runs the completion pipeline.
    pub claimed: bool,
}

struct PricedLine {
    line: OrderLine,
    sold: PriceSold,
    price: Price,
    product: Product,
}

impl Sales {
    /// Creates the reservation, the payment attempt, its line items and
    /// tickets, then opens a hosted checkout for the cart.
    pub async fn open_order(&self, tenant: &TenantContext, request: OrderRequest) -> Result<OpenedOrder, CheckoutError> {
        if request.lines.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let user = self.store.get_user(tenant, request.user_id).await?;

        let mut priced = Vec::with_capacity(request.lines.len());
        for line in request.lines {
            let sold = self.store.get_price_sold(tenant, line.price_sold_id).await?;
            let price = self.store.get_price(tenant, sold.price_id).await?;
            let product_sold = self.store.get_product_sold(tenant, sold.product_sold_id).await?;
            let product = self.store.get_product(tenant, product_sold.product_id).await?;
            if line.qty < 1 || line.qty > price.max_per_user {
                return Err(CheckoutError::OverLimit {
                    price: price.uuid,
                    max: price.max_per_user,
                });
            }
            priced.push(PricedLine {
                line,
                sold,
                price,
                product,
            });
        }
        let recurring = priced.iter().any(|p| p.price.recurring_payment);
        if recurring && priced.len() > 1 {
            return Err(CheckoutError::RecurringMixed);
        }

        let reservation = match request.event_id {
            Some(event_id) => {
                let event = self.store.get_event(tenant, event_id).await?;
                let wanted: i64 = priced
                    .iter()
                    .filter(|p| p.product.nominative)
                    .map(|p| i64::from(p.line.qty))
                    .sum();
                if wanted > i64::from(event.max_per_user) {
                    return Err(CheckoutError::TooManyTickets {
                        event: event_id,
                        max: event.max_per_user,
                    });
                }
                let issued = self.store.count_issued_tickets(tenant, event_id).await?;
                if wanted > 0 && event.is_full(issued + wanted - 1) {
                    return Err(CheckoutError::EventFull(event_id));
                }
                let reservation = Reservation::new(user.uuid, event_id);
                self.store.insert_reservation(tenant, &reservation).await?;
                Some(reservation)
            }
            None => None,
        };

        let mut payment = Payment::new(reservation.as_ref().map(|r| r.uuid), Some(user.uuid));
        payment.source = request.source;
        payment.total = priced
            .iter()
            .map(|p| p.sold.amount * Decimal::from(p.line.qty))
            .sum();
        self.store.insert_payment(tenant, &payment).await?;

        let mut line_items = Vec::with_capacity(priced.len());
        let mut tickets = Vec::new();
        for p in &priced {
            let mut item = LineItem::new(p.sold.uuid, p.line.qty, p.price.vat.rate());
            item.payment_id = Some(payment.uuid);
            self.store.insert_line_item(tenant, &item).await?;
            line_items.push(item);

            if let (Some(reservation), true) = (&reservation, p.product.nominative) {
                for unit in 0..p.line.qty as usize {
                    let (first, last) = p.line.holders.get(unit).cloned().unwrap_or_else(|| {
                        (
                            user.first_name.clone().unwrap_or_default(),
                            user.last_name.clone().unwrap_or_default(),
                        )
                    });
                    let ticket = Ticket::new(reservation.uuid, p.sold.uuid, first, last);
                    self.store.insert_ticket(tenant, &ticket).await?;
                    tickets.push(ticket);
                }
            }
        }

        let free_price = priced.iter().any(|p| p.price.free_price);
        if payment.total.is_zero() && !free_price {
            return self
                .confirm_free_order(tenant, reservation, payment, line_items, tickets)
                .await;
        }

        let session = match self.start_checkout(tenant, &user.email, &payment, &mut priced, recurring).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(tenant = %tenant.slug(), payment = %payment.uuid, error = %e, "Checkout could not be opened");
                self.abandon(tenant, payment).await;
                return Err(e);
            }
        };

        payment.checkout_session_id = Some(session.id.clone());
        payment.transition(PaymentStatus::Open, Utc::now())?;
        let payment = self.write_payment(tenant, payment).await?;

        for item in &mut line_items {
            item.status = LineItemStatus::Unpaid;
            item.updated_at = Utc::now();
            self.store.update_line_item(tenant, item).await?;
        }
        let reservation = match reservation {
            Some(mut reservation) => {
                reservation.status = ReservationStatus::Unpaid;
                self.store.update_reservation(tenant, &reservation).await?;
                Some(reservation)
            }
            None => None,
        };
        tracing::info!(tenant = %tenant.slug(), payment = %payment.uuid, session = %session.id, total = %payment.total, "Checkout opened");

        Ok(OpenedOrder {
            reservation,
            payment,
            line_items,
            tickets,
            checkout_url: session.url,
        })
    }

    /// Publishes the cart's prices and opens the hosted checkout session.
    async fn start_checkout(
        &self,
        tenant: &TenantContext,
        email: &str,
        payment: &Payment,
        priced: &mut [PricedLine],
        recurring: bool,
    ) -> Result<CheckoutSession, CheckoutError> {
        let mut lines = Vec::with_capacity(priced.len());
        for p in priced.iter_mut() {
            let price = self.ensure_price_id(tenant, &mut p.sold, false).await?;
            lines.push(CheckoutLine {
                price,
                quantity: p.line.qty,
            });
        }
        let return_url = format!("{}/api/payments/{}", self.public_url, payment.uuid);
        let session = self
            .provider
            .create_checkout_session(
                tenant,
                &NewCheckout {
                    lines,
                    customer_email: email.to_string(),
                    subscription: recurring,
                    success_url: return_url.clone(),
                    cancel_url: return_url,
                    metadata: HashMap::from([
                        ("tenant".to_string(), tenant.slug().to_string()),
                        ("payment".to_string(), payment.uuid.to_string()),
                    ]),
                },
            )
            .await?;
        Ok(session)
    }

    /// Cancels the rows of an order whose checkout never opened. Failures
    /// are logged; the caller already has an error to return.
    async fn abandon(&self, tenant: &TenantContext, mut payment: Payment) {
        if let Err(e) = payment.transition(PaymentStatus::Canceled, Utc::now()) {
            tracing::error!(tenant = %tenant.slug(), payment = %payment.uuid, error = %e, "Cannot cancel unopened order");
            return;
        }
        let payment = match self.write_payment(tenant, payment).await {
            Ok(payment) => payment,
            Err(e) => {
                tracing::error!(tenant = %tenant.slug(), error = %e, "Cannot cancel unopened order");
                return;
            }
        };
        if let Err(e) = self.release(tenant, &payment, ReservationStatus::Canceled).await {
            tracing::error!(tenant = %tenant.slug(), payment = %payment.uuid, error = %e, "Cannot release unopened order");
        }
    }

    async fn confirm_free_order(
        &self,
        tenant: &TenantContext,
        reservation: Option<Reservation>,
        payment: Payment,
        mut line_items: Vec<LineItem>,
        mut tickets: Vec<Ticket>,
    ) -> Result<OpenedOrder, CheckoutError> {
        for item in &mut line_items {
            item.status = LineItemStatus::FreeReservation;
            item.updated_at = Utc::now();
            self.store.update_line_item(tenant, item).await?;
        }
        for ticket in &mut tickets {
            if ticket.activate() {
                self.store.update_ticket(tenant, ticket).await?;
            }
        }
        let reservation = match reservation {
            Some(mut reservation) => {
                reservation.status = ReservationStatus::FreeReservation;
                self.store.update_reservation(tenant, &reservation).await?;
                Some(reservation)
            }
            None => None,
        };
        tracing::info!(tenant = %tenant.slug(), payment = %payment.uuid, "Free order confirmed without checkout");
        Ok(OpenedOrder {
            reservation,
            payment,
            line_items,
            tickets,
            checkout_url: None,
        })
    }

    /// Reads the provider checkout session into the payment attempt.
    ///
    /// - paid: PAID, with the processing flag set and subscription and
    ///   invoice ids captured;
    /// - expired and not paid: EXPIRE, releasing line items and tickets;
    /// - otherwise: PENDING.
    ///
    /// Attempts already PAID or terminal are returned unchanged. A PAID
    /// attempt still flagged as processing is a duplicate delivery.
    pub async fn update_checkout_status(
        &self,
        tenant: &TenantContext,
        payment_id: Uuid,
        source: ProcessingSource,
    ) -> Result<StatusUpdate, CheckoutError> {
        let mut payment = self.store.get_payment(tenant, payment_id).await?;
        if payment.status == PaymentStatus::Paid || payment.status.is_terminal() {
            if payment.status == PaymentStatus::Paid && payment.processing {
                tracing::warn!(tenant = %tenant.slug(), payment = %payment.uuid, source = ?source, "Payment already being processed, duplicate delivery ignored");
            }
            return Ok(StatusUpdate {
                payment,
                claimed: false,
            });
        }
        let Some(session_id) = payment.checkout_session_id.clone() else {
            return Ok(StatusUpdate {
                payment,
                claimed: false,
            });
        };

        let session = self.provider.retrieve_checkout_session(tenant, &session_id).await?;
        let now = Utc::now();

        if session.is_paid() {
            payment.transition(PaymentStatus::Paid, now)?;
            payment.processing = true;
            payment.processing_source = source;
            payment.payment_intent_id = session.payment_intent.clone().or(payment.payment_intent_id);
            payment.customer_id = session.customer.clone().or(payment.customer_id);
            payment.invoice_id = session.invoice.clone().or(payment.invoice_id);
            if let (true, Some(subscription_id)) = (session.is_subscription(), &session.subscription) {
                payment.subscription_id = Some(subscription_id.clone());
                match self.provider.retrieve_subscription(tenant, subscription_id).await {
                    Ok(subscription) => {
                        payment.invoice_id = subscription.latest_invoice.or(payment.invoice_id);
                    }
                    Err(e) => {
                        tracing::warn!(tenant = %tenant.slug(), payment = %payment.uuid, error = %e, "Could not read subscription invoice");
                    }
                }
            }
            return self.claim(tenant, payment).await;
        }

        if session.expires_at().is_some_and(|at| at <= now) {
            payment.transition(PaymentStatus::Expired, now)?;
            let payment = self.write_payment(tenant, payment).await?;
            self.release(tenant, &payment, ReservationStatus::Unpaid).await?;
            tracing::info!(tenant = %tenant.slug(), payment = %payment.uuid, "Checkout expired");
            return Ok(StatusUpdate {
                payment,
                claimed: false,
            });
        }

        if payment.status != PaymentStatus::Pending {
            payment.transition(PaymentStatus::Pending, now)?;
            payment = self.write_payment(tenant, payment).await?;
        }
        Ok(StatusUpdate {
            payment,
            claimed: false,
        })
    }

    /// Writes the PAID attempt. Losing the race means another delivery
    /// already claimed it.
    async fn claim(&self, tenant: &TenantContext, payment: Payment) -> Result<StatusUpdate, CheckoutError> {
        if self.store.compare_and_swap_payment(tenant, &payment).await? {
            tracing::info!(tenant = %tenant.slug(), payment = %payment.uuid, source = ?payment.processing_source, "Payment marked paid");
            let payment = self.store.get_payment(tenant, payment.uuid).await?;
            return Ok(StatusUpdate {
                payment,
                claimed: true,
            });
        }
        let current = self.store.get_payment(tenant, payment.uuid).await?;
        tracing::warn!(tenant = %tenant.slug(), payment = %payment.uuid, status = ?current.status, "Payment claimed by a concurrent delivery");
        Ok(StatusUpdate {
            payment: current,
            claimed: false,
        })
    }

    /// Cancels an attempt that has not been paid.
    pub async fn cancel(&self, tenant: &TenantContext, payment_id: Uuid) -> Result<Payment, CheckoutError> {
        let mut payment = self.store.get_payment(tenant, payment_id).await?;
        payment.transition(PaymentStatus::Canceled, Utc::now())?;
        payment.processing = false;
        let payment = self.write_payment(tenant, payment).await?;
        self.release(tenant, &payment, ReservationStatus::Canceled).await?;
        tracing::info!(tenant = %tenant.slug(), payment = %payment.uuid, "Payment canceled");
        Ok(payment)
    }

    /// Conditional write of `payment`; returns the stored row.
    pub(super) async fn write_payment(&self, tenant: &TenantContext, payment: Payment) -> Result<Payment, CheckoutError> {
        if !self.store.compare_and_swap_payment(tenant, &payment).await? {
            return Err(CheckoutError::Conflict(payment.uuid));
        }
        Ok(self.store.get_payment(tenant, payment.uuid).await?)
    }

    /// Unpaid line items become CANCELED, unused tickets NOT_ACTIV and the
    /// reservation takes `reservation_status`.
    async fn release(
        &self,
        tenant: &TenantContext,
        payment: &Payment,
        reservation_status: ReservationStatus,
    ) -> Result<(), CheckoutError> {
        for mut item in self.store.line_items_for_payment(tenant, payment.uuid).await? {
            if item.status.awaiting_payment() {
                item.status = LineItemStatus::Canceled;
                item.updated_at = Utc::now();
                self.store.update_line_item(tenant, &item).await?;
            }
        }
        if let Some(reservation_id) = payment.reservation_id {
            for mut ticket in self.store.tickets_for_reservation(tenant, reservation_id).await? {
                if ticket.deactivate() {
                    self.store.update_ticket(tenant, &ticket).await?;
                }
            }
            let mut reservation = self.store.get_reservation(tenant, reservation_id).await?;
            reservation.status = reservation_status;
            self.store.update_reservation(tenant, &reservation).await?;
        }
        Ok(())
    }
}
