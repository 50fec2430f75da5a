//! Confirmation pipeline, run after the PAID write.
//!
//! The attempt is written PAID first (see [`Sales::update_checkout_status`]),
//! then its line items are dispatched one by one. A crash in between leaves
//! a PAID attempt that [`Sales::reconcile`] picks up again.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::triggers::TriggerOutcome;
use super::{CheckoutError, Sales};
use crate::config::TenantContext;
use crate::models::order::InvalidTransition;
use crate::models::{
    LineItemStatus, Payment, PaymentStatus, ProcessingSource, ReservationStatus, WebhookEvent,
};
use crate::services::Task;

/// How long a re-sync may hold the processing flag, in seconds.
pub const RESYNC_LEASE_SECS: i64 = 600;

impl Sales {
    /// Reads the provider session and, for the caller that claimed the PAID
    /// transition, runs the completion pipeline. Returns the attempt as it
    /// stands afterwards.
    pub async fn confirm(
        &self,
        tenant: &TenantContext,
        payment_id: Uuid,
        source: ProcessingSource,
    ) -> Result<Payment, CheckoutError> {
        let update = self.update_checkout_status(tenant, payment_id, source).await?;
        if !update.claimed {
            return Ok(update.payment);
        }
        self.complete_paid(tenant, update.payment).await
    }

    /// Settles line items, activates tickets and dispatches every paid line
    /// item. Ends VALID when every handler succeeded, NOTSYNC otherwise.
    async fn complete_paid(&self, tenant: &TenantContext, payment: Payment) -> Result<Payment, CheckoutError> {
        let now = Utc::now();
        for mut item in self.store.line_items_for_payment(tenant, payment.uuid).await? {
            if item.status.awaiting_payment() {
                item.status = LineItemStatus::Paid;
                item.updated_at = now;
                self.store.update_line_item(tenant, &item).await?;
                let mut sold = self.store.get_price_sold(tenant, item.price_sold_id).await?;
                sold.record_sale(item.qty);
                self.store.update_price_sold(tenant, &sold).await?;
            }
        }
        if let Some(reservation_id) = payment.reservation_id {
            let mut reservation = self.store.get_reservation(tenant, reservation_id).await?;
            reservation.status = ReservationStatus::Paid;
            self.store.update_reservation(tenant, &reservation).await?;
            for mut ticket in self.store.tickets_for_reservation(tenant, reservation_id).await? {
                if ticket.activate() {
                    self.store.update_ticket(tenant, &ticket).await?;
                }
            }
        }

        let synced = self.dispatch_paid_items(tenant, &payment).await?;
        let next = if synced { PaymentStatus::Valid } else { PaymentStatus::NotSync };
        self.finish(tenant, payment, next).await
    }

    /// Runs the trigger of each line item still PAID. Returns false if any
    /// handler failed.
    async fn dispatch_paid_items(&self, tenant: &TenantContext, payment: &Payment) -> Result<bool, CheckoutError> {
        let mut synced = true;
        for item in self.store.line_items_for_payment(tenant, payment.uuid).await? {
            if item.status != LineItemStatus::Paid {
                continue;
            }
            if let TriggerOutcome::Failed(_) = self.run_trigger(tenant, payment, item).await {
                synced = false;
            }
        }
        Ok(synced)
    }

    /// Final write of the pipeline: clears the processing flag and, once
    /// VALID, validates the reservation and notifies webhooks.
    async fn finish(&self, tenant: &TenantContext, mut payment: Payment, next: PaymentStatus) -> Result<Payment, CheckoutError> {
        if payment.status != next {
            payment.transition(next, Utc::now())?;
        }
        payment.processing = false;
        payment.processing_source = ProcessingSource::Idle;
        let payment = self.write_payment(tenant, payment).await?;

        if let Some(reservation_id) = payment.reservation_id {
            let mut reservation = self.store.get_reservation(tenant, reservation_id).await?;
            reservation.status = match payment.status {
                PaymentStatus::Valid => ReservationStatus::Valid,
                _ => ReservationStatus::PaidError,
            };
            self.store.update_reservation(tenant, &reservation).await?;
        }

        match payment.status {
            PaymentStatus::Valid => {
                tracing::info!(tenant = %tenant.slug(), payment = %payment.uuid, "Payment validated");
                if payment.reservation_id.is_some() {
                    let payload = Self::webhook_payload(tenant, &payment);
                    for webhook in self
                        .store
                        .active_webhooks(tenant, WebhookEvent::ReservationValidated)
                        .await?
                    {
                        self.tasks.enqueue(Task::Webhook {
                            tenant: tenant.clone(),
                            webhook,
                            payload: payload.clone(),
                        });
                    }
                }
            }
            status => {
                tracing::warn!(tenant = %tenant.slug(), payment = %payment.uuid, status = ?status, "Payment paid but not synchronised");
            }
        }
        Ok(payment)
    }

    /// Operator re-sync of a NOTSYNC attempt. Line items already VALID are
    /// not touched again.
    ///
    /// A re-sync still flagged as processing after [`RESYNC_LEASE_SECS`] is taken
    /// to be abandoned and may be started again.
    pub async fn resync(&self, tenant: &TenantContext, payment_id: Uuid) -> Result<Payment, CheckoutError> {
        let mut payment = self.store.get_payment(tenant, payment_id).await?;
        let now = Utc::now();
        let running = payment.processing && now - payment.last_action < Duration::seconds(RESYNC_LEASE_SECS);
        if payment.status != PaymentStatus::NotSync || running {
            return Err(InvalidTransition {
                payment: payment.uuid,
                from: payment.status,
                to: PaymentStatus::Valid,
            }
            .into());
        }
        if payment.processing {
            tracing::warn!(tenant = %tenant.slug(), payment = %payment.uuid, since = %payment.last_action, "Taking over abandoned re-sync");
        }
        payment.processing = true;
        payment.processing_source = ProcessingSource::Get;
        payment.last_action = now;
        let payment = self.write_payment(tenant, payment).await?;
        tracing::info!(tenant = %tenant.slug(), payment = %payment.uuid, "Manual re-sync started");

        let id = payment.uuid;
        let result = self.redispatch(tenant, payment).await;
        if let Err(e) = &result {
            tracing::error!(tenant = %tenant.slug(), payment = %id, error = %e, "Manual re-sync failed");
            self.release_processing(tenant, id).await;
        }
        result
    }

    async fn redispatch(&self, tenant: &TenantContext, payment: Payment) -> Result<Payment, CheckoutError> {
        let synced = self.dispatch_paid_items(tenant, &payment).await?;
        let next = if synced { PaymentStatus::Valid } else { PaymentStatus::NotSync };
        self.finish(tenant, payment, next).await
    }

    /// Clears the processing flag left by a failed re-sync so the attempt
    /// can be re-synced again.
    async fn release_processing(&self, tenant: &TenantContext, payment_id: Uuid) {
        let mut payment = match self.store.get_payment(tenant, payment_id).await {
            Ok(payment) => payment,
            Err(e) => {
                tracing::error!(tenant = %tenant.slug(), payment = %payment_id, error = %e, "Could not reload payment to clear processing flag");
                return;
            }
        };
        if !payment.processing {
            return;
        }
        payment.processing = false;
        payment.processing_source = ProcessingSource::Idle;
        match self.store.compare_and_swap_payment(tenant, &payment).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(tenant = %tenant.slug(), payment = %payment_id, "Payment changed while clearing processing flag")
            }
            Err(e) => {
                tracing::error!(tenant = %tenant.slug(), payment = %payment_id, error = %e, "Could not clear processing flag")
            }
        }
    }

    /// Re-runs the pipeline for PAID attempts untouched since `stale_before`.
    /// Returns how many attempts were picked up.
    pub async fn reconcile(&self, tenant: &TenantContext, stale_before: DateTime<Utc>) -> Result<usize, CheckoutError> {
        let mut resumed = 0;
        for mut payment in self.store.stale_paid_payments(tenant, stale_before).await? {
            payment.processing = true;
            payment.processing_source = ProcessingSource::Idle;
            payment.last_action = Utc::now();
            let id = payment.uuid;
            if !self.store.compare_and_swap_payment(tenant, &payment).await? {
                tracing::debug!(tenant = %tenant.slug(), payment = %id, "Stale payment picked up elsewhere");
                continue;
            }
            let payment = self.store.get_payment(tenant, id).await?;
            tracing::warn!(tenant = %tenant.slug(), payment = %id, "Resuming stale paid payment");
            match self.complete_paid(tenant, payment).await {
                Ok(_) => resumed += 1,
                Err(e) => {
                    tracing::error!(tenant = %tenant.slug(), payment = %id, error = %e, "Reconciliation failed")
                }
            }
        }
        Ok(resumed)
    }
}
