//! Completion handlers run for each paid line item, chosen by category.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;

use super::{Sales, TriggerError};
use crate::config::TenantContext;
use crate::models::catalog::{from_cents, to_cents};
use crate::models::{
    CategoryCode, LedgerAction, LineItem, LineItemStatus, Membership, MembershipStatus, Payment, Price, PriceSold,
    Product,
};
use crate::services::{InvoiceNotice, MembershipTransaction, SaleRecord, Subscriber, Task};

/// Completion handler for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Don,
    Adhesion,
    Billet,
    FreeReservation,
    RechargeCashless,
    RechargeFederated,
    /// Category with nothing to do once paid.
    NoHandler,
}

impl Handler {
    pub fn for_category(category: CategoryCode) -> Self {
        match category {
            CategoryCode::Don => Handler::Don,
            CategoryCode::Adhesion => Handler::Adhesion,
            CategoryCode::Billet => Handler::Billet,
            CategoryCode::FreeReservation => Handler::FreeReservation,
            CategoryCode::RechargeCashless => Handler::RechargeCashless,
            CategoryCode::RechargeFederated => Handler::RechargeFederated,
            CategoryCode::None
            | CategoryCode::Pack
            | CategoryCode::Vetement
            | CategoryCode::Merch
            | CategoryCode::NeedValidation => Handler::NoHandler,
        }
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// The handler ran; the line item now has this status.
    Applied(LineItemStatus),
    /// No handler for the category; the line item was left as is.
    Skipped(CategoryCode),
    /// The handler failed and the line item kept its previous status.
    Failed(TriggerError),
}

impl TriggerOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TriggerOutcome::Failed(_))
    }
}

/// Everything a handler reads about the line item it completes.
struct Sold {
    price_sold: PriceSold,
    price: Price,
    product: Product,
    category: CategoryCode,
}

impl Sales {
    async fn load_sold(&self, tenant: &TenantContext, item: &LineItem) -> Result<Sold, TriggerError> {
        let price_sold = self.store.get_price_sold(tenant, item.price_sold_id).await?;
        let product_sold = self.store.get_product_sold(tenant, price_sold.product_sold_id).await?;
        let product = self.store.get_product(tenant, product_sold.product_id).await?;
        let price = self.store.get_price(tenant, price_sold.price_id).await?;
        let category = product_sold.resolved_category(&product);
        Ok(Sold {
            price_sold,
            price,
            product,
            category,
        })
    }

    /// Dispatch entry point for one line item. All effects are persisted;
    /// failures are logged and never returned.
    pub async fn dispatch_line_item(&self, tenant: &TenantContext, line_item_id: uuid::Uuid) {
        let outcome = match self.store.get_line_item(tenant, line_item_id).await {
            Ok(item) => match item.payment_id {
                Some(payment_id) => match self.store.get_payment(tenant, payment_id).await {
                    Ok(payment) => self.run_trigger(tenant, &payment, item).await,
                    Err(e) => TriggerOutcome::Failed(e.into()),
                },
                None => TriggerOutcome::Failed(TriggerError::Detached(item.uuid)),
            },
            Err(e) => TriggerOutcome::Failed(e.into()),
        };
        if let TriggerOutcome::Failed(e) = outcome {
            tracing::error!(tenant = %tenant.slug(), line_item = %line_item_id, error = %e, "Line item dispatch failed");
        }
    }

    /// Runs the handler of the line item's category, catching its failure.
    pub(super) async fn run_trigger(&self, tenant: &TenantContext, payment: &Payment, item: LineItem) -> TriggerOutcome {
        let line_item = item.uuid;
        let sold = match self.load_sold(tenant, &item).await {
            Ok(sold) => sold,
            Err(e) => {
                tracing::error!(tenant = %tenant.slug(), line_item = %line_item, error = %e, "Cannot resolve line item category");
                return TriggerOutcome::Failed(e);
            }
        };
        let category = sold.category;
        let handler = Handler::for_category(category);
        tracing::info!(tenant = %tenant.slug(), line_item = %line_item, category = ?category, handler = ?handler, "Category trigger");

        let result = match handler {
            Handler::Don => self.complete_donation(tenant, item).await,
            Handler::Adhesion => self.complete_adhesion(tenant, payment, item, sold).await,
            Handler::Billet
            | Handler::FreeReservation
            | Handler::RechargeCashless
            | Handler::RechargeFederated
            | Handler::NoHandler => {
                tracing::info!(tenant = %tenant.slug(), line_item = %line_item, category = ?category, "No completion handler for category");
                return TriggerOutcome::Skipped(category);
            }
        };

        match result {
            Ok(status) => TriggerOutcome::Applied(status),
            Err(e) => {
                tracing::error!(
                    tenant = %tenant.slug(),
                    line_item = %line_item,
                    category = ?category,
                    transient = e.is_transient(),
                    error = %e,
                    "Category trigger failed"
                );
                TriggerOutcome::Failed(e)
            }
        }
    }

    async fn complete_donation(&self, tenant: &TenantContext, mut item: LineItem) -> Result<LineItemStatus, TriggerError> {
        item.status = LineItemStatus::Valid;
        item.updated_at = Utc::now();
        self.store.update_line_item(tenant, &item).await?;
        Ok(item.status)
    }

    /// Membership completion. Every step can be replayed: the contribution
    /// is keyed on the payment attempt and the ledger push on the line item.
    async fn complete_adhesion(
        &self,
        tenant: &TenantContext,
        payment: &Payment,
        mut item: LineItem,
        sold: Sold,
    ) -> Result<LineItemStatus, TriggerError> {
        let user_id = payment.user_id.ok_or(TriggerError::NoBuyer(payment.uuid))?;
        let user = self.store.get_user(tenant, user_id).await?;

        let mut membership = match self.store.find_membership(tenant, user.uuid, sold.price.uuid).await? {
            Some(membership) => membership,
            None => {
                let mut membership = Membership::new(user.uuid, Some(sold.price.uuid));
                membership.first_name = user.first_name.clone();
                membership.last_name = user.last_name.clone();
                self.store.insert_membership(tenant, &membership).await?;
                membership
            }
        };

        if !membership.payment_ids.contains(&payment.uuid) {
            let value = if sold.price.free_price {
                let cents = self.charged_amount(tenant, payment).await?;
                item.amount = Some(cents);
                from_cents(cents)
            } else {
                item.amount = Some(to_cents(sold.price_sold.amount) * i64::from(item.qty));
                sold.price_sold.amount
            };

            let today = Utc::now().date_naive();
            membership.contribute(value, today);
            membership.record_payment(payment.uuid);
            if let Some(invoice) = &payment.invoice_id {
                membership.last_invoice_id = Some(invoice.clone());
            }
            if let Some(subscription) = &payment.subscription_id {
                membership.subscription_id = Some(subscription.clone());
                membership.status = MembershipStatus::Auto;
            }
            membership.last_action = Utc::now();
            self.store.update_membership(tenant, &membership).await?;
            item.updated_at = Utc::now();
            self.store.update_line_item(tenant, &item).await?;
            tracing::info!(tenant = %tenant.slug(), membership = %membership.uuid, contribution = %value, "Membership contribution recorded");

            self.tasks.enqueue(Task::InvoiceEmail {
                tenant: tenant.clone(),
                notice: InvoiceNotice {
                    membership: membership.uuid,
                    email: user.email.clone(),
                    member_name: membership.member_name(),
                    organisation: tenant.config().organisation.clone(),
                    amount: value,
                    invoice_number: payment.invoice_number(),
                    date: today,
                },
            });
        }

        if membership.ledger_reference != Some(item.uuid) {
            let contribution = membership.contribution_value.unwrap_or(Decimal::ZERO);
            let receipt = self
                .bridge
                .push_membership(
                    tenant,
                    &MembershipTransaction {
                        reference: item.uuid,
                        membership: membership.uuid,
                        email: user.email.clone(),
                        member_name: membership.member_name(),
                        amount: to_cents(contribution),
                        action: LedgerAction::Subscribe,
                        subscription_start_datetime: Utc::now(),
                        payment: payment.uuid,
                    },
                )
                .await?;
            membership.ledger_transaction_id = Some(receipt.uuid);
            membership.ledger_reference = Some(item.uuid);
            membership.last_action = Utc::now();
            self.store.update_membership(tenant, &membership).await?;

            if tenant.config().cashless.is_some() {
                self.tasks.enqueue(Task::CashlessSale {
                    tenant: tenant.clone(),
                    sale: SaleRecord {
                        reference: item.uuid,
                        order: payment.uuid,
                        email: user.email.clone(),
                        product: sold.product.name.clone(),
                        price: sold.price.name.clone(),
                        qty: item.qty,
                        amount: item.amount.unwrap_or_else(|| to_cents(contribution)),
                        category: sold.category.code().to_string(),
                    },
                });
            }
            if membership.newsletter {
                self.tasks.enqueue(Task::PublishMember {
                    tenant: tenant.clone(),
                    subscriber: Subscriber {
                        membership: membership.uuid,
                        email: user.email.clone(),
                        name: membership.member_name(),
                    },
                });
            }
        }

        item.status = LineItemStatus::Valid;
        item.updated_at = Utc::now();
        self.store.update_line_item(tenant, &item).await?;
        Ok(item.status)
    }

    /// Amount the buyer actually paid, read back from the provider.
    async fn charged_amount(&self, tenant: &TenantContext, payment: &Payment) -> Result<i64, TriggerError> {
        let session_id = payment
            .checkout_session_id
            .as_deref()
            .ok_or(TriggerError::MissingAmount(payment.uuid))?;
        let session = self.provider.retrieve_checkout_session(tenant, session_id).await?;
        session.amount_total.ok_or(TriggerError::MissingAmount(payment.uuid))
    }

    pub(super) fn webhook_payload(tenant: &TenantContext, payment: &Payment) -> serde_json::Value {
        json!({
            "event": "reservation_validated",
            "tenant": tenant.slug(),
            "reservation": payment.reservation_id,
            "payment": payment.uuid,
            "status": payment.status.code(),
        })
    }
}
