use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

coded_enum! {
    pub enum ReservationStatus: "reservation status" {
        Canceled => "C",
        Created => "R",
        Unpaid => "U",
        FreeReservation => "F",
        FreeReservationUserActive => "FA",
        Paid => "P",
        PaidError => "PE",
        PaidNoMail => "PN",
        Valid => "V",
    }
}

/// One checkout grouping of line items for a user and an event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub uuid: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: ReservationStatus,
    pub to_mail: bool,
    pub mail_send: bool,
    pub mail_error: bool,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(user_id: Uuid, event_id: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            user_id,
            event_id,
            status: ReservationStatus::Created,
            to_mail: true,
            mail_send: false,
            mail_error: false,
            created_at: Utc::now(),
        }
    }
}

coded_enum! {
    /// Lifecycle of one hosted checkout or subscription attempt.
    ///
    /// `None -> Open -> Pending -> {Paid -> {Valid | NotSync}, Expired, Canceled}`
    pub enum PaymentStatus: "payment status" {
        None => "N",
        Open => "O",
        Pending => "W",
        Expired => "E",
        Paid => "P",
        Valid => "V",
        NotSync => "S",
        Canceled => "C",
    }
}

impl PaymentStatus {
    pub fn label(self) -> &'static str {
        match self {
            PaymentStatus::None => "Payment link not created",
            PaymentStatus::Open => "Sent to payment provider",
            PaymentStatus::Pending => "Waiting for payment",
            PaymentStatus::Expired => "Expired",
            PaymentStatus::Paid => "Paid",
            PaymentStatus::Valid => "Paid and validated",
            PaymentStatus::NotSync => "Paid, ledger sync failed",
            PaymentStatus::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Expired
                | PaymentStatus::Canceled
                | PaymentStatus::Valid
                | PaymentStatus::NotSync
        )
    }

    /// Position along the forward path; cancellation sits outside it.
    fn rank(self) -> u8 {
        match self {
            PaymentStatus::None => 0,
            PaymentStatus::Open => 1,
            PaymentStatus::Pending => 2,
            PaymentStatus::Paid | PaymentStatus::Expired => 3,
            PaymentStatus::Valid | PaymentStatus::NotSync => 4,
            PaymentStatus::Canceled => 5,
        }
    }

    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        match (self, next) {
            (None | Open | Pending, Canceled) => true,
            (_, Canceled) => false,
            (Paid, Valid | NotSync) => true,
            // manual re-sync only
            (NotSync, Valid) => true,
            (Paid | Expired | Valid | NotSync | Canceled, _) => false,
            (None | Open | Pending, Valid | NotSync) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

coded_enum! {
    /// Where the current processing run was started from.
    pub enum ProcessingSource: "processing source" {
        Idle => "N",
        Webhook => "W",
        Get => "G",
        WebhookInvoice => "I",
    }
}

coded_enum! {
    /// Where the order itself came from.
    pub enum PaymentSource: "payment source" {
        QrCode => "Q",
        Ticketing => "B",
        Invoice => "I",
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("payment {payment} cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub payment: Uuid,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
}

/// One checkout attempt at the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub uuid: Uuid,
    pub reservation_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub invoice_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Set while the paid attempt is being dispatched; a second delivery
    /// seeing it set is a duplicate.
    pub processing: bool,
    #[sqlx(try_from = "String")]
    pub processing_source: ProcessingSource,
    #[sqlx(try_from = "String")]
    pub source: PaymentSource,
    pub total: Decimal,
    pub order_date: DateTime<Utc>,
    pub last_action: DateTime<Utc>,
    /// Optimistic lock, bumped by every conditional write.
    pub revision: i64,
}

impl Payment {
    pub fn new(reservation_id: Option<Uuid>, user_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            reservation_id,
            user_id,
            status: PaymentStatus::None,
            checkout_session_id: None,
            payment_intent_id: None,
            customer_id: None,
            invoice_id: None,
            subscription_id: None,
            processing: false,
            processing_source: ProcessingSource::Idle,
            source: PaymentSource::Ticketing,
            total: Decimal::ZERO,
            order_date: now,
            last_action: now,
            revision: 0,
        }
    }

    pub fn transition(&mut self, next: PaymentStatus, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                payment: self.uuid,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.last_action = at;
        Ok(())
    }

    pub fn short_id(&self) -> String {
        self.uuid.to_string().split('-').next().unwrap_or_default().to_string()
    }

    pub fn invoice_number(&self) -> String {
        format!("{}-{}", self.order_date.format("%y%m%d"), self.short_id())
    }
}
