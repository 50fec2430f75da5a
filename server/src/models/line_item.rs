use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

coded_enum! {
    pub enum LineItemStatus: "line item status" {
        Canceled => "C",
        Created => "O",
        Unpaid => "U",
        FreeReservation => "F",
        Paid => "P",
        Valid => "V",
    }
}

impl LineItemStatus {
    /// Still waiting for the provider to confirm the money.
    pub fn awaiting_payment(self) -> bool {
        matches!(self, LineItemStatus::Created | LineItemStatus::Unpaid)
    }
}

/// One priced quantity inside a payment attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItem {
    pub uuid: Uuid,
    pub price_sold_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub qty: i32,
    pub vat: Decimal,
    /// Charged amount in cents once confirmed by the provider.
    pub amount: Option<i64>,
    #[sqlx(try_from = "String")]
    pub status: LineItemStatus,
    pub updated_at: DateTime<Utc>,
}

impl LineItem {
    pub fn new(price_sold_id: Uuid, qty: i32, vat: Decimal) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            price_sold_id,
            payment_id: None,
            qty,
            vat,
            amount: None,
            status: LineItemStatus::Created,
            updated_at: Utc::now(),
        }
    }
}
