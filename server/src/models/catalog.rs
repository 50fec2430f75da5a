use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use super::event::Event;

coded_enum! {
    /// Kind of article a product is sold as. Drives the completion handler
    /// that runs once the article is paid.
    pub enum CategoryCode: "category" {
        None => "N",
        Billet => "B",
        Pack => "P",
        RechargeCashless => "R",
        RechargeFederated => "S",
        Vetement => "T",
        Merch => "M",
        Adhesion => "A",
        Don => "D",
        FreeReservation => "F",
        NeedValidation => "V",
    }
}

coded_enum! {
    pub enum VatClass: "vat" {
        NotApplicable => "NA",
        Ten => "DX",
        Twenty => "VG",
    }
}

impl VatClass {
    /// Rate in percent.
    pub fn rate(self) -> Decimal {
        match self {
            VatClass::NotApplicable => Decimal::ZERO,
            VatClass::Ten => Decimal::from(10),
            VatClass::Twenty => Decimal::from(20),
        }
    }
}

coded_enum! {
    pub enum SubscriptionType: "subscription" {
        NotApplicable => "N",
        Year => "Y",
        Month => "M",
        Civil => "C",
    }
}

impl SubscriptionType {
    /// End of the period opened by a contribution made on `from`.
    pub fn deadline(self, from: NaiveDate) -> Option<NaiveDate> {
        match self {
            SubscriptionType::NotApplicable => None,
            SubscriptionType::Year => Some(from + Duration::days(365)),
            SubscriptionType::Month => Some(from + Duration::days(31)),
            SubscriptionType::Civil => NaiveDate::from_ymd_opt(from.year(), 12, 31),
        }
    }

    /// Billing interval of the provider price for a recurring subscription.
    pub fn recurring_interval(self) -> Option<&'static str> {
        match self {
            SubscriptionType::Month => Some("month"),
            SubscriptionType::Year => Some("year"),
            SubscriptionType::NotApplicable | SubscriptionType::Civil => None,
        }
    }
}

/// Converts a decimal amount to provider minor units.
pub fn to_cents(amount: Decimal) -> i64 {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .unwrap_or_default()
}

/// Converts provider minor units back to a two-decimal amount.
pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub uuid: Uuid,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub category: CategoryCode,
    /// Full name required for every ticket of this product.
    pub nominative: bool,
    pub send_to_cashless: bool,
    pub archive: bool,
    pub img_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn new(name: impl Into<String>, category: CategoryCode) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            category,
            nominative: category == CategoryCode::Billet,
            send_to_cashless: false,
            archive: false,
            img_url: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PriceError {
    #[error("price amount must not be negative, got {0}")]
    NegativeAmount(Decimal),
    #[error("max per user must be at least 1")]
    ZeroCap,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Price {
    pub uuid: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub amount: Decimal,
    #[sqlx(try_from = "String")]
    pub vat: VatClass,
    #[sqlx(try_from = "String")]
    pub subscription_type: SubscriptionType,
    pub recurring_payment: bool,
    /// Pay-what-you-want: the charged amount is only known once the
    /// provider has confirmed the checkout.
    pub free_price: bool,
    pub max_per_user: i32,
    pub stock: Option<i32>,
}

impl Price {
    pub fn new(product: &Product, name: impl Into<String>, amount: Decimal) -> Result<Self, PriceError> {
        let price = Self {
            uuid: Uuid::new_v4(),
            product_id: product.uuid,
            name: name.into(),
            amount,
            vat: VatClass::NotApplicable,
            subscription_type: SubscriptionType::NotApplicable,
            recurring_payment: false,
            free_price: false,
            max_per_user: 10,
            stock: None,
        };
        price.validate()?;
        Ok(price)
    }

    pub fn validate(&self) -> Result<(), PriceError> {
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(PriceError::NegativeAmount(self.amount));
        }
        if self.max_per_user < 1 {
            return Err(PriceError::ZeroCap);
        }
        Ok(())
    }

    /// Interval of the provider price, set only for recurring subscriptions.
    pub fn recurring_interval(&self) -> Option<&'static str> {
        if self.recurring_payment {
            self.subscription_type.recurring_interval()
        } else {
            None
        }
    }
}

/// Per-event snapshot of a product.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductSold {
    pub uuid: Uuid,
    pub event_id: Option<Uuid>,
    pub product_id: Uuid,
    #[sqlx(try_from = "String")]
    pub category: CategoryCode,
    pub external_product_id: Option<String>,
}

impl ProductSold {
    pub fn snapshot(product: &Product, event_id: Option<Uuid>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            event_id,
            product_id: product.uuid,
            category: product.category,
            external_product_id: None,
        }
    }

    /// Category of the snapshot, or of the template product when the
    /// snapshot was left unset.
    pub fn resolved_category(&self, product: &Product) -> CategoryCode {
        if self.category == CategoryCode::None {
            product.category
        } else {
            self.category
        }
    }

    /// Name shown on the provider checkout page.
    pub fn nickname(&self, product: &Product, event: Option<&Event>) -> String {
        match (product.category, event) {
            (CategoryCode::Billet, Some(event)) => format!(
                "{} {} - {}",
                event.name,
                event.start_time.format("%D"),
                product.name
            ),
            _ => product.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("price snapshot {0} is frozen once published to the payment provider")]
pub struct SnapshotFrozen(pub Uuid);

/// Per-event snapshot of a price.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriceSold {
    pub uuid: Uuid,
    pub product_sold_id: Uuid,
    pub price_id: Uuid,
    pub external_price_id: Option<String>,
    pub qty_sold: i32,
    pub amount: Decimal,
    pub gift: Option<Decimal>,
}

impl PriceSold {
    pub fn snapshot(product_sold: &ProductSold, price: &Price) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            product_sold_id: product_sold.uuid,
            price_id: price.uuid,
            external_price_id: None,
            qty_sold: 0,
            amount: price.amount,
            gift: None,
        }
    }

    pub fn reprice(&mut self, amount: Decimal) -> Result<(), SnapshotFrozen> {
        if self.external_price_id.is_some() {
            return Err(SnapshotFrozen(self.uuid));
        }
        self.amount = amount;
        Ok(())
    }

    pub fn record_sale(&mut self, qty: i32) {
        self.qty_sold += qty;
    }

    pub fn total(&self) -> Decimal {
        self.amount * Decimal::from(self.qty_sold)
    }
}
