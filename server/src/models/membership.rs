use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::catalog::SubscriptionType;
coded_enum! {
    pub enum MembershipStatus: "membership status" {
        Once => "O",
        Auto => "A",
        Canceled => "C",
    }
}

/// A user's adhesion to a subscription price. Unique per (user, price).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub uuid: Uuid,
    pub user_id: Uuid,
    pub price_id: Option<Uuid>,
    pub subscription_id: Option<String>,
    pub last_invoice_id: Option<String>,
    pub first_contribution: Option<NaiveDate>,
    pub last_contribution: Option<NaiveDate>,
    pub contribution_value: Option<Decimal>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub pseudo: Option<String>,
    pub newsletter: bool,
    #[sqlx(try_from = "String")]
    pub status: MembershipStatus,
    /// Payment attempts that contributed to this membership, oldest first.
    pub payment_ids: Vec<Uuid>,
    pub ledger_transaction_id: Option<Uuid>,
    /// Line item whose ledger transaction is recorded above.
    pub ledger_reference: Option<Uuid>,
    pub date_added: DateTime<Utc>,
    pub last_action: DateTime<Utc>,
}

impl Membership {
    pub fn new(user_id: Uuid, price_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            user_id,
            price_id,
            subscription_id: None,
            last_invoice_id: None,
            first_contribution: None,
            last_contribution: None,
            contribution_value: None,
            first_name: None,
            last_name: None,
            pseudo: None,
            newsletter: true,
            status: MembershipStatus::Once,
            payment_ids: Vec::new(),
            ledger_transaction_id: None,
            ledger_reference: None,
            date_added: now,
            last_action: now,
        }
    }

    pub fn contribute(&mut self, value: Decimal, on: NaiveDate) {
        self.contribution_value = Some(value);
        if self.first_contribution.is_none() {
            self.first_contribution = Some(on);
        }
        self.last_contribution = Some(on);
    }

    /// Appends a payment attempt to the history. Returns false if it was
    /// already recorded.
    pub fn record_payment(&mut self, payment_id: Uuid) -> bool {
        if self.payment_ids.contains(&payment_id) {
            return false;
        }
        self.payment_ids.push(payment_id);
        true
    }

    pub fn deadline(&self, subscription: SubscriptionType) -> Option<NaiveDate> {
        self.last_contribution
            .and_then(|last| subscription.deadline(last))
    }

    pub fn is_valid(&self, subscription: SubscriptionType, today: NaiveDate) -> bool {
        self.deadline(subscription)
            .map(|deadline| today < deadline)
            .unwrap_or(false)
    }

    pub fn member_name(&self) -> String {
        if let Some(pseudo) = &self.pseudo {
            return pseudo.clone();
        }
        format!(
            "{} {}",
            self.last_name.as_deref().unwrap_or_default(),
            self.first_name.as_deref().unwrap_or_default()
        )
        .trim()
        .to_string()
    }
}
