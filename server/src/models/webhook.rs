use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

coded_enum! {
    pub enum WebhookEvent: "webhook event" {
        ReservationValidated => "RV",
    }
}

/// Outgoing notification registered by an operator.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Webhook {
    pub uuid: Uuid,
    pub active: bool,
    pub url: String,
    #[sqlx(try_from = "String")]
    pub event: WebhookEvent,
    pub last_response: Option<String>,
}

impl Webhook {
    pub fn new(url: impl Into<String>, event: WebhookEvent) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            active: true,
            url: url.into(),
            event,
            last_response: None,
        }
    }
}
