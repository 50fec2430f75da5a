use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

coded_enum! {
    /// `Created -> {NotActive | NotScanned} -> Scanned`
    pub enum TicketStatus: "ticket status" {
        Created => "C",
        NotActive => "N",
        NotScanned => "K",
        Scanned => "S",
    }
}

impl TicketStatus {
    /// Counts against event capacity.
    pub fn is_issued(self) -> bool {
        matches!(self, TicketStatus::NotScanned | TicketStatus::Scanned)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanRejection {
    #[error("ticket {0} was already scanned")]
    AlreadyScanned(Uuid),
    #[error("ticket {ticket} is not active ({status:?})")]
    NotActive { ticket: Uuid, status: TicketStatus },
    #[error("ticket {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub uuid: Uuid,
    pub reservation_id: Uuid,
    pub price_sold_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    #[sqlx(try_from = "String")]
    pub status: TicketStatus,
    pub seat: String,
    pub scanned_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn new(
        reservation_id: Uuid,
        price_sold_id: Uuid,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            reservation_id,
            price_sold_id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            status: TicketStatus::Created,
            seat: "L".to_string(),
            scanned_at: None,
        }
    }

    /// Makes the ticket presentable. Returns false when nothing changed.
    pub fn activate(&mut self) -> bool {
        match self.status {
            TicketStatus::Created | TicketStatus::NotActive => {
                self.status = TicketStatus::NotScanned;
                true
            }
            TicketStatus::NotScanned | TicketStatus::Scanned => false,
        }
    }

    /// Withdraws an unpaid ticket. Returns false when nothing changed.
    pub fn deactivate(&mut self) -> bool {
        if self.status == TicketStatus::Created {
            self.status = TicketStatus::NotActive;
            true
        } else {
            false
        }
    }

    /// Single-use scan. A rejected scan leaves the ticket untouched.
    pub fn scan(&mut self, at: DateTime<Utc>) -> Result<(), ScanRejection> {
        match self.status {
            TicketStatus::NotScanned => {
                self.status = TicketStatus::Scanned;
                self.scanned_at = Some(at);
                Ok(())
            }
            TicketStatus::Scanned => Err(ScanRejection::AlreadyScanned(self.uuid)),
            status => Err(ScanRejection::NotActive {
                ticket: self.uuid,
                status,
            }),
        }
    }

    pub fn short_id(&self) -> String {
        self.uuid.to_string().split('-').next().unwrap_or_default().to_string()
    }
}
