//! Rows of the ticketing domain.
//!
//! Status and category columns are stored as the short text codes the
//! historical database uses ("P", "W", "FA", ...). Every coded enum converts
//! from `String` so that rows can be decoded with `#[sqlx(try_from = "String")]`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} code '{code}'")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: String,
}

/// Declares a fieldless enum persisted as a short text code.
macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $code:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "&'static str")]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(self) -> &'static str {
                match self {
                    $( $name::$variant => $code ),+
                }
            }

            pub fn from_code(code: &str) -> Result<Self, $crate::models::UnknownCode> {
                match code {
                    $( $code => Ok($name::$variant), )+
                    other => Err($crate::models::UnknownCode {
                        kind: $kind,
                        code: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::models::UnknownCode;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::from_code(&value)
            }
        }

        impl From<$name> for &'static str {
            fn from(value: $name) -> Self {
                value.code()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.code())
            }
        }
    };
}

pub mod catalog;
pub mod event;
pub mod line_item;
pub mod membership;
pub mod order;
pub mod ticket;
pub mod transaction;
pub mod user;
pub mod webhook;

pub use catalog::{CategoryCode, Price, PriceSold, Product, ProductSold, SubscriptionType, VatClass};
pub use event::Event;
pub use line_item::{LineItem, LineItemStatus};
pub use membership::{Membership, MembershipStatus};
pub use order::{Payment, PaymentSource, PaymentStatus, ProcessingSource, Reservation, ReservationStatus};
pub use ticket::{Ticket, TicketStatus};
pub use transaction::{LedgerAction, TransactionReceipt};
pub use user::User;
pub use webhook::{Webhook, WebhookEvent};
