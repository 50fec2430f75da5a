//! Clients for the collaborators the sale lifecycle talks to.
//!
//! Each remote service sits behind a trait so the pipeline can be exercised
//! with in-process fakes. Every outgoing call is bounded by its own timeout.

use std::future::Future;
use std::time::Duration;

pub mod cashless;
pub mod ledger;
pub mod notify;
pub mod payment_provider;
pub mod tasks;

pub use cashless::{CashlessClient, CashlessError, HttpCashlessClient, SaleRecord};
pub use ledger::{FedowClient, LedgerBridge, LedgerClient, LedgerError, MembershipTransaction};
pub use notify::{
    ContentPublisher, GhostPublisher, HttpInvoiceMailer, HttpWebhookSender, InvoiceMailer, InvoiceNotice,
    NotifyError, Subscriber, WebhookSender,
};
pub use payment_provider::{
    CheckoutLine, CheckoutSession, NewCheckout, NewPrice, PaymentProvider, ProviderError,
    ProviderSubscription, SessionPaymentStatus, StripeClient,
};
pub use tasks::{Notifiers, Task, TaskQueue, TaskWorker};

/// Runs `call` under `limit`. `None` means the deadline passed.
pub async fn timed<F, T>(limit: Duration, call: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, call).await.ok()
}

/// HTTP client shared by the remote service implementations.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default http client");
            reqwest::Client::new()
        })
}
