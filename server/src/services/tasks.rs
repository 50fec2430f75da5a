//! Deferred side effects.
//!
//! The pipeline enqueues work that must not hold up a payment confirmation.
//! A single worker drains the queue and runs each task on its own tokio task.
//! Cashless sales and outgoing webhooks are retried with exponential backoff
//! up to a fixed number of attempts; mail and newsletter calls are tried once.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::cashless::SaleRecord;
use super::ledger::LedgerBridge;
use super::notify::{ContentPublisher, InvoiceMailer, InvoiceNotice, Subscriber, WebhookSender};
use super::timed;
use crate::config::TenantContext;
use crate::models::Webhook;
use crate::store::Store;

#[derive(Debug, Clone)]
pub enum Task {
    InvoiceEmail {
        tenant: TenantContext,
        notice: InvoiceNotice,
    },
    CashlessSale {
        tenant: TenantContext,
        sale: SaleRecord,
    },
    PublishMember {
        tenant: TenantContext,
        subscriber: Subscriber,
    },
    Webhook {
        tenant: TenantContext,
        webhook: Webhook,
        payload: Value,
    },
}

impl Task {
    fn kind(&self) -> &'static str {
        match self {
            Task::InvoiceEmail { .. } => "invoice_email",
            Task::CashlessSale { .. } => "cashless_sale",
            Task::PublishMember { .. } => "publish_member",
            Task::Webhook { .. } => "webhook",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never fails the caller; a closed queue is logged and the task dropped.
    pub fn enqueue(&self, task: Task) {
        let kind = task.kind();
        if self.tx.send(task).is_err() {
            tracing::error!(task = kind, "Task queue closed, dropping task");
        } else {
            tracing::debug!(task = kind, "Task queued");
        }
    }
}

#[derive(Clone)]
pub struct Notifiers {
    pub content: Arc<dyn ContentPublisher>,
    pub invoices: Arc<dyn InvoiceMailer>,
    pub webhooks: Arc<dyn WebhookSender>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct TaskWorker {
    store: Arc<dyn Store>,
    bridge: LedgerBridge,
    notifiers: Notifiers,
    max_attempts: u32,
    retry_base: Duration,
}

impl TaskWorker {
    pub fn new(
        store: Arc<dyn Store>,
        bridge: LedgerBridge,
        notifiers: Notifiers,
        max_attempts: u32,
        retry_base: Duration,
    ) -> Self {
        Self {
            store,
            bridge,
            notifiers,
            max_attempts: max_attempts.max(1),
            retry_base,
        }
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Task>) {
        tracing::info!("Task worker started");
        while let Some(task) = rx.recv().await {
            let worker = self.clone();
            tokio::spawn(async move { worker.handle(task).await });
        }
        tracing::info!("Task worker stopped");
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    pub async fn handle(&self, task: Task) {
        match task {
            Task::InvoiceEmail { tenant, notice } => {
                let sent = timed(self.notifiers.timeout, self.notifiers.invoices.send_invoice(&tenant, &notice)).await;
                match sent {
                    Some(Ok(())) => {
                        tracing::info!(tenant = %tenant.slug(), membership = %notice.membership, "Invoice mail sent")
                    }
                    Some(Err(e)) => {
                        tracing::error!(tenant = %tenant.slug(), membership = %notice.membership, error = %e, "Invoice mail failed")
                    }
                    None => {
                        tracing::error!(tenant = %tenant.slug(), membership = %notice.membership, "Invoice mail timed out")
                    }
                }
            }
            Task::PublishMember { tenant, subscriber } => {
                let published =
                    timed(self.notifiers.timeout, self.notifiers.content.publish_member(&tenant, &subscriber)).await;
                match published {
                    Some(Ok(())) => {
                        tracing::info!(tenant = %tenant.slug(), membership = %subscriber.membership, "Member published")
                    }
                    Some(Err(e)) => {
                        tracing::warn!(tenant = %tenant.slug(), membership = %subscriber.membership, error = %e, "Member publication failed")
                    }
                    None => {
                        tracing::warn!(tenant = %tenant.slug(), membership = %subscriber.membership, "Member publication timed out")
                    }
                }
            }
            Task::CashlessSale { tenant, sale } => self.forward_sale(&tenant, &sale).await,
            Task::Webhook {
                tenant,
                webhook,
                payload,
            } => self.deliver_webhook(&tenant, &webhook, &payload).await,
        }
    }

    async fn forward_sale(&self, tenant: &TenantContext, sale: &SaleRecord) {
        for attempt in 1..=self.max_attempts {
            match self.bridge.forward_sale(tenant, sale).await {
                Ok(()) => return,
                Err(e) if attempt < self.max_attempts => {
                    tracing::warn!(tenant = %tenant.slug(), reference = %sale.reference, attempt, error = %e, "Cashless sale failed, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => {
                    tracing::error!(tenant = %tenant.slug(), reference = %sale.reference, attempt, error = %e, "Cashless sale abandoned");
                }
            }
        }
    }

    /// Posts to the webhook target, keeping the last outcome in
    /// `last_response` whether it succeeded or not.
    async fn deliver_webhook(&self, tenant: &TenantContext, webhook: &Webhook, payload: &Value) {
        for attempt in 1..=self.max_attempts {
            let outcome = timed(self.notifiers.timeout, self.notifiers.webhooks.post(&webhook.url, payload))
                .await
                .unwrap_or(Err(super::NotifyError::Timeout));
            let (response, done) = match outcome {
                Ok(body) => (body, true),
                Err(e) => (e.to_string(), attempt == self.max_attempts),
            };
            if let Err(e) = self.store.record_webhook_response(tenant, webhook.uuid, &response).await {
                tracing::error!(webhook = %webhook.uuid, error = %e, "Could not record webhook response");
            }
            if done {
                tracing::info!(webhook = %webhook.uuid, url = %webhook.url, attempt, "Webhook delivery finished");
                return;
            }
            tracing::warn!(webhook = %webhook.uuid, url = %webhook.url, attempt, error = %response, "Webhook delivery failed, retrying");
            tokio::time::sleep(self.backoff(attempt)).await;
        }
    }
}
