//! Fire-and-forget collaborators: newsletter publication, invoice mail and
//! outgoing webhooks. Failures are reported to the caller, which only logs
//! them.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::http_client;
use crate::config::TenantContext;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0} is not configured for this tenant")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Request(String),
    #[error("remote returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("call timed out")]
    Timeout,
}

fn request_error(e: reqwest::Error) -> NotifyError {
    if e.is_timeout() {
        NotifyError::Timeout
    } else {
        NotifyError::Request(e.to_string())
    }
}

/// Member published to the newsletter service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub membership: Uuid,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceNotice {
    pub membership: Uuid,
    pub email: String,
    pub member_name: String,
    pub organisation: String,
    pub amount: Decimal,
    pub invoice_number: String,
    pub date: NaiveDate,
}

#[async_trait]
pub trait ContentPublisher: Send + Sync {
    async fn publish_member(&self, tenant: &TenantContext, subscriber: &Subscriber) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait InvoiceMailer: Send + Sync {
    async fn send_invoice(&self, tenant: &TenantContext, notice: &InvoiceNotice) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// Posts `payload` to `url` and returns the response body as text.
    async fn post(&self, url: &str, payload: &Value) -> Result<String, NotifyError>;
}

async fn checked(response: reqwest::Response) -> Result<String, NotifyError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(body)
    } else {
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Clone)]
pub struct GhostPublisher {
    client: Client,
}

impl GhostPublisher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl ContentPublisher for GhostPublisher {
    async fn publish_member(&self, tenant: &TenantContext, subscriber: &Subscriber) -> Result<(), NotifyError> {
        let remote = tenant
            .config()
            .content
            .as_ref()
            .ok_or(NotifyError::NotConfigured("content service"))?;
        let response = self
            .client
            .post(format!("{}/ghost/api/admin/members/", remote.url.trim_end_matches('/')))
            .header("Authorization", format!("Ghost {}", remote.key))
            .json(&json!({
                "members": [{"email": subscriber.email, "name": subscriber.name}]
            }))
            .send()
            .await
            .map_err(request_error)?;
        checked(response).await.map(|_| ())
    }
}

#[derive(Clone)]
pub struct HttpInvoiceMailer {
    client: Client,
}

impl HttpInvoiceMailer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl InvoiceMailer for HttpInvoiceMailer {
    async fn send_invoice(&self, tenant: &TenantContext, notice: &InvoiceNotice) -> Result<(), NotifyError> {
        let relay = tenant
            .config()
            .invoice
            .as_ref()
            .ok_or(NotifyError::NotConfigured("invoice relay"))?;
        let response = self
            .client
            .post(&relay.url)
            .header("api-key", &relay.key)
            .json(&json!({
                "templateId": relay.template_id,
                "to": [{"email": notice.email, "name": notice.member_name}],
                "params": notice,
            }))
            .send()
            .await
            .map_err(request_error)?;
        checked(response).await.map(|_| ())
    }
}

#[derive(Clone)]
pub struct HttpWebhookSender {
    client: Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn post(&self, url: &str, payload: &Value) -> Result<String, NotifyError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(request_error)?;
        checked(response).await
    }
}
