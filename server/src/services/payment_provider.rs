//! Hosted-checkout payment provider.
//!
//! [`StripeClient`] speaks the provider's form-encoded REST API. Connected
//! accounts are addressed with the `Stripe-Account` header taken from the
//! tenant configuration.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use super::{http_client, timed};
use crate::config::TenantContext;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew on signed webhook deliveries, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no payment api key configured for tenant {0}")]
    MissingKey(String),

    #[error("provider object {0} not found")]
    NotFound(String),

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider call timed out")]
    Timeout,

    #[error("invalid webhook signature")]
    InvalidSignature,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Request(_) | ProviderError::Timeout => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub payment_status: SessionPaymentStatus,
    #[serde(default)]
    pub mode: Option<String>,
    /// Charged amount in cents.
    #[serde(default)]
    pub amount_total: Option<i64>,
    /// Unix timestamp.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == SessionPaymentStatus::Paid
    }

    pub fn is_subscription(&self) -> bool {
        self.mode.as_deref() == Some("subscription")
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub latest_invoice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPrice {
    pub product: String,
    pub unit_amount: i64,
    pub currency: String,
    pub nickname: String,
    pub recurring_interval: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutLine {
    pub price: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Default)]
pub struct NewCheckout {
    pub lines: Vec<CheckoutLine>,
    pub customer_email: String,
    pub subscription: bool,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_checkout_session(
        &self,
        tenant: &TenantContext,
        session_id: &str,
    ) -> Result<CheckoutSession, ProviderError>;

    async fn retrieve_subscription(
        &self,
        tenant: &TenantContext,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn create_product(
        &self,
        tenant: &TenantContext,
        name: &str,
        image: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// False when the provider no longer knows the product.
    async fn product_exists(&self, tenant: &TenantContext, product_id: &str) -> Result<bool, ProviderError>;

    async fn create_price(&self, tenant: &TenantContext, price: &NewPrice) -> Result<String, ProviderError>;

    async fn create_checkout_session(
        &self,
        tenant: &TenantContext,
        checkout: &NewCheckout,
    ) -> Result<CheckoutSession, ProviderError>;
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    api_base: String,
    timeout: Duration,
}

impl StripeClient {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn request(
        &self,
        tenant: &TenantContext,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = tenant
            .payment_api_key()
            .ok_or_else(|| ProviderError::MissingKey(tenant.slug().to_string()))?;
        let mut builder = self
            .client
            .request(method, format!("{}/v1/{}", self.api_base, path))
            .bearer_auth(key);
        if let Some(account) = tenant.config().connect_account() {
            builder = builder.header("Stripe-Account", account);
        }
        Ok(builder)
    }

    async fn send<T: DeserializeOwned + Send>(
        &self,
        builder: reqwest::RequestBuilder,
        object: &str,
    ) -> Result<T, ProviderError> {
        let call = async {
            let response = builder
                .send()
                .await
                .map_err(|e| ProviderError::Request(e.to_string()))?;

            match response.status() {
                status if status.is_success() => response
                    .json::<T>()
                    .await
                    .map_err(|e| ProviderError::Request(e.to_string())),
                StatusCode::NOT_FOUND => Err(ProviderError::NotFound(object.to_string())),
                status => {
                    let message = response.text().await.unwrap_or_default();
                    Err(ProviderError::Api {
                        status: status.as_u16(),
                        message,
                    })
                }
            }
        };
        timed(self.timeout, call)
            .await
            .unwrap_or(Err(ProviderError::Timeout))
    }
}

fn checkout_form(checkout: &NewCheckout) -> Vec<(String, String)> {
    let mode = if checkout.subscription { "subscription" } else { "payment" };
    let mut form = vec![
        ("mode".to_string(), mode.to_string()),
        ("payment_method_types[0]".to_string(), "card".to_string()),
        ("customer_email".to_string(), checkout.customer_email.clone()),
        ("success_url".to_string(), checkout.success_url.clone()),
        ("cancel_url".to_string(), checkout.cancel_url.clone()),
    ];
    for (i, line) in checkout.lines.iter().enumerate() {
        form.push((format!("line_items[{i}][price]"), line.price.clone()));
        form.push((format!("line_items[{i}][quantity]"), line.quantity.to_string()));
    }
    for (key, value) in &checkout.metadata {
        form.push((format!("metadata[{key}]"), value.clone()));
    }
    form
}

fn price_form(price: &NewPrice) -> Vec<(String, String)> {
    let mut form = vec![
        ("product".to_string(), price.product.clone()),
        ("unit_amount".to_string(), price.unit_amount.to_string()),
        ("currency".to_string(), price.currency.clone()),
        ("nickname".to_string(), price.nickname.clone()),
    ];
    if let Some(interval) = price.recurring_interval {
        form.push(("recurring[interval]".to_string(), interval.to_string()));
    }
    form
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_checkout_session(
        &self,
        tenant: &TenantContext,
        session_id: &str,
    ) -> Result<CheckoutSession, ProviderError> {
        let builder = self.request(tenant, reqwest::Method::GET, &format!("checkout/sessions/{session_id}"))?;
        self.send(builder, session_id).await
    }

    async fn retrieve_subscription(
        &self,
        tenant: &TenantContext,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        let builder = self.request(tenant, reqwest::Method::GET, &format!("subscriptions/{subscription_id}"))?;
        self.send(builder, subscription_id).await
    }

    async fn create_product(
        &self,
        tenant: &TenantContext,
        name: &str,
        image: Option<&str>,
    ) -> Result<String, ProviderError> {
        let mut form = vec![("name".to_string(), name.to_string())];
        if let Some(image) = image {
            form.push(("images[0]".to_string(), image.to_string()));
        }
        let builder = self.request(tenant, reqwest::Method::POST, "products")?.form(&form);
        let created: Created = self.send(builder, name).await?;
        Ok(created.id)
    }

    async fn product_exists(&self, tenant: &TenantContext, product_id: &str) -> Result<bool, ProviderError> {
        let builder = self.request(tenant, reqwest::Method::GET, &format!("products/{product_id}"))?;
        match self.send::<Created>(builder, product_id).await {
            Ok(_) => Ok(true),
            Err(ProviderError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_price(&self, tenant: &TenantContext, price: &NewPrice) -> Result<String, ProviderError> {
        let builder = self
            .request(tenant, reqwest::Method::POST, "prices")?
            .form(&price_form(price));
        let created: Created = self.send(builder, &price.nickname).await?;
        Ok(created.id)
    }

    async fn create_checkout_session(
        &self,
        tenant: &TenantContext,
        checkout: &NewCheckout,
    ) -> Result<CheckoutSession, ProviderError> {
        let builder = self
            .request(tenant, reqwest::Method::POST, "checkout/sessions")?
            .form(&checkout_form(checkout));
        self.send(builder, "checkout session").await
    }
}

/// Checks a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=<hex>]`)
/// against the raw request body.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), ProviderError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(ProviderError::InvalidSignature)?;
    if now.timestamp().abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
        return Err(ProviderError::InvalidSignature);
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ProviderError::InvalidSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(ProviderError::InvalidSignature)
}

#[cfg(test)]
pub(crate) fn sign_webhook(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
