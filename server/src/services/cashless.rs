//! Point-of-sale accounting service that mirrors online sales.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::http_client;
use crate::config::TenantContext;

#[derive(Debug, Error)]
pub enum CashlessError {
    #[error("no cashless server configured for tenant {0}")]
    NotConfigured(String),
    #[error("cashless request failed: {0}")]
    Request(String),
    #[error("cashless server returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("cashless call timed out")]
    Timeout,
}

/// One paid line item as the cashless server books it. `reference` is the
/// line item id; the server ignores a second record with the same one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub reference: Uuid,
    pub order: Uuid,
    pub email: String,
    pub product: String,
    pub price: String,
    pub qty: i32,
    /// Cents.
    pub amount: i64,
    pub category: String,
}

#[async_trait]
pub trait CashlessClient: Send + Sync {
    async fn record_sale(&self, tenant: &TenantContext, sale: &SaleRecord) -> Result<(), CashlessError>;
}

#[derive(Clone)]
pub struct HttpCashlessClient {
    client: Client,
}

impl HttpCashlessClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl CashlessClient for HttpCashlessClient {
    async fn record_sale(&self, tenant: &TenantContext, sale: &SaleRecord) -> Result<(), CashlessError> {
        let remote = tenant
            .config()
            .cashless
            .as_ref()
            .ok_or_else(|| CashlessError::NotConfigured(tenant.slug().to_string()))?;

        let response = self
            .client
            .post(format!("{}/api/billetterie_endpoint", remote.url.trim_end_matches('/')))
            .header("Authorization", format!("Api-Key {}", remote.key))
            .header("Idempotency-Key", sale.reference.to_string())
            .json(sale)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CashlessError::Timeout
                } else {
                    CashlessError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(tenant = %tenant.slug(), reference = %sale.reference, "Sale recorded by cashless server");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(CashlessError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}
