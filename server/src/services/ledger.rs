//! Federated ledger and the bridge that pushes confirmed sales to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::cashless::{CashlessClient, CashlessError, SaleRecord};
use super::{http_client, timed};
use crate::config::TenantContext;
use crate::models::{LedgerAction, TransactionReceipt};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no ledger configured for tenant {0}")]
    NotConfigured(String),

    #[error("ledger request failed: {0}")]
    Network(String),

    #[error("ledger call timed out")]
    Timeout,

    #[error("ledger unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("ledger rejected the transaction ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("ledger returned an invalid receipt: {0}")]
    InvalidReceipt(String),

    #[error("could not encode ledger transaction: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LedgerError {
    /// Network trouble, as opposed to the ledger refusing the transaction.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Network(_) | LedgerError::Timeout | LedgerError::Unavailable { .. }
        )
    }
}

/// Membership contribution as submitted to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipTransaction {
    /// Line item that paid for the contribution. Used as idempotency key.
    pub reference: Uuid,
    pub membership: Uuid,
    pub email: String,
    pub member_name: String,
    /// Cents.
    pub amount: i64,
    pub action: LedgerAction,
    pub subscription_start_datetime: DateTime<Utc>,
    pub payment: Uuid,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn push_membership(
        &self,
        tenant: &TenantContext,
        transaction: &MembershipTransaction,
    ) -> Result<TransactionReceipt, LedgerError>;
}

/// HMAC-SHA256 of `body` under the tenant ledger key, hex encoded.
pub fn sign_body(key: &str, body: &[u8]) -> Result<String, LedgerError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| LedgerError::NotConfigured(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Clone)]
pub struct FedowClient {
    client: Client,
}

impl FedowClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl LedgerClient for FedowClient {
    async fn push_membership(
        &self,
        tenant: &TenantContext,
        transaction: &MembershipTransaction,
    ) -> Result<TransactionReceipt, LedgerError> {
        let remote = tenant
            .config()
            .ledger
            .as_ref()
            .ok_or_else(|| LedgerError::NotConfigured(tenant.slug().to_string()))?;

        let body = serde_json::to_vec(transaction)?;
        let signature = sign_body(&remote.key, &body)?;

        let response = self
            .client
            .post(format!("{}/membership/", remote.url.trim_end_matches('/')))
            .header("Authorization", format!("Api-Key {}", remote.key))
            .header("Signature", signature)
            .header("Idempotency-Key", transaction.reference.to_string())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LedgerError::Timeout
                } else {
                    LedgerError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TransactionReceipt>()
                .await
                .map_err(|e| LedgerError::InvalidReceipt(e.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(LedgerError::Unavailable {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(LedgerError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Pushes confirmed sales to the ledger and the cashless server, each call
/// under its own deadline.
#[derive(Clone)]
pub struct LedgerBridge {
    ledger: Arc<dyn LedgerClient>,
    cashless: Arc<dyn CashlessClient>,
    ledger_timeout: Duration,
    cashless_timeout: Duration,
}

impl LedgerBridge {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        cashless: Arc<dyn CashlessClient>,
        ledger_timeout: Duration,
        cashless_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            cashless,
            ledger_timeout,
            cashless_timeout,
        }
    }

    pub async fn push_membership(
        &self,
        tenant: &TenantContext,
        transaction: &MembershipTransaction,
    ) -> Result<TransactionReceipt, LedgerError> {
        let receipt = timed(self.ledger_timeout, self.ledger.push_membership(tenant, transaction))
            .await
            .unwrap_or(Err(LedgerError::Timeout))?;
        receipt.validate().map_err(LedgerError::InvalidReceipt)?;
        tracing::info!(
            tenant = %tenant.slug(),
            reference = %transaction.reference,
            transaction = %receipt.uuid,
            "Ledger accepted membership transaction"
        );
        Ok(receipt)
    }

    pub async fn forward_sale(&self, tenant: &TenantContext, sale: &SaleRecord) -> Result<(), CashlessError> {
        timed(self.cashless_timeout, self.cashless.record_sale(tenant, sale))
            .await
            .unwrap_or(Err(CashlessError::Timeout))
    }
}
