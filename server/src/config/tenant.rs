//! Per-tenant settings.
//!
//! Tenant resolution happens outside the core: whoever receives a request
//! picks the tenant (here, the `X-Tenant` header) and hands a
//! [`TenantContext`] to the store and the services.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("invalid schema name '{0}'")]
    InvalidSchema(String),
    #[error("unknown tenant '{0}'")]
    Unknown(String),
    #[error("cannot read tenants file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse tenants file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteService {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceRelay {
    pub url: String,
    pub key: String,
    pub template_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSettings {
    pub api_key: Option<String>,
    pub test_api_key: Option<String>,
    #[serde(default = "default_true")]
    pub test_mode: bool,
    pub connect_account: Option<String>,
    pub connect_account_test: Option<String>,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            test_api_key: None,
            test_mode: true,
            connect_account: None,
            connect_account_test: None,
        }
    }
}

/// What an operator key may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiPermission {
    /// Publish event catalogs.
    Event,
    /// Re-sync and cancel payment attempts.
    Reservation,
    /// Validate tickets at the door.
    Ticket,
}

/// Operator key for the back-office routes. Only the SHA-256 of the key is
/// kept in the tenants file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub name: String,
    pub key_hash: String,
    #[serde(default)]
    pub permissions: Vec<ApiPermission>,
}

impl ApiKey {
    pub fn new(name: impl Into<String>, key: &str, permissions: Vec<ApiPermission>) -> Self {
        Self {
            name: name.into(),
            key_hash: hash_api_key(key),
            permissions,
        }
    }

    pub fn allows(&self, permission: ApiPermission) -> bool {
        self.permissions.contains(&permission)
    }
}

pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "eur".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub slug: String,
    pub schema: String,
    pub organisation: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub payment: PaymentSettings,
    /// Member of the federated ledger network.
    #[serde(default)]
    pub federated: bool,
    pub ledger: Option<RemoteService>,
    pub cashless: Option<RemoteService>,
    pub content: Option<RemoteService>,
    pub invoice: Option<InvoiceRelay>,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
}

impl TenantConfig {
    pub fn new(slug: impl Into<String>, organisation: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            schema: slug.replace('-', "_"),
            slug,
            organisation: organisation.into(),
            currency: default_currency(),
            payment: PaymentSettings::default(),
            federated: false,
            ledger: None,
            cashless: None,
            content: None,
            invoice: None,
            api_keys: Vec::new(),
        }
    }

    /// Operator key matching the presented plaintext key.
    pub fn api_key(&self, presented: &str) -> Option<&ApiKey> {
        let hash = hash_api_key(presented);
        self.api_keys
            .iter()
            .find(|key| key.key_hash.eq_ignore_ascii_case(&hash))
    }

    pub fn connect_account(&self) -> Option<&str> {
        if self.payment.test_mode {
            self.payment.connect_account_test.as_deref()
        } else {
            self.payment.connect_account.as_deref()
        }
    }

    /// Key used to talk to the payment provider for this tenant.
    ///
    /// Federated tenants with a connected account go through the root
    /// account; others use their own key for the current mode and fall back
    /// to the root key.
    pub fn payment_api_key(&self, root_key: Option<&str>) -> Option<String> {
        if self.federated && self.connect_account().is_some() {
            return root_key.map(str::to_string);
        }
        let own = if self.payment.test_mode {
            self.payment.test_api_key.as_deref()
        } else {
            self.payment.api_key.as_deref()
        };
        match own {
            Some(key) => Some(key.to_string()),
            None => {
                tracing::warn!(tenant = %self.slug, "No payment api key for tenant, using the root key");
                root_key.map(str::to_string)
            }
        }
    }
}

/// Handle on one tenant, passed explicitly through the core.
#[derive(Debug, Clone)]
pub struct TenantContext {
    schema: String,
    config: Arc<TenantConfig>,
    payment_api_key: Option<String>,
}

impl TenantContext {
    pub fn new(config: Arc<TenantConfig>, root_key: Option<&str>) -> Result<Self, TenantError> {
        let schema = config.schema.clone();
        let valid = !schema.is_empty()
            && schema.len() <= 63
            && schema
                .chars()
                .next()
                .map(|c| c.is_ascii_lowercase() || c == '_')
                .unwrap_or(false)
            && schema
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(TenantError::InvalidSchema(schema));
        }
        let payment_api_key = config.payment_api_key(root_key);
        Ok(Self {
            schema,
            config,
            payment_api_key,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn slug(&self) -> &str {
        &self.config.slug
    }

    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    pub fn payment_api_key(&self) -> Option<&str> {
        self.payment_api_key.as_deref()
    }

    /// Schema-qualified table name.
    pub fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }
}

/// All tenants known to this process.
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: HashMap<String, TenantContext>,
}

impl TenantRegistry {
    pub fn from_configs(
        configs: Vec<TenantConfig>,
        root_key: Option<&str>,
    ) -> Result<Self, TenantError> {
        let mut tenants = HashMap::new();
        for config in configs {
            let context = TenantContext::new(Arc::new(config), root_key)?;
            tenants.insert(context.slug().to_string(), context);
        }
        Ok(Self { tenants })
    }

    pub fn load(path: &Path, root_key: Option<&str>) -> Result<Self, TenantError> {
        let raw = std::fs::read_to_string(path)?;
        let configs: Vec<TenantConfig> = serde_json::from_str(&raw)?;
        let registry = Self::from_configs(configs, root_key)?;
        tracing::info!(count = registry.tenants.len(), "Loaded tenant configurations");
        Ok(registry)
    }

    pub fn resolve(&self, slug: &str) -> Result<TenantContext, TenantError> {
        self.tenants
            .get(slug)
            .cloned()
            .ok_or_else(|| TenantError::Unknown(slug.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TenantContext> {
        self.tenants.values()
    }
}
