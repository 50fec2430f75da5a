use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::config::{ApiKey, ApiPermission, TenantContext};
use crate::routes::AppState;
use crate::utils::error::AppError;

pub const TENANT_HEADER: &str = "x-tenant";
const API_KEY_SCHEME: &str = "Api-Key ";

/// Tenant named by the `X-Tenant` header.
pub struct Tenant(pub TenantContext);

#[async_trait]
impl FromRequestParts<AppState> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let slug = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|slug| !slug.is_empty())
            .ok_or_else(|| AppError::ValidationError("Missing X-Tenant header".to_string()))?;
        Ok(Tenant(state.tenants.resolve(slug)?))
    }
}

/// Back-office caller: the tenant plus the key sent as
/// `Authorization: Api-Key <key>`.
pub struct Operator {
    pub tenant: TenantContext,
    pub key: ApiKey,
}

impl Operator {
    pub fn require(&self, permission: ApiPermission) -> Result<(), AppError> {
        if self.key.allows(permission) {
            return Ok(());
        }
        Err(AppError::Forbidden(format!(
            "API key '{}' lacks the {:?} permission",
            self.key.name, permission
        )))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Tenant(tenant) = Tenant::from_request_parts(parts, state).await?;
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(API_KEY_SCHEME))
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| AppError::AuthError("Missing API key".to_string()))?;
        let key = tenant
            .config()
            .api_key(presented)
            .cloned()
            .ok_or_else(|| AppError::AuthError("Invalid API key".to_string()))?;
        tracing::debug!(tenant = %tenant.slug(), key = %key.name, "Operator authenticated");
        Ok(Operator { tenant, key })
    }
}
