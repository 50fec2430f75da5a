use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

use crate::config::TenantError;
use crate::models::ticket::ScanRejection;
use crate::sales::{CatalogError, CheckoutError, ScanError};
use crate::services::ProviderError;
use crate::store::StoreError;
use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ticket already scanned: {0}")]
    AlreadyScanned(String),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::AlreadyScanned(_) => StatusCode::CONFLICT,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::AuthError(_) => "AUTH_ERROR",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::AlreadyScanned(_) => "TICKET_ALREADY_SCANNED",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn log(&self) {
        match self {
            AppError::ValidationError(msg)
            | AppError::AuthError(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::AlreadyScanned(msg) => {
                warn!(code = self.code(), message = %msg, "Request rejected");
            }
            AppError::ExternalServiceError(msg) | AppError::InternalServerError(msg) => {
                error!(error = ?self, message = %msg, "Application error");
            }
            AppError::DatabaseError(e) => {
                error!(error = ?e, "Database error");
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => AppError::NotFound(e.to_string()),
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::Database(e) => AppError::DatabaseError(e),
        }
    }
}

impl From<TenantError> for AppError {
    fn from(e: TenantError) -> Self {
        match e {
            TenantError::Unknown(_) => AppError::NotFound(e.to_string()),
            TenantError::InvalidSchema(_) => AppError::ValidationError(e.to_string()),
            TenantError::Io(_) | TenantError::Parse(_) => AppError::InternalServerError(e.to_string()),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::InvalidSignature => AppError::AuthError(e.to_string()),
            ProviderError::NotFound(_) => AppError::NotFound(e.to_string()),
            ProviderError::MissingKey(_) => AppError::InternalServerError(e.to_string()),
            ProviderError::Request(_) | ProviderError::Api { .. } | ProviderError::Timeout => {
                AppError::ExternalServiceError(e.to_string())
            }
        }
    }
}

impl From<CatalogError> for AppError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Store(e) => e.into(),
            CatalogError::Provider(e) => e.into(),
            CatalogError::Frozen(e) => AppError::Conflict(e.to_string()),
        }
    }
}

impl From<CheckoutError> for AppError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::Store(e) => e.into(),
            CheckoutError::Provider(e) => e.into(),
            CheckoutError::Catalog(e) => e.into(),
            CheckoutError::Transition(e) => AppError::Conflict(e.to_string()),
            CheckoutError::Conflict(_) | CheckoutError::EventFull(_) => AppError::Conflict(e.to_string()),
            CheckoutError::EmptyCart
            | CheckoutError::OverLimit { .. }
            | CheckoutError::TooManyTickets { .. }
            | CheckoutError::RecurringMixed => {
                AppError::ValidationError(e.to_string())
            }
        }
    }
}

impl From<ScanError> for AppError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Store(e) => e.into(),
            ScanError::Rejected(rejection) => match rejection {
                ScanRejection::AlreadyScanned(_) => AppError::AlreadyScanned(rejection.to_string()),
                ScanRejection::NotActive { .. } => AppError::Conflict(rejection.to_string()),
                ScanRejection::NotFound(_) => AppError::NotFound(rejection.to_string()),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        self.log();

        // Only expose high-level message to the client
        let public_message = match &self {
            AppError::ValidationError(msg)
            | AppError::AuthError(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::AlreadyScanned(msg) => msg.clone(),
            AppError::ExternalServiceError(_) => "An upstream service is unavailable".to_string(),
            AppError::InternalServerError(_) => "Internal server error".to_string(),
            AppError::DatabaseError(_) => "A database error occurred".to_string(),
        };

        error_response(code, public_message, None, status)
    }
}
