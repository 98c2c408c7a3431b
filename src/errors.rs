use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error body returned to the HTTP layer.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Unprocessable Entity")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error kind
    pub kind: ErrorKind,
    /// Whether the caller may retry the same request
    pub retryable: bool,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

/// Coarse classification of every failure the core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input shape; the caller's fault, never retried.
    Validation,
    /// A business rule rejected the request; surfaced verbatim, not retried.
    BusinessRule,
    /// Lost an optimistic concurrency race; retried internally, then surfaced as "try again".
    Concurrency,
    /// Infrastructure failure; surfaced as an opaque internal error.
    System,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cart is empty: {0}")]
    EmptyCart(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid coupon: {0}")]
    InvalidCoupon(String),

    #[error("Coupon usage limit reached: {0}")]
    CouponUsageExceeded(String),

    #[error("Minimum spend not met: {0}")]
    MinSpendNotMet(String),

    #[error("Unsupported coupon: {0}")]
    UnsupportedCoupon(String),

    #[error("Concurrent modification of {0}, please try again")]
    ConcurrentModification(Uuid),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Classifies the error according to the core's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_) => ErrorKind::Validation,
            Self::NotFound(_)
            | Self::InvalidStatus(_)
            | Self::Forbidden(_)
            | Self::Conflict(_)
            | Self::EmptyCart(_)
            | Self::InsufficientStock(_)
            | Self::InvalidCoupon(_)
            | Self::CouponUsageExceeded(_)
            | Self::MinSpendNotMet(_)
            | Self::UnsupportedCoupon(_) => ErrorKind::BusinessRule,
            Self::ConcurrentModification(_) => ErrorKind::Concurrency,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => ErrorKind::System,
        }
    }

    /// Whether the message may be shown to the end user as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::BusinessRule | ErrorKind::Concurrency
        )
    }

    /// Only lost optimistic races are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::InvalidStatus(_) | Self::ConcurrentModification(_) => {
                StatusCode::CONFLICT
            }
            Self::EmptyCart(_)
            | Self::InsufficientStock(_)
            | Self::InvalidCoupon(_)
            | Self::CouponUsageExceeded(_)
            | Self::MinSpendNotMet(_)
            | Self::UnsupportedCoupon(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// System errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.kind() == ErrorKind::System {
            tracing::error!(error = %self, "request failed with system error");
        }

        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            kind: self.kind(),
            retryable: self.is_retryable(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
