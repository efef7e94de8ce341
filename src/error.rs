use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for engine and API failures.
///
/// Every variant belongs to one [`ErrorKind`] and maps to a specific HTTP status
/// code. Responses carry `error`, `kind`, `details` and `retryable` fields so a
/// client can tell "fix your input" apart from "try again later".
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed")]
    Unauthorized,

    #[error("Bearer token required")]
    MissingAuth,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid range: {reason}")]
    InvalidRange { reason: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cannot {action} a reservation that is {from}")]
    InvalidTransition { action: &'static str, from: String },

    #[error("Inconsistent reservation lifecycle: {0}")]
    InvalidLifecycle(String),

    #[error("Payment gateway unavailable: {0}")]
    PaymentUnavailable(String),

    #[error("Payment still processing: {0}")]
    PaymentProcessing(String),

    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    #[error("Payment amount mismatch: expected {expected} cents, intent carries {actual} cents")]
    AmountMismatch { expected: i64, actual: i64 },

    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    #[error("Vehicle not found: {0}")]
    VehicleNotFound(Uuid),

    #[error("Payment intent not found: {0}")]
    IntentNotFound(String),

    #[error("Upload session not found")]
    SessionNotFound,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    State,
    Payment,
    NotFound,
    Auth,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::State => "state",
            ErrorKind::Payment => "payment",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Auth => "auth",
            ErrorKind::Internal => "internal",
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Unauthorized | AppError::MissingAuth | AppError::Forbidden(_) => ErrorKind::Auth,
            AppError::InvalidInput(_) | AppError::InvalidRange { .. } | AppError::Uuid(_) => {
                ErrorKind::Validation
            }
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::InvalidTransition { .. } => ErrorKind::State,
            AppError::PaymentUnavailable(_)
            | AppError::PaymentProcessing(_)
            | AppError::PaymentDeclined(_)
            | AppError::AmountMismatch { .. } => ErrorKind::Payment,
            AppError::ReservationNotFound(_)
            | AppError::VehicleNotFound(_)
            | AppError::IntentNotFound(_)
            | AppError::SessionNotFound => ErrorKind::NotFound,
            AppError::InvalidLifecycle(_)
            | AppError::Database(_)
            | AppError::Json(_)
            | AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether repeating the same request later may succeed without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::PaymentUnavailable(_) | AppError::PaymentProcessing(_)
        )
    }

    pub fn invalid_transition(action: &'static str, from: impl ToString) -> Self {
        AppError::InvalidTransition {
            action,
            from: from.to_string(),
        }
    }

    pub fn invalid_range(reason: impl Into<String>) -> Self {
        AppError::InvalidRange {
            reason: reason.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication failed"),
            AppError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authorization header required"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "Invalid input"),
            AppError::InvalidRange { .. } => (StatusCode::BAD_REQUEST, "Invalid range"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            AppError::InvalidTransition { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "Transition not allowed")
            }
            AppError::InvalidLifecycle(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Inconsistent reservation state")
            }
            AppError::PaymentUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Payment gateway unavailable")
            }
            AppError::PaymentProcessing(_) => (StatusCode::GATEWAY_TIMEOUT, "Check payment status"),
            AppError::PaymentDeclined(_) => (StatusCode::PAYMENT_REQUIRED, "Payment declined"),
            AppError::AmountMismatch { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "Payment amount mismatch")
            }
            AppError::ReservationNotFound(_) => (StatusCode::NOT_FOUND, "Reservation not found"),
            AppError::VehicleNotFound(_) => (StatusCode::NOT_FOUND, "Vehicle not found"),
            AppError::IntentNotFound(_) => (StatusCode::NOT_FOUND, "Payment intent not found"),
            AppError::SessionNotFound => (StatusCode::NOT_FOUND, "Session not found"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "JSON parsing error"),
            AppError::Uuid(_) => (StatusCode::BAD_REQUEST, "Invalid UUID"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let mut body = json!({
            "error": error_message,
            "kind": self.kind().as_str(),
            "details": self.to_string(),
            "retryable": self.is_retryable(),
        });
        if matches!(self, AppError::PaymentProcessing(_) | AppError::PaymentUnavailable(_)) {
            body["action"] = json!("check_payment_status");
        }

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
