//! Error types for the faucet service

use crate::ledger::LedgerError;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use drip_common::types::{Address, Amount};
use serde_json::json;
use thiserror::Error;

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Unauthorized: {0} is not the owner")]
    Unauthorized(Address),

    #[error("Only direct callers may request tokens")]
    NotDirectCaller,

    #[error("Faucet is already paused")]
    AlreadyPaused,

    #[error("Faucet is not paused")]
    NotPaused,

    #[error("Faucet is paused")]
    ServiceSuspended,

    #[error("Too soon: try again in {retry_after} seconds")]
    TooSoon { retry_after: u64 },

    #[error("Already funded: balance {balance} is not below the dispense amount")]
    AlreadyFunded { balance: Amount },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid owner: {0}")]
    InvalidOwner(Address),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Rate limit exceeded: try again in {0} seconds")]
    RateLimitExceeded(u64),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Coarse classification used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller lacks standing.
    Authorization,
    /// Operation invalid in the current pause/ownership state.
    Lifecycle,
    /// Expected refusal carrying a retry hint.
    Throttle,
    /// Failure reported by the asset ledger.
    Collaborator,
    /// Malformed or unverifiable request.
    Request,
    Infrastructure,
}

impl FaucetError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FaucetError::Unauthorized(_) | FaucetError::NotDirectCaller => ErrorCategory::Authorization,
            FaucetError::AlreadyPaused | FaucetError::NotPaused | FaucetError::ServiceSuspended => {
                ErrorCategory::Lifecycle
            }
            FaucetError::TooSoon { .. }
            | FaucetError::AlreadyFunded { .. }
            | FaucetError::RateLimitExceeded(_) => ErrorCategory::Throttle,
            FaucetError::Ledger(_) => ErrorCategory::Collaborator,
            FaucetError::InvalidAmount(_)
            | FaucetError::InvalidOwner(_)
            | FaucetError::InvalidAddress(_)
            | FaucetError::InvalidCredential(_) => ErrorCategory::Request,
            FaucetError::DatabaseError(_)
            | FaucetError::ConfigError(_)
            | FaucetError::InternalError(_) => ErrorCategory::Infrastructure,
        }
    }

    /// Stable machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            FaucetError::Unauthorized(_) => "UNAUTHORIZED",
            FaucetError::NotDirectCaller => "NOT_DIRECT_CALLER",
            FaucetError::AlreadyPaused => "ALREADY_PAUSED",
            FaucetError::NotPaused => "NOT_PAUSED",
            FaucetError::ServiceSuspended => "SERVICE_SUSPENDED",
            FaucetError::TooSoon { .. } => "TOO_SOON",
            FaucetError::AlreadyFunded { .. } => "ALREADY_FUNDED",
            FaucetError::Ledger(LedgerError::InsufficientBalance { .. }) => "INSUFFICIENT_FUNDS",
            FaucetError::Ledger(LedgerError::InsufficientAllowance { .. }) => "INSUFFICIENT_ALLOWANCE",
            FaucetError::Ledger(LedgerError::Rpc(_)) => "RPC_ERROR",
            FaucetError::Ledger(LedgerError::Unconfirmed { .. }) => "TRANSFER_UNCONFIRMED",
            FaucetError::Ledger(_) => "LEDGER_ERROR",
            FaucetError::InvalidAmount(_) => "INVALID_AMOUNT",
            FaucetError::InvalidOwner(_) => "INVALID_OWNER",
            FaucetError::InvalidAddress(_) => "INVALID_ADDRESS",
            FaucetError::InvalidCredential(_) => "INVALID_CREDENTIAL",
            FaucetError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            FaucetError::DatabaseError(_) => "DATABASE_ERROR",
            FaucetError::ConfigError(_) => "CONFIG_ERROR",
            FaucetError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FaucetError::Unauthorized(_) | FaucetError::NotDirectCaller => StatusCode::FORBIDDEN,
            FaucetError::AlreadyPaused | FaucetError::NotPaused => StatusCode::CONFLICT,
            FaucetError::ServiceSuspended => StatusCode::SERVICE_UNAVAILABLE,
            FaucetError::TooSoon { .. } | FaucetError::RateLimitExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            FaucetError::AlreadyFunded { .. } => StatusCode::CONFLICT,
            FaucetError::Ledger(LedgerError::InsufficientBalance { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FaucetError::Ledger(LedgerError::InsufficientAllowance { .. }) => StatusCode::CONFLICT,
            FaucetError::Ledger(LedgerError::Rpc(_)) => StatusCode::BAD_GATEWAY,
            FaucetError::Ledger(LedgerError::Unconfirmed { .. }) => StatusCode::GATEWAY_TIMEOUT,
            FaucetError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FaucetError::InvalidAmount(_)
            | FaucetError::InvalidOwner(_)
            | FaucetError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            FaucetError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            FaucetError::DatabaseError(_)
            | FaucetError::ConfigError(_)
            | FaucetError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            FaucetError::TooSoon { retry_after } => Some(*retry_after),
            FaucetError::RateLimitExceeded(seconds) => Some(*seconds),
            _ => None,
        }
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();

        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        if let Some(seconds) = retry_after {
            body["retry_after"] = json!(seconds);
        }
        if let FaucetError::AlreadyFunded { balance } = &self {
            body["balance"] = json!(balance.to_string());
        }
        if let FaucetError::Ledger(LedgerError::Unconfirmed { tx_hash, .. }) = &self {
            body["tx_hash"] = json!(tx_hash);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_follow_taxonomy() {
        assert_eq!(
            FaucetError::Unauthorized(Address::ZERO).category(),
            ErrorCategory::Authorization
        );
        assert_eq!(FaucetError::NotDirectCaller.category(), ErrorCategory::Authorization);
        assert_eq!(FaucetError::ServiceSuspended.category(), ErrorCategory::Lifecycle);
        assert_eq!(FaucetError::AlreadyPaused.category(), ErrorCategory::Lifecycle);
        assert_eq!(
            FaucetError::TooSoon { retry_after: 5 }.category(),
            ErrorCategory::Throttle
        );
        assert_eq!(
            FaucetError::AlreadyFunded { balance: 1 }.category(),
            ErrorCategory::Throttle
        );
        assert_eq!(
            FaucetError::from(LedgerError::Rpc("down".into())).category(),
            ErrorCategory::Collaborator
        );
    }

    #[test]
    fn test_too_soon_response_carries_retry_after() {
        let response = FaucetError::TooSoon { retry_after: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }

    #[test]
    fn test_ledger_codes() {
        let err = FaucetError::from(LedgerError::InsufficientBalance {
            holder: Address::ZERO,
            balance: 0,
            needed: 1,
        });
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_unconfirmed_transfer_reports_hash() {
        let err = FaucetError::from(LedgerError::Unconfirmed {
            tx_hash: "0xabc".into(),
            reason: "no receipt after 3 attempts".into(),
        });
        assert_eq!(err.code(), "TRANSFER_UNCONFIRMED");
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.category(), ErrorCategory::Collaborator);
    }
}
