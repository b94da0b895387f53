//! Bridge domain errors
//!
//! Every user-facing rejection carries a stable wire code so clients can
//! branch on it, plus a human-readable message with actionable detail
//! (current minimum, fee). Storage faults collapse to `INTERNAL` — no SQL
//! detail ever crosses the API boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use bigdecimal::BigDecimal;
use serde::Serialize;
use thiserror::Error;

use crate::types::TxStatus;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is halted: {reason}")]
    CircuitBreakerOpen { reason: String },

    #[error("identity or address is blocked: {reason}")]
    Blacklisted { reason: String },

    #[error("chain {chain_code} is not supported")]
    UnsupportedChain { chain_code: String },

    #[error("amount is below the {chain_code} minimum of {minimum} (fee {fee})")]
    BelowMinimumAmount {
        chain_code: String,
        minimum: BigDecimal,
        fee: BigDecimal,
    },

    #[error("balance too low: {required} required (amount plus fee)")]
    InsufficientBalance { required: BigDecimal },

    #[error("burn transaction {tx_hash} was already consumed")]
    DuplicateTxHash { tx_hash: String },

    #[error("burn could not be verified: {detail}")]
    BurnNotVerified { detail: String },

    #[error("mint submission failed: {detail}")]
    MintSubmissionFailed { detail: String },

    #[error("illegal state transition from {from} to {to}")]
    InvalidStateTransition { from: TxStatus, to: TxStatus },

    #[error("concurrent update lost, retry the request")]
    StorageConflict,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] eyre::Report),
}

impl BridgeError {
    /// Stable wire code for the API contract. Never change these strings.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            BridgeError::Blacklisted { .. } => "BLACKLISTED",
            BridgeError::UnsupportedChain { .. } => "UNSUPPORTED_CHAIN",
            BridgeError::BelowMinimumAmount { .. } => "BELOW_MINIMUM_AMOUNT",
            BridgeError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            BridgeError::DuplicateTxHash { .. } => "DUPLICATE_TX_HASH",
            BridgeError::BurnNotVerified { .. } => "BURN_NOT_VERIFIED",
            BridgeError::MintSubmissionFailed { .. } => "MINT_SUBMISSION_FAILED",
            BridgeError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            BridgeError::StorageConflict => "STORAGE_CONFLICT",
            BridgeError::InvalidRequest(_) => "INVALID_REQUEST",
            BridgeError::Storage(_) | BridgeError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Blacklisted { .. } => StatusCode::FORBIDDEN,
            BridgeError::UnsupportedChain { .. } => StatusCode::NOT_FOUND,
            BridgeError::BelowMinimumAmount { .. }
            | BridgeError::InsufficientBalance { .. }
            | BridgeError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::DuplicateTxHash { .. } => StatusCode::CONFLICT,
            BridgeError::BurnNotVerified { .. } | BridgeError::MintSubmissionFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            BridgeError::InvalidStateTransition { .. } | BridgeError::StorageConflict => {
                StatusCode::CONFLICT
            }
            BridgeError::Storage(_) | BridgeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn public_message(&self) -> String {
        match self {
            BridgeError::Storage(_) | BridgeError::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        if matches!(self, BridgeError::Storage(_) | BridgeError::Internal(_)) {
            tracing::error!(error = %self, "internal error serving bridge request");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.public_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            BridgeError::CircuitBreakerOpen {
                reason: "x".into()
            }
            .code(),
            "CIRCUIT_BREAKER_OPEN"
        );
        assert_eq!(
            BridgeError::DuplicateTxHash {
                tx_hash: "0xabc".into()
            }
            .code(),
            "DUPLICATE_TX_HASH"
        );
        assert_eq!(BridgeError::StorageConflict.code(), "STORAGE_CONFLICT");
        assert_eq!(
            BridgeError::Storage(sqlx::Error::PoolClosed).code(),
            "INTERNAL"
        );
    }

    #[test]
    fn test_storage_detail_is_not_exposed() {
        let err = BridgeError::Storage(sqlx::Error::PoolClosed);
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn test_minimum_message_carries_policy() {
        let err = BridgeError::BelowMinimumAmount {
            chain_code: "POLYGON".into(),
            minimum: BigDecimal::from_str("10").unwrap(),
            fee: BigDecimal::from_str("0.5").unwrap(),
        };
        let msg = err.to_string();
        assert!(msg.contains("POLYGON"));
        assert!(msg.contains("10"));
        assert!(msg.contains("0.5"));
    }
}
