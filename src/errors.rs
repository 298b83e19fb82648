//! Error types for the ledger and settlement engines
//!
//! Every user-visible failure carries a short reason string plus a
//! machine-checkable [`ErrorKind`]. Monetary failures are always raised before
//! any write is committed.

use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-checkable classification of a [`LedgerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InsufficientFunds,
    Conflict,
    RoundInProgress,
    SlotClosedOrInvalid,
    PoolUnsafe,
    ConfigurationMissing,
    DuplicateRound,
    RoundNotFound,
    WalletNotFound,
    InvalidRequest,
    Storage,
    Serialization,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::RoundInProgress => "ROUND_IN_PROGRESS",
            ErrorKind::SlotClosedOrInvalid => "SLOT_CLOSED_OR_INVALID",
            ErrorKind::PoolUnsafe => "POOL_UNSAFE",
            ErrorKind::ConfigurationMissing => "CONFIGURATION_MISSING",
            ErrorKind::DuplicateRound => "DUPLICATE_ROUND",
            ErrorKind::RoundNotFound => "ROUND_NOT_FOUND",
            ErrorKind::WalletNotFound => "WALLET_NOT_FOUND",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Storage => "STORAGE",
            ErrorKind::Serialization => "SERIALIZATION",
            ErrorKind::Configuration => "CONFIGURATION",
        };
        f.write_str(name)
    }
}

/// Root error type for all ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// No mutation was performed.
    #[error("Insufficient funds in {balance} for {user_id}: available {available}, required {required}")]
    InsufficientFunds {
        user_id: String,
        balance: String,
        available: Amount,
        required: Amount,
    },

    /// Transient write conflict; the caller may retry the whole request.
    #[error("Write conflict after {attempts} attempts: {reason}")]
    Conflict { attempts: u32, reason: String },

    #[error("Another round is in progress for {0}")]
    RoundInProgress(String),

    #[error("Lottery slot {slot_id} is closed or invalid: {reason}")]
    SlotClosedOrInvalid { slot_id: String, reason: String },

    /// Internal only. Settlement turns this into a forced loss.
    #[error("Payout of {0} exceeds the safe pool")]
    PoolUnsafe(Amount),

    #[error("Configuration missing: {0}, using default")]
    ConfigurationMissing(String),

    #[error("Round {0} was already settled")]
    DuplicateRound(String),

    #[error("Round {0} not found")]
    RoundNotFound(String),

    #[error("Wallet not found for {0}")]
    WalletNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    Configuration {
        field: String,
        value: String,
        reason: String,
    },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::Conflict { .. } => ErrorKind::Conflict,
            LedgerError::RoundInProgress(_) => ErrorKind::RoundInProgress,
            LedgerError::SlotClosedOrInvalid { .. } => ErrorKind::SlotClosedOrInvalid,
            LedgerError::PoolUnsafe(_) => ErrorKind::PoolUnsafe,
            LedgerError::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            LedgerError::DuplicateRound(_) => ErrorKind::DuplicateRound,
            LedgerError::RoundNotFound(_) => ErrorKind::RoundNotFound,
            LedgerError::WalletNotFound(_) => ErrorKind::WalletNotFound,
            LedgerError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            LedgerError::Storage(_) => ErrorKind::Storage,
            LedgerError::Serialization(_) => ErrorKind::Serialization,
            LedgerError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Whether the caller can retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::RoundInProgress)
    }

    pub fn slot_closed(slot_id: impl Into<String>, reason: impl Into<String>) -> Self {
        LedgerError::SlotClosedOrInvalid {
            slot_id: slot_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        LedgerError::InvalidRequest(msg.into())
    }

    pub fn config(field: &str, value: impl ToString, reason: &str) -> Self {
        LedgerError::Configuration {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Serializable error body handed to whatever transport sits in front of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&LedgerError> for ErrorBody {
    fn from(e: &LedgerError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

// External error conversions
impl From<rocksdb::Error> for LedgerError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TimedOut | rocksdb::ErrorKind::TryAgain => {
                LedgerError::Conflict {
                    attempts: 1,
                    reason: e.to_string(),
                }
            }
            _ => LedgerError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

// Convenience type alias for Results
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_reason() {
        let err = LedgerError::InsufficientFunds {
            user_id: "alice".to_string(),
            balance: "game".to_string(),
            available: Amount::units(5),
            required: Amount::units(10),
        };

        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert!(err.to_string().contains("available 5.000000"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_kinds() {
        let conflict = LedgerError::Conflict {
            attempts: 3,
            reason: "busy".to_string(),
        };
        assert!(conflict.is_retryable());
        assert!(LedgerError::RoundInProgress("bob".to_string()).is_retryable());
        assert!(!LedgerError::DuplicateRound("r1".to_string()).is_retryable());
    }

    #[test]
    fn test_error_body_serializes_kind() {
        let err = LedgerError::slot_closed("slot-1", "purchase window closed");
        let body = ErrorBody::from(&err);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["kind"], "SLOT_CLOSED_OR_INVALID");
        assert_eq!(json["retryable"], false);
    }
}
