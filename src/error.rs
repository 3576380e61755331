//! Error types for the custody bridge

use crate::protection::ProtectionKind;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Which side of the bridge a funds shortage was detected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundsSide {
    Local,
    Remote,
}

impl fmt::Display for FundsSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FundsSide::Local => write!(f, "local"),
            FundsSide::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {

    // =============================
    // Remote call failures
    // =============================

    #[error("network error: {0}")]
    Network(String),

    #[error("blocked by {kind} protection, manual intervention required")]
    ProtectionBlocked { kind: ProtectionKind },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A mutating remote call timed out and its effect could not be
    /// verified one way or the other.
    #[error("outcome of remote call unknown: {0}")]
    OutcomeUnknown(String),

    // =============================
    // Domain failures
    // =============================

    #[error("validation failed for {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("insufficient {side} funds: {detail}")]
    InsufficientFunds { side: FundsSide, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error(
        "reconciliation required for user {user_id}: {amount} at step '{step}' (player {player_id})"
    )]
    ReconciliationRequired {
        user_id: Uuid,
        player_id: String,
        amount: f64,
        step: &'static str,
    },

    #[error("another operation is already in flight for user {0}")]
    OperationInFlight(Uuid),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("invalid saga transition: {0}")]
    InvalidTransition(String),

    // =============================
    // External library conversions
    // =============================

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Short machine-readable code surfaced to the intent source.
    pub fn diagnostic_code(&self) -> &'static str {
        match self {
            BridgeError::Network(_) => "network_error",
            BridgeError::ProtectionBlocked { kind } => kind.diagnostic_code(),
            BridgeError::AuthenticationFailed(_) => "authentication_failed",
            BridgeError::OutcomeUnknown(_) => "outcome_unknown",
            BridgeError::Validation { .. } => "validation_error",
            BridgeError::InsufficientFunds { side: FundsSide::Local, .. } => {
                "insufficient_local_funds"
            }
            BridgeError::InsufficientFunds { side: FundsSide::Remote, .. } => {
                "insufficient_remote_funds"
            }
            BridgeError::NotFound(_) => "not_found",
            BridgeError::AlreadyExists(_) => "already_exists",
            BridgeError::ReconciliationRequired { .. } => "reconciliation_required",
            BridgeError::OperationInFlight(_) => "operation_in_flight",
            BridgeError::Ledger(_) => "ledger_error",
            BridgeError::InvalidTransition(_) => "invalid_transition",
            BridgeError::Http(_) => "http_error",
            BridgeError::Serialization(_) => "serialization_error",
            BridgeError::Io(_) => "io_error",
        }
    }
}
