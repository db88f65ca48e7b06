// Transfer module - HAND-TO-HAND PAYMENT
// Seed / tokens / completed exchange between a holder and a merchant

mod driver;
mod message;
mod phase;
mod session;

use crate::ledger::LedgerError;
use crate::selection::SelectionError;
use crate::storage::StoreError;
use crate::token::CodecError;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use driver::{
    NoopListener, OfflineTransfer, StopHandle, TransferConfig, TransferListener, TransferOutcome, Wallet,
};
pub use message::TransferMessage;
pub use phase::{Role, TransferPhase};
pub use session::{generate_seed, TransferSession};

// ============================================================================
// REJECTION CODES
// ============================================================================

/// Stable, wire-visible reason a transfer did not complete
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    ForgedTokenSignature,
    InvalidTokenPayload,
    OfflineDoubleSpendingDetected,
    TransportFailure,
    InsufficientFunds,
    InvalidAmount,
    Cancelled,
    Timeout,
    Storage,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForgedTokenSignature => "FORGED_TOKEN_SIGNATURE",
            Self::InvalidTokenPayload => "INVALID_TOKEN_PAYLOAD",
            Self::OfflineDoubleSpendingDetected => "OFFLINE_DOUBLE_SPENDING_DETECTED",
            Self::TransportFailure => "TRANSPORT_FAILURE",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TRANSFER ERRORS
// ============================================================================

/// Why a transfer ended in [`TransferPhase::Error`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Forged token signature on token {token_id}")]
    ForgedTokenSignature { token_id: String },

    #[error("Invalid token payload: {0}")]
    InvalidTokenPayload(String),

    #[error("Offline double spending detected for token {token_id}")]
    OfflineDoubleSpendingDetected { token_id: String },

    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Rejected by peer ({code}): {reason}")]
    Rejected { code: RejectionCode, reason: String },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl TransferError {
    /// Code sent to the peer when this error ends a transfer
    pub fn code(&self) -> RejectionCode {
        match self {
            Self::ForgedTokenSignature { .. } => RejectionCode::ForgedTokenSignature,
            Self::InvalidTokenPayload(_) => RejectionCode::InvalidTokenPayload,
            Self::OfflineDoubleSpendingDetected { .. } => RejectionCode::OfflineDoubleSpendingDetected,
            Self::TransportFailure(_) => RejectionCode::TransportFailure,
            Self::InsufficientFunds { .. } => RejectionCode::InsufficientFunds,
            Self::InvalidAmount(_) => RejectionCode::InvalidAmount,
            Self::Rejected { code, .. } => *code,
            Self::Cancelled => RejectionCode::Cancelled,
            Self::Timeout(_) => RejectionCode::Timeout,
            Self::Storage(_) => RejectionCode::Storage,
        }
    }

    /// Whether the peer should be told about this failure
    ///
    /// Transport failures and peer rejections have nobody left to tell.
    pub fn should_notify_peer(&self) -> bool {
        !matches!(self, Self::TransportFailure(_) | Self::Rejected { .. } | Self::Cancelled)
    }
}

impl From<CodecError> for TransferError {
    fn from(e: CodecError) -> Self {
        Self::InvalidTokenPayload(e.to_string())
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<LedgerError> for TransferError {
    fn from(e: LedgerError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<SelectionError> for TransferError {
    fn from(e: SelectionError) -> Self {
        match e {
            SelectionError::NoTokens => Self::InsufficientFunds {
                available: 0,
                requested: 0,
            },
            SelectionError::InsufficientFunds { available, requested } => {
                Self::InsufficientFunds { available, requested }
            }
            other => Self::InvalidTokenPayload(other.to_string()),
        }
    }
}
