// Transfer messages - JSON objects tagged by "type"
//
//   {"type":"seed","seed":"..","filter":".."}
//   {"type":"tokens","tokens":"<base64 postcard>","filter":".."}
//   {"type":"completed","completed":true}
//   {"type":"rejected","code":"..","reason":".."}
//
// `filter` is an optional base64 shared Bloom filter. Messages with any
// other type are ignored by the receiving side.

use super::{RejectionCode, TransferError};
use crate::token::{Token, TokenCodec};
use serde::{Deserialize, Serialize};

/// One message of the transfer exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransferMessage {
    Seed {
        seed: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    Tokens {
        tokens: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    Completed {
        completed: bool,
    },
    Rejected {
        code: RejectionCode,
        reason: String,
    },
}

const KNOWN_TYPES: [&str; 4] = ["seed", "tokens", "completed", "rejected"];

impl TransferMessage {
    pub fn seed(seed: &str, filter: Option<String>) -> Self {
        Self::Seed {
            seed: seed.to_string(),
            filter,
        }
    }

    /// Encode `tokens` into a tokens message
    pub fn tokens(tokens: &[Token], filter: Option<String>) -> Result<Self, TransferError> {
        Ok(Self::Tokens {
            tokens: TokenCodec::encode_base64(tokens)?,
            filter,
        })
    }

    pub fn completed() -> Self {
        Self::Completed { completed: true }
    }

    pub fn rejected(error: &TransferError) -> Self {
        Self::Rejected {
            code: error.code(),
            reason: error.to_string(),
        }
    }

    /// Value of the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Seed { .. } => "seed",
            Self::Tokens { .. } => "tokens",
            Self::Completed { .. } => "completed",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// Peer filter piggybacked on the message, if any
    pub fn filter(&self) -> Option<&str> {
        match self {
            Self::Seed { filter, .. } | Self::Tokens { filter, .. } => filter.as_deref(),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransferError> {
        serde_json::to_vec(self).map_err(|e| TransferError::InvalidTokenPayload(e.to_string()))
    }

    /// Parse a frame; `Ok(None)` for a well-formed message of unknown type
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>, TransferError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| TransferError::InvalidTokenPayload(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TransferError::InvalidTokenPayload("message has no type".to_string()))?
            .to_string();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(None);
        }

        let message = serde_json::from_value(value)
            .map_err(|e| TransferError::InvalidTokenPayload(format!("malformed {} message: {}", kind, e)))?;
        Ok(Some(message))
    }
}
