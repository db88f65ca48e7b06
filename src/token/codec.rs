use crate::token::Token;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use thiserror::Error;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode tokens: {0}")]
    EncodeError(String),

    #[error("Failed to decode tokens: {0}")]
    DecodeError(String),

    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    #[error("Invalid base64 string: {0}")]
    InvalidBase64(String),
}

/// Codec for token lists (postcard for compact serialization)
pub struct TokenCodec;

impl TokenCodec {
    /// Encode an ordered token list to binary bytes
    pub fn encode(tokens: &[Token]) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(tokens).map_err(|e| CodecError::EncodeError(e.to_string()))
    }

    /// Decode an ordered token list from binary bytes
    pub fn decode(bytes: &[u8]) -> Result<Vec<Token>, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::DecodeError(e.to_string()))
    }

    /// Encode a single token
    pub fn encode_token(token: &Token) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(token).map_err(|e| CodecError::EncodeError(e.to_string()))
    }

    /// Decode a single token
    pub fn decode_token(bytes: &[u8]) -> Result<Token, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::DecodeError(e.to_string()))
    }

    /// Encode to hex string
    pub fn encode_hex(tokens: &[Token]) -> Result<String, CodecError> {
        Ok(hex::encode(Self::encode(tokens)?))
    }

    /// Decode from hex string
    pub fn decode_hex(hex_str: &str) -> Result<Vec<Token>, CodecError> {
        let bytes = hex::decode(hex_str).map_err(|e| CodecError::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }

    /// Encode to base64 string (URL-safe, no padding)
    pub fn encode_base64(tokens: &[Token]) -> Result<String, CodecError> {
        Ok(URL_SAFE_NO_PAD.encode(Self::encode(tokens)?))
    }

    /// Decode from base64 string
    pub fn decode_base64(b64_str: &str) -> Result<Vec<Token>, CodecError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(b64_str)
            .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
        Self::decode(&bytes)
    }
}
