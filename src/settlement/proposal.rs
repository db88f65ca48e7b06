// TransferProposal - an offline payment, written up for the online ledger

use super::SubmissionError;
use crate::token::{IssuerKeypair, IssuerPublicKey};
use crate::transfer::TransferOutcome;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Claim that `sender` paid `receiver` with the listed tokens
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProposal {
    seed: String,
    token_ids: Vec<String>,
    amount: i64,
    sender: String,
    receiver: String,
    created_at: i64,
    /// DER signature by the submitting party, hex public key alongside
    signature: Option<(String, Vec<u8>)>,
}

impl TransferProposal {
    pub fn new(seed: &str, token_ids: Vec<String>, amount: i64, sender: &str, receiver: &str, created_at: i64) -> Self {
        Self {
            seed: seed.to_string(),
            token_ids,
            amount,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            created_at,
            signature: None,
        }
    }

    /// Proposal for a completed transfer
    pub fn from_outcome(outcome: &TransferOutcome, sender: &str, receiver: &str, created_at: i64) -> Self {
        let token_ids = outcome.tokens.iter().map(|t| t.id().to_string()).collect();
        Self::new(&outcome.seed, token_ids, outcome.total_amount, sender, receiver, created_at)
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn token_ids(&self) -> &[String] {
        &self.token_ids
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Canonical bytes covered by the signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for field in [self.seed.as_str(), self.sender.as_str(), self.receiver.as_str()] {
            hasher.update((field.len() as u32).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update((self.token_ids.len() as u32).to_be_bytes());
        for id in &self.token_ids {
            hasher.update((id.len() as u32).to_be_bytes());
            hasher.update(id.as_bytes());
        }
        hasher.update(self.amount.to_be_bytes());
        hasher.update(self.created_at.to_be_bytes());
        hasher.finalize().to_vec()
    }

    pub fn sign(mut self, keypair: &IssuerKeypair) -> Self {
        let signature = keypair.sign_bytes(&self.signing_bytes());
        self.signature = Some((keypair.public_key().to_hex(), signature));
        self
    }

    /// Check the attached signature; the key it names must parse
    pub fn verify_signature(&self) -> Result<IssuerPublicKey, SubmissionError> {
        let (key_hex, signature) = self.signature.as_ref().ok_or(SubmissionError::Unsigned)?;
        let key_bytes = hex::decode(key_hex).map_err(|e| SubmissionError::InvalidProposal(e.to_string()))?;
        let key =
            IssuerPublicKey::from_bytes(&key_bytes).map_err(|e| SubmissionError::InvalidProposal(e.to_string()))?;
        if !key.verify_bytes(&self.signing_bytes(), signature) {
            return Err(SubmissionError::BadSignature);
        }
        Ok(key)
    }

    /// Structural checks before anything goes out
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.token_ids.is_empty() {
            return Err(SubmissionError::InvalidProposal("no tokens".to_string()));
        }
        if self.amount <= 0 {
            return Err(SubmissionError::InvalidProposal(format!("amount {}", self.amount)));
        }
        if self.sender.is_empty() || self.receiver.is_empty() {
            return Err(SubmissionError::InvalidProposal("missing party".to_string()));
        }
        self.verify_signature().map(|_| ())
    }
}
