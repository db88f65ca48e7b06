// TransferSession - the transfer state machine without any I/O
//
// The session decides what to send and what to accept; the driver owns
// the connection, the clock and the locks, and feeds inputs in arrival
// order. Inputs that do not fit the current phase are reported through
// `expects` and dropped by the driver.

use super::message::TransferMessage;
use super::phase::{Role, TransferPhase};
use super::{RejectionCode, TransferError};
use crate::ledger::DoubleSpendLedger;
use crate::selection::DeterministicSelector;
use crate::token::{checked_total_amount, total_amount, Token, TokenCodec, TokenVerifier};
use rand::RngCore;
use std::collections::HashSet;
use tracing::{debug, warn};

const SEED_LEN: usize = 16;

/// Fresh random selection seed (hex)
pub fn generate_seed() -> String {
    let mut bytes = [0u8; SEED_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One side of one transfer
#[derive(Debug, Clone)]
pub struct TransferSession {
    role: Role,
    phase: TransferPhase,
    /// Sender: target amount. Receiver: minimum accepted, if any.
    amount: Option<i64>,
    seed: Option<String>,
    tokens: Vec<Token>,
    peer_filter: Option<String>,
    error: Option<TransferError>,
}

impl TransferSession {
    /// Holder paying `amount`
    pub fn sender(amount: i64) -> Self {
        Self::new(Role::Sender, Some(amount))
    }

    /// Merchant accepting at least `expected_amount`, or anything
    pub fn receiver(expected_amount: Option<i64>) -> Self {
        Self::new(Role::Receiver, expected_amount)
    }

    fn new(role: Role, amount: Option<i64>) -> Self {
        Self {
            role,
            phase: TransferPhase::NotStarted,
            amount,
            seed: None,
            tokens: Vec::new(),
            peer_filter: None,
            error: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn amount(&self) -> Option<i64> {
        self.amount
    }

    pub fn seed(&self) -> Option<&str> {
        self.seed.as_deref()
    }

    /// Tokens selected (sender) or accepted (receiver)
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn total_amount(&self) -> i64 {
        total_amount(&self.tokens)
    }

    /// Filter the peer attached to its seed or tokens message
    pub fn peer_filter(&self) -> Option<&str> {
        self.peer_filter.as_deref()
    }

    pub fn error(&self) -> Option<&TransferError> {
        self.error.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    fn transition(&mut self, next: TransferPhase) -> Result<(), TransferError> {
        if !self.phase.can_transition_to(next, self.role) {
            return Err(TransferError::InvalidTokenPayload(format!(
                "{} cannot move from {} to {}",
                self.role, self.phase, next
            )));
        }
        debug!(role = %self.role, from = %self.phase, to = %next, "Transfer phase change");
        self.phase = next;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin listening (receiver) or dialing (sender)
    pub fn start(&mut self) -> Result<(), TransferError> {
        if let Some(amount) = self.amount {
            if amount <= 0 {
                return Err(TransferError::InvalidAmount(amount));
            }
        }
        self.transition(TransferPhase::Connecting)
    }

    /// Transport is up
    pub fn connected(&mut self) -> Result<(), TransferError> {
        self.transition(TransferPhase::Connected)
    }

    /// Receiver: draw a fresh seed and build the seed message
    pub fn issue_seed(&mut self, outgoing_filter: Option<String>) -> Result<TransferMessage, TransferError> {
        if self.role != Role::Receiver {
            return Err(TransferError::InvalidTokenPayload("only the receiver issues a seed".to_string()));
        }
        let seed = generate_seed();
        self.transition(TransferPhase::SendingSeed)?;
        let message = TransferMessage::seed(&seed, outgoing_filter);
        self.seed = Some(seed);
        Ok(message)
    }

    /// Whether `message` is meaningful in the current phase
    pub fn expects(&self, message: &TransferMessage) -> bool {
        use TransferPhase::*;
        match (self.role, self.phase, message) {
            (_, Connected | SendingSeed | SendingTokens, TransferMessage::Rejected { .. }) => true,
            (Role::Sender, Connected, TransferMessage::Seed { .. }) => true,
            (Role::Sender, SendingTokens, TransferMessage::Completed { completed: true }) => true,
            (Role::Receiver, SendingSeed, TransferMessage::Tokens { .. }) => true,
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Sender
    // ------------------------------------------------------------------

    /// Select tokens for the receiver's seed and build the tokens message
    pub fn on_seed(
        &mut self,
        seed: &str,
        peer_filter: Option<&str>,
        unspent: &[Token],
        selector: &DeterministicSelector,
        outgoing_filter: Option<String>,
    ) -> Result<TransferMessage, TransferError> {
        if seed.is_empty() {
            return Err(TransferError::InvalidTokenPayload("empty seed".to_string()));
        }
        let amount = self.amount.unwrap_or_default();
        let selected = selector.select(unspent, seed, amount)?;
        let message = TransferMessage::tokens(&selected, outgoing_filter)?;

        debug!(
            seed = %seed,
            count = selected.len(),
            total = total_amount(&selected),
            "Selected tokens for seed"
        );
        self.seed = Some(seed.to_string());
        self.peer_filter = peer_filter.map(str::to_string);
        self.tokens = selected;
        self.transition(TransferPhase::SendingTokens)?;
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Receiver
    // ------------------------------------------------------------------

    /// Decode and check an incoming token list
    ///
    /// Nothing is recorded here. On `Ok` the caller commits the returned
    /// tokens and then calls [`complete`](Self::complete).
    pub fn on_tokens(
        &mut self,
        payload: &str,
        peer_filter: Option<&str>,
        verifier: &TokenVerifier,
        ledger: &DoubleSpendLedger,
    ) -> Result<Vec<Token>, TransferError> {
        let decoded = TokenCodec::decode_base64(payload)?;
        if decoded.is_empty() {
            return Err(TransferError::InvalidTokenPayload("empty token list".to_string()));
        }

        // spent flag and receive date are the sender's bookkeeping
        let tokens: Vec<Token> = decoded
            .into_iter()
            .map(|t| {
                Token::new(
                    t.id().to_string(),
                    t.amount(),
                    t.issuer_signature().to_vec(),
                    t.date_created(),
                )
            })
            .collect();

        let mut ids = HashSet::with_capacity(tokens.len());
        for token in &tokens {
            if token.amount() <= 0 {
                return Err(TransferError::InvalidTokenPayload(format!(
                    "token {} has non-positive amount",
                    token.id()
                )));
            }
            if !ids.insert(token.id()) {
                return Err(TransferError::InvalidTokenPayload(format!(
                    "token {} listed twice",
                    token.id()
                )));
            }
        }

        if let Some(forged) = verifier.find_forged(&tokens) {
            warn!(token_id = %forged.id(), "Rejecting transfer with forged token");
            return Err(TransferError::ForgedTokenSignature {
                token_id: forged.id().to_string(),
            });
        }

        if let Some(reused) = ledger.find_double_spent(&tokens) {
            return Err(TransferError::OfflineDoubleSpendingDetected {
                token_id: reused.id().to_string(),
            });
        }

        let total = checked_total_amount(&tokens)
            .ok_or_else(|| TransferError::InvalidTokenPayload("token amounts overflow".to_string()))?;
        if let Some(expected) = self.amount {
            if total < expected {
                return Err(TransferError::InsufficientFunds {
                    available: total,
                    requested: expected,
                });
            }
        }

        self.peer_filter = peer_filter.map(str::to_string);
        self.tokens = tokens.clone();
        Ok(tokens)
    }

    // ------------------------------------------------------------------
    // Endings
    // ------------------------------------------------------------------

    /// Sender: acknowledgement received. Receiver: tokens committed.
    pub fn complete(&mut self) -> Result<(), TransferError> {
        self.transition(TransferPhase::Completed)
    }

    /// The peer's rejection as a local error
    pub fn on_rejected(&self, code: RejectionCode, reason: &str) -> TransferError {
        TransferError::Rejected {
            code,
            reason: reason.to_string(),
        }
    }

    /// Enter `Error`; false if already terminal
    pub fn fail(&mut self, error: TransferError) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        warn!(role = %self.role, phase = %self.phase, error = %error, "Transfer failed");
        self.phase = TransferPhase::Error;
        self.error = Some(error);
        true
    }

    /// Cancel from any live phase
    pub fn stop(&mut self) -> bool {
        self.fail(TransferError::Cancelled)
    }
}
