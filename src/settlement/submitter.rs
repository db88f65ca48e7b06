// Submitter - pushes transfer proposals to the online ledger
// Retries with a fixed delay and a per-attempt timeout

use super::{SubmissionError, TransferProposal};
use crate::token::IssuerKeypair;
use crate::transfer::{Role, TransferOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

// ============================================================================
// LEDGER SUBMITTER TRAIT
// ============================================================================

/// The online ledger that eventually settles offline payments
#[async_trait]
pub trait LedgerSubmitter: Send + Sync {
    /// Submit one signed proposal
    async fn submit(&self, proposal: &TransferProposal) -> Result<SubmissionReceipt, SubmissionError>;
}

// ============================================================================
// RECEIPT
// ============================================================================

/// Acknowledgement from the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    transaction_id: String,
    amount: i64,
    accepted_at: i64,
}

impl SubmissionReceipt {
    pub fn new(transaction_id: &str, amount: i64) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            amount,
            accepted_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    /// Unix millis
    pub fn accepted_at(&self) -> i64 {
        self.accepted_at
    }
}

// ============================================================================
// RECORDING SUBMITTER
// ============================================================================

/// In-memory ledger that keeps every proposal it accepts
pub struct RecordingSubmitter {
    failure_message: Option<String>,
    failures_before_success: usize,
    delay: Duration,
    call_count: AtomicUsize,
    accepted: Mutex<Vec<TransferProposal>>,
}

impl RecordingSubmitter {
    /// Accepts every valid proposal
    pub fn new() -> Self {
        Self {
            failure_message: None,
            failures_before_success: 0,
            delay: Duration::ZERO,
            call_count: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
        }
    }

    /// Refuse every call with `message`
    pub fn with_failure(mut self, message: &str) -> Self {
        self.failure_message = Some(message.to_string());
        self.failures_before_success = usize::MAX;
        self
    }

    /// Refuse the first `failures` calls, then accept
    pub fn with_failures_then_success(mut self, failures: usize) -> Self {
        self.failures_before_success = failures;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Proposals accepted so far
    pub fn accepted(&self) -> Vec<TransferProposal> {
        self.accepted.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Default for RecordingSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerSubmitter for RecordingSubmitter {
    async fn submit(&self, proposal: &TransferProposal) -> Result<SubmissionReceipt, SubmissionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let call = self.call_count.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            return Err(SubmissionError::Refused(
                self.failure_message.clone().unwrap_or_else(|| "ledger unavailable".to_string()),
            ));
        }

        proposal.validate()?;
        let mut accepted = self
            .accepted
            .lock()
            .map_err(|_| SubmissionError::Refused("ledger state poisoned".to_string()))?;
        if accepted.iter().any(|p| p.token_ids().iter().any(|id| proposal.token_ids().contains(id))) {
            return Err(SubmissionError::InvalidProposal("token already settled".to_string()));
        }
        accepted.push(proposal.clone());
        Ok(SubmissionReceipt::new(&format!("tx-{}", accepted.len()), proposal.amount()))
    }
}

// ============================================================================
// OUTBOX SUBMITTER
// ============================================================================

/// Queues proposals in a JSON-lines file until they can be uploaded
///
/// Each line is one signed proposal. A token id may appear in the
/// outbox only once.
pub struct OutboxSubmitter {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl OutboxSubmitter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Proposals waiting in the outbox, oldest first
    pub async fn pending(&self) -> Result<Vec<TransferProposal>, SubmissionError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SubmissionError::Refused(e.to_string())),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| SubmissionError::InvalidProposal(format!("corrupt outbox entry: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl LedgerSubmitter for OutboxSubmitter {
    async fn submit(&self, proposal: &TransferProposal) -> Result<SubmissionReceipt, SubmissionError> {
        proposal.validate()?;
        let _guard = self.lock.lock().await;

        let queued = self.pending().await?;
        if queued.iter().any(|p| p.token_ids().iter().any(|id| proposal.token_ids().contains(id))) {
            return Err(SubmissionError::InvalidProposal("token already queued".to_string()));
        }

        let mut line = serde_json::to_vec(proposal).map_err(|e| SubmissionError::InvalidProposal(e.to_string()))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SubmissionError::Refused(e.to_string()))?;
        file.write_all(&line).await.map_err(|e| SubmissionError::Refused(e.to_string()))?;
        file.flush().await.map_err(|e| SubmissionError::Refused(e.to_string()))?;

        let transaction_id = hex::encode(&proposal.signing_bytes()[..8]);
        debug!(transaction_id = %transaction_id, path = %self.path.display(), "Proposal queued");
        Ok(SubmissionReceipt::new(&transaction_id, proposal.amount()))
    }
}

// ============================================================================
// SETTLER
// ============================================================================

/// Retry policy for submissions
#[derive(Clone, Debug)]
pub struct SettlerConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Per-attempt limit
    pub timeout: Duration,
}

impl Default for SettlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

impl SettlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.timeout.is_zero() {
            return Err(SubmissionError::InvalidConfig("timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Counters over a settler's lifetime
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettlerStats {
    pub submitted: u64,
    pub settled: u64,
    pub failed: u64,
    pub amount_settled: i64,
}

/// Submits proposals with retries
pub struct Settler {
    config: SettlerConfig,
    submitter: Arc<dyn LedgerSubmitter>,
    stats: SettlerStats,
}

impl Settler {
    pub fn new(config: SettlerConfig, submitter: Arc<dyn LedgerSubmitter>) -> Result<Self, SubmissionError> {
        config.validate()?;
        Ok(Self {
            config,
            submitter,
            stats: SettlerStats::default(),
        })
    }

    pub fn stats(&self) -> &SettlerStats {
        &self.stats
    }

    /// Write up a completed transfer, sign it as `us` and settle it
    ///
    /// The counterparty is named by the address it was reached at.
    pub async fn settle_outcome(
        &mut self,
        outcome: &TransferOutcome,
        keypair: &IssuerKeypair,
        us: &str,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let peer = outcome.peer.to_string();
        let (sender, receiver) = match outcome.role {
            Role::Sender => (us, peer.as_str()),
            Role::Receiver => (peer.as_str(), us),
        };
        let now = chrono::Utc::now().timestamp_millis();
        let proposal = TransferProposal::from_outcome(outcome, sender, receiver, now).sign(keypair);
        self.settle(&proposal).await
    }

    /// Submit `proposal`, retrying refusals and timeouts
    ///
    /// Invalid or badly signed proposals are not retried.
    pub async fn settle(&mut self, proposal: &TransferProposal) -> Result<SubmissionReceipt, SubmissionError> {
        proposal.validate()?;
        self.stats.submitted += 1;

        let mut attempts = 0u32;
        let last_error = loop {
            attempts += 1;
            let error = match tokio::time::timeout(self.config.timeout, self.submitter.submit(proposal)).await {
                Ok(Ok(receipt)) => {
                    self.stats.settled += 1;
                    self.stats.amount_settled += receipt.amount();
                    info!(
                        transaction_id = %receipt.transaction_id(),
                        amount = receipt.amount(),
                        attempts,
                        "Proposal settled"
                    );
                    return Ok(receipt);
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    self.stats.failed += 1;
                    return Err(e);
                }
                Ok(Err(e)) => e,
                Err(_) => SubmissionError::Timeout,
            };

            warn!(attempt = attempts, error = %error, "Submission attempt failed");
            if attempts > self.config.max_retries {
                break error;
            }
            if !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        };

        self.stats.failed += 1;
        Err(SubmissionError::Exhausted {
            attempts,
            last: last_error.to_string(),
        })
    }
}
