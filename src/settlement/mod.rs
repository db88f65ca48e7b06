// Settlement module - BACK ONLINE
// Signed transfer proposals and their submission to the online ledger

mod proposal;
mod submitter;

use thiserror::Error;

pub use proposal::TransferProposal;
pub use submitter::{
    LedgerSubmitter, OutboxSubmitter, RecordingSubmitter, Settler, SettlerConfig, SettlerStats, SubmissionReceipt,
};

/// Errors from preparing or submitting a proposal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Proposal is not signed")]
    Unsigned,

    #[error("Proposal signature does not verify")]
    BadSignature,

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Ledger refused proposal: {0}")]
    Refused(String),

    #[error("Submission timed out")]
    Timeout,

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SubmissionError {
    /// Worth another attempt against the same ledger
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Refused(_) | Self::Timeout)
    }
}
