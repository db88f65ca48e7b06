// Transfer phases and the transitions between them

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the payment this node plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Holder handing tokens over
    Sender,
    /// Merchant issuing the seed and taking tokens
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Progress of one transfer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferPhase {
    #[default]
    NotStarted,
    Connecting,
    Connected,
    SendingSeed,
    SendingTokens,
    Completed,
    Error,
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Legal next phases for `role`
    ///
    /// Any live phase may fall into `Error`; terminal phases go nowhere.
    pub fn can_transition_to(&self, next: TransferPhase, role: Role) -> bool {
        use TransferPhase::*;
        if self.is_terminal() {
            return false;
        }
        if next == Error {
            return true;
        }
        match (self, next, role) {
            (NotStarted, Connecting, _) => true,
            (Connecting, Connected, _) => true,
            (Connected, SendingSeed, Role::Receiver) => true,
            (Connected, SendingTokens, Role::Sender) => true,
            (SendingSeed, Completed, Role::Receiver) => true,
            (SendingTokens, Completed, Role::Sender) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::SendingSeed => "sending_seed",
            Self::SendingTokens => "sending_tokens",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
