// Transport Traits and Core Types
// Defines the abstract Transport / Connection traits and common types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Base configuration for all transport types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum number of simultaneous connections
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connection_timeout_secs: u32,
    /// Message send timeout in seconds
    pub message_timeout_secs: u32,
    /// Largest accepted frame payload in bytes
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            connection_timeout_secs: 30,
            message_timeout_secs: 10,
            max_frame_len: 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connection_timeout(mut self, secs: u32) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    pub fn with_message_timeout(mut self, secs: u32) -> Self {
        self.message_timeout_secs = secs;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_connections == 0 {
            return Err(TransportError::InvalidConfig("max_connections cannot be 0".to_string()));
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(TransportError::InvalidConfig(format!(
                "max_frame_len out of range: {}",
                self.max_frame_len
            )));
        }
        Ok(())
    }
}

// ============================================================================
// PEER ADDRESS
// ============================================================================

/// A peer's address across transport types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerAddress {
    /// TCP/IP address
    Tcp { host: String, port: u16 },
    /// Named in-process endpoint
    Memory { name: String },
}

impl PeerAddress {
    /// Create a TCP address
    pub fn tcp(host: &str, port: u16) -> Self {
        Self::Tcp {
            host: host.to_string(),
            port,
        }
    }

    /// Create an in-process address
    pub fn memory(name: &str) -> Self {
        Self::Memory {
            name: name.to_string(),
        }
    }

    /// Parse `host:port` into a TCP address
    pub fn parse_tcp(addr: &str) -> Result<Self, TransportError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(addr.to_string()));
        }
        Ok(Self::tcp(host, port))
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory { .. })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Memory { name } => write!(f, "mem://{}", name),
        }
    }
}

// ============================================================================
// CONNECTION ID
// ============================================================================

/// Unique identifier for a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionId([u8; 16]);

impl ConnectionId {
    /// Generate a new unique connection ID
    pub fn generate() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ConnectionId {}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Connected,
    Closed,
}

// ============================================================================
// CONNECTION INFO
// ============================================================================

/// Information about an open connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    id: ConnectionId,
    address: PeerAddress,
    state: ConnectionState,
    created_at: i64,
    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
}

impl ConnectionInfo {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            id: ConnectionId::generate(),
            address,
            state: ConnectionState::Connected,
            created_at: chrono::Utc::now().timestamp_millis(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Remote address
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Unix millis
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent = self.bytes_sent.saturating_add(bytes as u64);
        self.messages_sent += 1;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received = self.bytes_received.saturating_add(bytes as u64);
        self.messages_received += 1;
    }
}

// ============================================================================
// TRANSPORT STATE
// ============================================================================

/// State of the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Running,
    Error(String),
}

impl TransportState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed by peer")]
    Closed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Maximum connections reached")]
    MaxConnectionsReached,

    #[error("Transport not running")]
    NotRunning,

    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Peer went away (as opposed to a local or protocol error)
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed | Self::ReceiveFailed(_) | Self::SendFailed(_))
    }

    /// Check if the operation can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed(_) | Self::SendFailed(_) | Self::ReceiveFailed(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::IoError(e.to_string()),
        }
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// An ordered, reliable, message-framed link to one peer
#[async_trait]
pub trait Connection: Send {
    /// Send one message
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next message; `Err(Closed)` once the peer is gone
    async fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Release the link. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn info(&self) -> &ConnectionInfo;
}

/// Produces connections, either by accepting or by dialing
#[async_trait]
pub trait Transport: Send {
    /// Accept the next connection for `service_id`
    async fn listen(&mut self, service_id: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Dial a peer
    async fn connect(&mut self, address: &PeerAddress) -> Result<Box<dyn Connection>, TransportError>;

    /// Stop listening and release sockets. Idempotent.
    async fn stop(&mut self) -> Result<(), TransportError>;

    fn state(&self) -> &TransportState;

    /// Address peers can dial, once listening
    fn local_address(&self) -> Option<PeerAddress>;
}
