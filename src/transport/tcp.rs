// TCP Transport Implementation
// Length-prefixed message framing over tokio TCP streams

use crate::transport::{
    Connection, ConnectionInfo, PeerAddress, Transport, TransportConfig, TransportError, TransportState,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

// ============================================================================
// TCP TRANSPORT CONFIG
// ============================================================================

/// Configuration for TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Address to bind to
    pub bind_address: String,
    /// Port to bind to (0 for random)
    pub bind_port: u16,
    /// Enable TCP_NODELAY
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            bind_address: "0.0.0.0".to_string(),
            bind_port: 0,
            nodelay: true,
        }
    }
}

impl TcpTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

// ============================================================================
// FRAMING
// ============================================================================

/// Write `[len: u32 BE][payload]`
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame written by [`write_frame`]
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// ============================================================================
// TCP CONNECTION
// ============================================================================

/// One framed TCP stream
pub struct TcpConnection {
    info: ConnectionInfo,
    stream: Option<TcpStream>,
    max_frame_len: usize,
    send_timeout: Duration,
}

impl TcpConnection {
    fn new(stream: TcpStream, address: PeerAddress, config: &TransportConfig) -> Self {
        Self {
            info: ConnectionInfo::new(address),
            stream: Some(stream),
            max_frame_len: config.max_frame_len,
            send_timeout: Duration::from_secs(config.message_timeout_secs as u64),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        timeout(self.send_timeout, write_frame(stream, data, self.max_frame_len))
            .await
            .map_err(|_| TransportError::Timeout)??;
        self.info.record_sent(data.len());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let payload = read_frame(stream, self.max_frame_len).await?;
        self.info.record_received(payload.len());
        Ok(payload)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            // peer may already be gone
            let _ = stream.shutdown().await;
            self.info.mark_closed();
            debug!(connection = %self.info.id(), "TCP connection closed");
        }
        Ok(())
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

// ============================================================================
// TCP TRANSPORT
// ============================================================================

/// TCP transport: one listening socket, any number of dialed connections
pub struct TcpTransport {
    config: TcpTransportConfig,
    state: TransportState,
    listener: Option<TcpListener>,
    local_address: Option<PeerAddress>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            state: TransportState::Stopped,
            listener: None,
            local_address: None,
        }
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    /// Bind the listening socket (no-op if already bound)
    pub async fn bind(&mut self) -> Result<PeerAddress, TransportError> {
        if let Some(address) = &self.local_address {
            return Ok(address.clone());
        }
        self.config.base.validate()?;

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            self.state = TransportState::Error(e.to_string());
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(bind_addr.clone())
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        let local_addr = listener.local_addr()?;
        let address = PeerAddress::tcp(&local_addr.ip().to_string(), local_addr.port());
        info!(address = %address, "TCP transport listening");

        self.listener = Some(listener);
        self.local_address = Some(address.clone());
        self.state = TransportState::Running;
        Ok(address)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&mut self, service_id: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.bind().await?;
        let listener = self.listener.as_ref().ok_or(TransportError::NotRunning)?;

        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(self.config.nodelay).ok();
        let address = PeerAddress::tcp(&addr.ip().to_string(), addr.port());
        debug!(service = %service_id, peer = %address, "Accepted TCP connection");

        Ok(Box::new(TcpConnection::new(stream, address, &self.config.base)))
    }

    async fn connect(&mut self, address: &PeerAddress) -> Result<Box<dyn Connection>, TransportError> {
        let (host, port) = match address {
            PeerAddress::Tcp { host, port } => (host.clone(), *port),
            other => {
                return Err(TransportError::InvalidAddress(format!(
                    "Expected TCP address, got {}",
                    other
                )))
            }
        };

        let connect_timeout = Duration::from_secs(self.config.base.connection_timeout_secs as u64);
        let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(self.config.nodelay).ok();
        debug!(peer = %address, "Connected over TCP");

        Ok(Box::new(TcpConnection::new(stream, address.clone(), &self.config.base)))
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if self.listener.take().is_some() {
            info!("TCP transport stopped");
        }
        self.local_address = None;
        self.state = TransportState::Stopped;
        Ok(())
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn local_address(&self) -> Option<PeerAddress> {
        self.local_address.clone()
    }
}
