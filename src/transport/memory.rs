// In-process transport
//
// A MemoryNetwork is a registry of named listeners. Connecting to a name
// hands the listener one end of a channel pair. Used by tests and by
// single-process demos.

use crate::transport::{
    Connection, ConnectionInfo, PeerAddress, Transport, TransportConfig, TransportError, TransportState,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

const CHANNEL_DEPTH: usize = 32;

// ============================================================================
// MEMORY CONNECTION
// ============================================================================

/// One end of an in-process duplex link
pub struct MemoryConnection {
    info: ConnectionInfo,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
    max_frame_len: usize,
}

impl MemoryConnection {
    /// Two connected ends
    pub fn pair(max_frame_len: usize) -> (Self, Self) {
        Self::named_pair("left", "right", max_frame_len)
    }

    fn named_pair(left: &str, right: &str, max_frame_len: usize) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (right_tx, left_rx) = mpsc::channel(CHANNEL_DEPTH);
        let a = Self {
            info: ConnectionInfo::new(PeerAddress::memory(right)),
            tx: Some(left_tx),
            rx: left_rx,
            max_frame_len,
        };
        let b = Self {
            info: ConnectionInfo::new(PeerAddress::memory(left)),
            tx: Some(right_tx),
            rx: right_rx,
            max_frame_len,
        };
        (a, b)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: data.len(),
                max: self.max_frame_len,
            });
        }
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(data.to_vec()).await.map_err(|_| TransportError::Closed)?;
        self.info.record_sent(data.len());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.tx.is_none() {
            return Err(TransportError::Closed);
        }
        let payload = self.rx.recv().await.ok_or(TransportError::Closed)?;
        self.info.record_received(payload.len());
        Ok(payload)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.tx.take().is_some() {
            self.rx.close();
            self.info.mark_closed();
        }
        Ok(())
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

// ============================================================================
// MEMORY NETWORK / TRANSPORT
// ============================================================================

type Registry = HashMap<String, mpsc::Sender<MemoryConnection>>;

/// Shared registry of listening endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this network under `name`
    pub fn transport(&self, name: &str) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            name: name.to_string(),
            config: TransportConfig::default(),
            state: TransportState::Stopped,
            incoming: None,
        }
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> Result<T, TransportError> {
        let mut registry = self
            .listeners
            .lock()
            .map_err(|_| TransportError::IoError("memory network lock poisoned".to_string()))?;
        Ok(f(&mut registry))
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.with_registry(|r| r.get(name).is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

/// Transport endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    name: String,
    config: TransportConfig,
    state: TransportState,
    incoming: Option<mpsc::Receiver<MemoryConnection>>,
}

impl MemoryTransport {
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register as a listener without waiting for a peer
    pub fn bind(&mut self) -> Result<PeerAddress, TransportError> {
        if self.incoming.is_none() {
            let (tx, rx) = mpsc::channel(self.config.max_connections as usize);
            let name = self.name.clone();
            let taken = self.network.with_registry(|r| {
                if r.get(&name).is_some_and(|existing| !existing.is_closed()) {
                    true
                } else {
                    r.insert(name.clone(), tx);
                    false
                }
            })?;
            if taken {
                return Err(TransportError::AddressInUse(self.name.clone()));
            }
            self.incoming = Some(rx);
            self.state = TransportState::Running;
        }
        Ok(PeerAddress::memory(&self.name))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&mut self, service_id: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.bind()?;
        let incoming = self.incoming.as_mut().ok_or(TransportError::NotRunning)?;
        let connection = incoming.recv().await.ok_or(TransportError::NotRunning)?;
        debug!(service = %service_id, endpoint = %self.name, "Accepted in-process connection");
        Ok(Box::new(connection))
    }

    async fn connect(&mut self, address: &PeerAddress) -> Result<Box<dyn Connection>, TransportError> {
        let PeerAddress::Memory { name } = address else {
            return Err(TransportError::InvalidAddress(format!(
                "Expected in-process address, got {}",
                address
            )));
        };

        let listener = self
            .network
            .with_registry(|r| r.get(name).cloned())?
            .ok_or_else(|| TransportError::ConnectionFailed(format!("No listener at {}", address)))?;

        let (ours, theirs) = MemoryConnection::named_pair(&self.name, name, self.config.max_frame_len);
        listener
            .send(theirs)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("Listener at {} went away", address)))?;
        Ok(Box::new(ours))
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if self.incoming.take().is_some() {
            let name = self.name.clone();
            self.network.with_registry(|r| r.remove(&name))?;
        }
        self.state = TransportState::Stopped;
        Ok(())
    }

    fn state(&self) -> &TransportState {
        &self.state
    }

    fn local_address(&self) -> Option<PeerAddress> {
        self.incoming.as_ref().map(|_| PeerAddress::memory(&self.name))
    }
}
