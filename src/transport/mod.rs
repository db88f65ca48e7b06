// Transport module - THE WIRE (abstract)
// Message-framed connections over TCP or in-process channels

mod memory;
mod tcp;
mod traits;

pub use traits::{
    // Core traits
    Connection, Transport,
    // Configuration
    TransportConfig,
    // Connection types
    ConnectionId, ConnectionInfo, ConnectionState,
    // Address types
    PeerAddress,
    // State and errors
    TransportError, TransportState,
};

pub use memory::{MemoryConnection, MemoryNetwork, MemoryTransport};
pub use tcp::{read_frame, write_frame, TcpConnection, TcpTransport, TcpTransportConfig};
