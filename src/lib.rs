// sockpool - Client-side socket connection pool

pub mod config;
pub mod net;
pub mod utils;

// Re-export commonly used types
pub use net::{
    normalize, ConnectOptions, ConnectionId, ConnectionPool, Connector, DatagramSocket,
    NormalizedKey, Packet, PoolConfig, PoolStats, PooledSocket, Reactor, SocketConnector,
};
pub use utils::error::{Result, SockPoolError};
