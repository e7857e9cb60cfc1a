use crate::net::destination::{NormalizedKey, Scheme};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::fmt;
use std::future::Future;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket, UnixDatagram, UnixStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identity of a pooled connection, derived from its file descriptor.
///
/// Unique only while the descriptor is open; the kernel may hand the same number to a
/// later socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_fd(fd: &impl AsRawFd) -> Self {
        ConnectionId(fd.as_raw_fd() as u64)
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        ConnectionId(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A connection the pool can track: it has a stable identity and can report whether the
/// peer is still there.
pub trait PooledSocket: Send + 'static {
    fn id(&self) -> ConnectionId;

    /// `false` once the peer closed the connection or the socket is in an error state.
    fn is_alive(&self) -> bool;
}

/// Options handed through the pool to the connector untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Timeout for establishing new connections (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm on TCP connections
    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_tcp_nodelay() -> bool {
    true
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            tcp_nodelay: default_tcp_nodelay(),
        }
    }
}

impl ConnectOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Opens new raw connections on behalf of the pool.
///
/// Implementations should stop work once `cancel` fires; the pool stops waiting on its
/// own regardless.
pub trait Connector: Send + Sync + 'static {
    type Connection: PooledSocket;

    fn connect(
        &self,
        key: &NormalizedKey,
        options: &ConnectOptions,
        cancel: &CancellationToken,
    ) -> impl Future<Output = io::Result<Self::Connection>> + Send;
}

fn probe_alive(fd: &impl AsFd, stream: bool) -> bool {
    let sock = SockRef::from(fd);
    match sock.take_error() {
        Ok(None) => {}
        Ok(Some(e)) => {
            trace!("Socket error pending: {}", e);
            return false;
        }
        Err(_) => return false,
    }
    if !stream {
        return true;
    }

    // Non-blocking peek: 0 bytes means orderly shutdown by the peer.
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match sock.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

impl PooledSocket for TcpStream {
    fn id(&self) -> ConnectionId {
        ConnectionId::from_fd(self)
    }

    fn is_alive(&self) -> bool {
        probe_alive(self, true)
    }
}

impl PooledSocket for UnixStream {
    fn id(&self) -> ConnectionId {
        ConnectionId::from_fd(self)
    }

    fn is_alive(&self) -> bool {
        probe_alive(self, true)
    }
}

impl PooledSocket for UdpSocket {
    fn id(&self) -> ConnectionId {
        ConnectionId::from_fd(self)
    }

    fn is_alive(&self) -> bool {
        probe_alive(self, false)
    }
}

impl PooledSocket for UnixDatagram {
    fn id(&self) -> ConnectionId {
        ConnectionId::from_fd(self)
    }

    fn is_alive(&self) -> bool {
        probe_alive(self, false)
    }
}

/// A connection opened by [`SocketConnector`].
#[derive(Debug)]
pub enum RawSocket {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp(UdpSocket),
    Udg(UnixDatagram),
}

impl RawSocket {
    pub fn scheme(&self) -> Scheme {
        match self {
            RawSocket::Tcp(_) => Scheme::Tcp,
            RawSocket::Unix(_) => Scheme::Unix,
            RawSocket::Udp(_) => Scheme::Udp,
            RawSocket::Udg(_) => Scheme::Udg,
        }
    }
}

impl AsFd for RawSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            RawSocket::Tcp(s) => s.as_fd(),
            RawSocket::Unix(s) => s.as_fd(),
            RawSocket::Udp(s) => s.as_fd(),
            RawSocket::Udg(s) => s.as_fd(),
        }
    }
}

impl PooledSocket for RawSocket {
    fn id(&self) -> ConnectionId {
        ConnectionId::from_fd(&self.as_fd())
    }

    fn is_alive(&self) -> bool {
        probe_alive(self, !self.scheme().is_datagram())
    }
}

/// Dials real sockets according to the destination scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl SocketConnector {
    async fn dial(key: &NormalizedKey, options: &ConnectOptions) -> io::Result<RawSocket> {
        match key.scheme() {
            Scheme::Tcp => {
                let stream = TcpStream::connect(key.target()).await?;
                stream.set_nodelay(options.tcp_nodelay)?;
                Ok(RawSocket::Tcp(stream))
            }
            Scheme::Udp => {
                let remote = tokio::net::lookup_host(key.target())
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            format!("no addresses found for {}", key),
                        )
                    })?;
                let local: SocketAddr = if remote.is_ipv4() {
                    ([0u8; 4], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(remote).await?;
                Ok(RawSocket::Udp(socket))
            }
            Scheme::Unix => Ok(RawSocket::Unix(UnixStream::connect(key.target()).await?)),
            Scheme::Udg => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(key.target())?;
                Ok(RawSocket::Udg(socket))
            }
        }
    }
}

impl Connector for SocketConnector {
    type Connection = RawSocket;

    async fn connect(
        &self,
        key: &NormalizedKey,
        options: &ConnectOptions,
        cancel: &CancellationToken,
    ) -> io::Result<RawSocket> {
        let connect_timeout = options.connect_timeout();

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("Connection to {} cancelled", key),
                ));
            }
            attempt = timeout(connect_timeout, Self::dial(key, options)) => attempt,
        };

        match attempt {
            Ok(Ok(socket)) => {
                debug!("Connected to {} ({})", key, socket.id());
                Ok(socket)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "Connection to {} timed out after {:?}",
                    key, connect_timeout
                ),
            )),
        }
    }
}
