use crate::net::destination::Scheme;
use crate::net::reactor::{Readiness, Reactor, WatcherId};
use crate::utils::error::{Result, SockPoolError};
use bytes::Bytes;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::Interest;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

const DEFAULT_CHUNK_SIZE: usize = 65535; // Max UDP packet size

/// One datagram and the address it came from or is going to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    address: String,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, address: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            address: address.into(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// A bound connectionless socket.
#[derive(Debug)]
pub enum DatagramHandle {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl DatagramHandle {
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, String)> {
        match self {
            DatagramHandle::Udp(socket) => socket
                .try_recv_from(buf)
                .map(|(len, addr)| (len, addr.to_string())),
            DatagramHandle::Unix(socket) => socket.try_recv_from(buf).map(|(len, addr)| {
                let address = addr
                    .as_pathname()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                (len, address)
            }),
        }
    }

    fn try_send_to(&self, buf: &[u8], address: &str) -> io::Result<usize> {
        match self {
            DatagramHandle::Udp(socket) => {
                let target: SocketAddr = address.parse().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid UDP address {:?}: {}", address, e),
                    )
                })?;
                socket.try_send_to(buf, target)
            }
            DatagramHandle::Unix(socket) => socket.try_send_to(buf, address),
        }
    }

    /// Pending `SO_ERROR`, e.g. `ConnectionRefused` after an ICMP port unreachable.
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            DatagramHandle::Udp(socket) => SockRef::from(socket).take_error(),
            DatagramHandle::Unix(socket) => SockRef::from(socket).take_error(),
        }
    }

    /// Drop cached error readiness once `SO_ERROR` was consumed elsewhere, e.g. by a send.
    fn clear_error_readiness(&self) {
        let would_block = || Err::<(), _>(io::Error::from(io::ErrorKind::WouldBlock));
        let _ = match self {
            DatagramHandle::Udp(socket) => socket.try_io(Interest::ERROR, would_block),
            DatagramHandle::Unix(socket) => socket.try_io(Interest::ERROR, would_block),
        };
    }

    fn local_address(&self) -> Option<String> {
        match self {
            DatagramHandle::Udp(socket) => socket.local_addr().ok().map(|addr| addr.to_string()),
            DatagramHandle::Unix(socket) => socket
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|path| path.display().to_string())),
        }
    }
}

impl Readiness for DatagramHandle {
    /// Error readiness wakes the watcher too, so a failed socket is noticed.
    async fn readable(&self) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::ERROR;
        let ready = match self {
            DatagramHandle::Udp(socket) => socket.ready(interest).await?,
            DatagramHandle::Unix(socket) => socket.ready(interest).await?,
        };
        trace!("Datagram readiness {:?}", ready);
        Ok(())
    }
}

struct DatagramState {
    /// `None` once closed.
    handle: Option<Arc<DatagramHandle>>,
    reader: Option<oneshot::Sender<Option<Packet>>>,
}

impl DatagramState {
    fn has_reader(&self) -> bool {
        self.reader.as_ref().is_some_and(|reader| !reader.is_closed())
    }

    fn finish(&mut self, packet: Option<Packet>) {
        if let Some(reader) = self.reader.take() {
            // The receiver is gone if the receive future was dropped.
            let _ = reader.send(packet);
        }
    }
}

fn lock(state: &Mutex<DatagramState>) -> MutexGuard<'_, DatagramState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reactor-driven datagram socket.
///
/// At most one receive may be outstanding. The readable watcher is only enabled while
/// one is.
pub struct DatagramSocket {
    state: Arc<Mutex<DatagramState>>,
    reactor: Reactor,
    watcher: WatcherId,
    local_address: Option<String>,
}

impl DatagramSocket {
    /// Bind `udp://ip:port` (port 0 picks an ephemeral port) or `udg://path`.
    pub async fn bind(uri: &str, reactor: Reactor) -> Result<Self> {
        let (scheme, target) = uri
            .split_once("://")
            .ok_or_else(|| SockPoolError::invalid_destination(uri, "missing scheme"))?;

        let handle = match scheme.parse::<Scheme>() {
            Ok(Scheme::Udp) => DatagramHandle::Udp(UdpSocket::bind(target).await?),
            Ok(Scheme::Udg) | Ok(Scheme::Unix) => DatagramHandle::Unix(UnixDatagram::bind(target)?),
            _ => {
                return Err(SockPoolError::invalid_destination(
                    uri,
                    "datagram sockets bind udp:// or udg:// addresses",
                ))
            }
        };

        Ok(Self::new(handle, reactor))
    }

    pub fn new(handle: DatagramHandle, reactor: Reactor) -> Self {
        Self::with_chunk_size(handle, reactor, DEFAULT_CHUNK_SIZE)
    }

    /// `chunk_size` bounds a single received datagram; longer ones are truncated.
    pub fn with_chunk_size(handle: DatagramHandle, reactor: Reactor, chunk_size: usize) -> Self {
        let local_address = handle.local_address();
        let handle = Arc::new(handle);
        let state = Arc::new(Mutex::new(DatagramState {
            handle: Some(Arc::clone(&handle)),
            reader: None,
        }));

        let watcher = reactor.on_readable(
            handle,
            read_callback(Arc::downgrade(&state), reactor.clone(), chunk_size),
        );

        debug!(
            "Datagram socket on {} registered as {}",
            local_address.as_deref().unwrap_or("<unnamed>"),
            watcher
        );

        Self {
            state,
            reactor,
            watcher,
            local_address,
        }
    }

    /// Wait for the next datagram. `Ok(None)` means the socket is closed.
    pub async fn receive(&self) -> Result<Option<Packet>> {
        let reader = {
            let mut state = lock(&self.state);
            if state.has_reader() {
                return Err(SockPoolError::PendingOperation);
            }
            if state.handle.is_none() {
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            state.reader = Some(tx);
            rx
        };

        self.reactor.enable(self.watcher);
        Ok(reader.await.unwrap_or(None))
    }

    /// Send `packet` to its address without waiting for writability.
    pub fn send(&self, packet: &Packet) -> Result<usize> {
        let state = lock(&self.state);
        let handle = state.handle.as_ref().ok_or_else(|| {
            SockPoolError::Socket(io::Error::new(
                io::ErrorKind::NotConnected,
                "datagram socket is closed",
            ))
        })?;

        let sent = handle
            .try_send_to(packet.data(), packet.address())
            .map_err(SockPoolError::Socket)?;
        trace!("Sent {} bytes to {}", sent, packet.address());
        Ok(sent)
    }

    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).handle.is_none()
    }

    /// Close the socket. An outstanding receive resolves with `Ok(None)`.
    pub fn close(&self) {
        self.reactor.cancel(self.watcher);
        let mut state = lock(&self.state);
        if state.handle.take().is_some() {
            trace!("Closed datagram socket {}", self.watcher);
        }
        state.finish(None);
    }

    pub fn reference(&self) {
        self.reactor.reference(self.watcher);
    }

    pub fn unreference(&self) {
        self.reactor.unreference(self.watcher);
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_callback(
    state: Weak<Mutex<DatagramState>>,
    reactor: Reactor,
    chunk_size: usize,
) -> impl FnMut(WatcherId) + Send + 'static {
    let mut buf = vec![0u8; chunk_size];

    move |watcher| {
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut state = lock(&state);

        // Leave the datagram queued if the receive future was dropped.
        if !state.has_reader() {
            reactor.disable(watcher);
            return;
        }
        let Some(handle) = state.handle.clone() else {
            return;
        };

        let received = match handle.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => handle.try_recv_from(&mut buf),
        };

        match received {
            Ok((len, address)) => {
                reactor.disable(watcher);
                trace!("Received {} bytes from {}", len, address);
                state.finish(Some(Packet::new(Bytes::copy_from_slice(&buf[..len]), address)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => handle.clear_error_readiness(),
            Err(e) => {
                warn!("Datagram read failed, closing socket: {}", e);
                reactor.cancel(watcher);
                state.handle = None;
                state.finish(None);
            }
        }
    }
}
