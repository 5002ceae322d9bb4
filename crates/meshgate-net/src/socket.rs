//! TCP or UDP socket behind one channel

use crate::backlog::{Backlog, SOCKET_HIGH_WATER};
use crate::udp::{UdpConnection, UdpReadHalf, UdpWriteHalf};
use bytes::{Bytes, BytesMut};
use meshgate_proto::Protocol;
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const READ_BUF: usize = 64 * 1024;
const KEEPALIVE: Duration = Duration::from_secs(60);

/// Idle lifetime of a TCP channel: effectively unbounded (about 21 years)
pub const TCP_IDLE: Duration = Duration::from_secs(21 * 365 * 24 * 60 * 60);
/// Idle lifetime of a UDP channel
pub const UDP_IDLE: Duration = Duration::from_secs(60 * 60);

/// Networking errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: SocketAddr, reason: String },

    #[error("Could not resolve {0}")]
    Resolve(String),
}

/// How long a channel may stay silent before it is reaped
pub fn idle_duration(protocol: Protocol) -> Duration {
    match protocol {
        Protocol::Tcp => TCP_IDLE,
        Protocol::Udp => UDP_IDLE,
    }
}

/// Bind a TCP listener, retrying while the port is in TIME_WAIT
pub async fn bind_tcp_with_retry(addr: SocketAddr) -> Result<TcpListener, NetError> {
    for attempt in 1..=3 {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Bound {} on attempt {}/3", addr, attempt);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3), retrying in 1 second...",
                    addr.port(),
                    attempt
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(NetError::Bind {
                    address: addr,
                    reason: e.to_string(),
                })
            }
        }
    }

    Err(NetError::Bind {
        address: addr,
        reason: "Address in use after 3 attempts".to_string(),
    })
}

fn tune_tcp(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE)) {
        debug!("Failed to enable keepalive: {}", e);
    }
    let _ = stream.set_nodelay(true);
}

/// Socket at one end of a channel
pub enum ChannelSocket {
    Tcp(TcpStream),
    Udp(UdpConnection),
}

impl ChannelSocket {
    /// Wrap an accepted TCP stream
    pub fn accepted_tcp(stream: TcpStream) -> Self {
        tune_tcp(&stream);
        ChannelSocket::Tcp(stream)
    }

    /// Dial a backend service
    pub async fn connect(protocol: Protocol, host: &str, port: u16) -> Result<Self, NetError> {
        match protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect((host, port)).await?;
                tune_tcp(&stream);
                Ok(ChannelSocket::Tcp(stream))
            }
            Protocol::Udp => {
                let addr = tokio::net::lookup_host((host, port))
                    .await?
                    .next()
                    .ok_or_else(|| NetError::Resolve(format!("{}:{}", host, port)))?;
                Ok(ChannelSocket::Udp(UdpConnection::connect(addr).await?))
            }
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ChannelSocket::Tcp(_) => Protocol::Tcp,
            ChannelSocket::Udp(_) => Protocol::Udp,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ChannelSocket::Tcp(stream) => stream.peer_addr(),
            ChannelSocket::Udp(conn) => Ok(conn.peer_addr()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ChannelSocket::Tcp(stream) => stream.local_addr(),
            ChannelSocket::Udp(conn) => conn.local_addr(),
        }
    }

    pub fn into_split(self) -> (SocketReader, SocketWriter) {
        match self {
            ChannelSocket::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (SocketReader::Tcp(read), SocketWriter::Tcp(write))
            }
            ChannelSocket::Udp(conn) => {
                let (read, write) = conn.into_split();
                (SocketReader::Udp(read), SocketWriter::Udp(write))
            }
        }
    }
}

pub enum SocketReader {
    Tcp(OwnedReadHalf),
    Udp(UdpReadHalf),
}

impl SocketReader {
    /// Next chunk of data; `None` at end of stream
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        match self {
            SocketReader::Tcp(half) => {
                let mut buf = BytesMut::with_capacity(READ_BUF);
                match half.read_buf(&mut buf).await? {
                    0 => Ok(None),
                    _ => Ok(Some(buf.freeze())),
                }
            }
            SocketReader::Udp(half) => Ok(half.recv().await),
        }
    }
}

pub enum SocketWriter {
    Tcp(OwnedWriteHalf),
    Udp(UdpWriteHalf),
}

impl SocketWriter {
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            SocketWriter::Tcp(half) => half.write_all(data).await,
            SocketWriter::Udp(half) => half.send(data).await.map(|_| ()),
        }
    }

    pub async fn shutdown(&mut self) {
        if let SocketWriter::Tcp(half) = self {
            let _ = half.shutdown().await;
        }
    }
}

enum SocketCommand {
    Data(Bytes),
    End,
}

/// Write side of a socket driven by background tasks
///
/// Writes queue without waiting; the queue is capped by [`SocketHandle::writable`].
#[derive(Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<SocketCommand>,
    backlog: Arc<Backlog>,
}

impl SocketHandle {
    /// Queue bytes for the socket; false once it has gone away
    pub fn write(&self, data: Bytes) -> bool {
        let len = data.len();
        if self.tx.send(SocketCommand::Data(data)).is_err() {
            return false;
        }
        self.backlog.push(len);
        true
    }

    /// More than the high-water mark is waiting to be written
    pub fn is_congested(&self) -> bool {
        self.backlog.is_full()
    }

    /// Resolves once the queue has drained below the high-water mark or the
    /// socket is gone
    pub fn writable(&self) -> impl Future<Output = ()> + Send + 'static {
        let backlog = self.backlog.clone();
        async move { backlog.writable().await }
    }

    /// Flush queued bytes, then close the socket
    ///
    /// Nobody waits on the queue after this, even while it still flushes.
    pub fn end(&self) {
        let _ = self.tx.send(SocketCommand::End);
        self.backlog.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Run a socket on two tasks
///
/// `on_data` receives every chunk read, and the next read waits for the
/// future it returns; that is how a congested consumer slows the socket
/// down. `on_closed` fires once when the remote side ends or the socket
/// fails, but not after a local `end()`.
pub fn spawn_socket<D, F, C>(socket: ChannelSocket, mut on_data: D, on_closed: C) -> SocketHandle
where
    D: FnMut(Bytes) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
    C: FnOnce(Option<io::Error>) + Send + 'static,
{
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(Backlog::new(SOCKET_HIGH_WATER));
    let drained = backlog.clone();

    let read_task = tokio::spawn(async move {
        let outcome = loop {
            match reader.read().await {
                Ok(Some(data)) => on_data(data).await,
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        trace!("Socket reader finished");
        on_closed(outcome);
    });

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SocketCommand::Data(data) => {
                    let written = writer.write(&data).await;
                    drained.pop(data.len());
                    if let Err(e) = written {
                        debug!("Socket write failed: {}", e);
                        break;
                    }
                }
                SocketCommand::End => {
                    writer.shutdown().await;
                    read_task.abort();
                    break;
                }
            }
        }
        drained.close();
    });

    SocketHandle { tx, backlog }
}
