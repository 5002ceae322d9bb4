//! One UDP socket, many logical connections
//!
//! In server mode every remote `(address, port)` seen on the shared socket
//! becomes a pseudo-connection. Pseudo-connections only reference the
//! socket; dropping one removes it from the demultiplexer's table while the
//! socket keeps serving everyone else. Closing the demultiplexer ends every
//! pseudo-connection.
//!
//! In client mode a connection owns a socket aimed at one remote, and every
//! datagram arriving on it is treated as data.

use crate::MAX_DATAGRAM;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

struct DemuxTable {
    connections: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>>,
    closed: AtomicBool,
}

impl DemuxTable {
    fn remove(&self, remote: &SocketAddr) {
        if self.connections.lock().remove(remote).is_some() {
            trace!("UDP pseudo-connection {} removed", remote);
        }
    }
}

/// Server-mode demultiplexer over a bound UDP socket
pub struct UdpDemux {
    socket: Arc<UdpSocket>,
    table: Arc<DemuxTable>,
    accept_rx: mpsc::UnboundedReceiver<UdpConnection>,
    recv_task: JoinHandle<()>,
}

impl UdpDemux {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let table = Arc::new(DemuxTable {
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let recv_task = tokio::spawn(recv_loop(socket.clone(), table.clone(), accept_tx));

        Ok(Self {
            socket,
            table,
            accept_rx,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Next pseudo-connection from a new remote; `None` once closed
    pub async fn accept(&mut self) -> Option<UdpConnection> {
        self.accept_rx.recv().await
    }

    pub fn connection_count(&self) -> usize {
        self.table.connections.lock().len()
    }

    /// Stop reading and end every pseudo-connection
    pub fn close(&mut self) {
        if self.table.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.recv_task.abort();
        self.accept_rx.close();
        let dropped = {
            let mut connections = self.table.connections.lock();
            let count = connections.len();
            connections.clear();
            count
        };
        debug!("UDP demux closed, {} pseudo-connections ended", dropped);
    }
}

impl Drop for UdpDemux {
    fn drop(&mut self) {
        self.close();
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    table: Arc<DemuxTable>,
    accept_tx: mpsc::UnboundedSender<UdpConnection>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here; keep serving
                warn!("UDP receive error: {}", e);
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);

        let mut connections = table.connections.lock();
        if let Some(tx) = connections.get(&remote) {
            if tx.send(datagram).is_ok() {
                continue;
            }
            connections.remove(&remote);
            continue;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(datagram);
        connections.insert(remote, tx);
        drop(connections);

        trace!("UDP pseudo-connection from {}", remote);
        let connection = UdpConnection {
            socket: socket.clone(),
            remote,
            rx,
            owner: Owner::Demux(Arc::downgrade(&table)),
        };
        if accept_tx.send(connection).is_err() {
            table.remove(&remote);
        }
    }
}

enum Owner {
    /// Pseudo-connection sharing the demultiplexer's socket
    Demux(Weak<DemuxTable>),
    /// Client socket with its own receive task
    Client(JoinHandle<()>),
}

/// A logical UDP connection to one remote endpoint
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    rx: mpsc::UnboundedReceiver<Bytes>,
    owner: Owner,
}

impl UdpConnection {
    /// Client mode: a fresh socket whose datagrams all count as data
    pub async fn connect(remote: SocketAddr) -> io::Result<Self> {
        let unspecified = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = socket.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader.recv_from(&mut buf).await {
                    Ok((len, _)) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("UDP client receive error: {}", e),
                }
            }
        });

        Ok(Self {
            socket,
            remote,
            rx,
            owner: Owner::Client(task),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, self.remote).await
    }

    /// Next datagram; `None` when the connection or its socket closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn into_split(self) -> (UdpReadHalf, UdpWriteHalf) {
        let writer = UdpWriteHalf {
            socket: self.socket.clone(),
            remote: self.remote,
        };
        (UdpReadHalf { conn: self }, writer)
    }

    fn release(&mut self) {
        match &self.owner {
            Owner::Demux(table) => {
                if let Some(table) = table.upgrade() {
                    table.remove(&self.remote);
                }
            }
            Owner::Client(task) => task.abort(),
        }
        self.rx.close();
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct UdpReadHalf {
    conn: UdpConnection,
}

impl UdpReadHalf {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.conn.recv().await
    }
}

pub struct UdpWriteHalf {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpWriteHalf {
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, self.remote).await
    }
}
