//! Gates: the listening sockets a gateway exposes per (port, protocol)

use meshgate_net::{bind_tcp_with_retry, ChannelSocket, UdpDemux};
use meshgate_proto::Protocol;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::channel::Channel;
use crate::GatewayError;

enum Listener {
    Tcp(tokio::net::TcpListener),
    Udp(UdpDemux),
}

pub struct Gate {
    gate_port: u16,
    protocol: Protocol,
    local_addr: SocketAddr,
    /// Reconciliation pass that last confirmed this gate
    generation: AtomicU64,
    listener: Mutex<Option<Listener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    channels: Mutex<Vec<Arc<Channel>>>,
}

impl Gate {
    /// Bind the gate's socket; nothing is accepted until [`Gate::start`]
    pub async fn bind(
        ip: IpAddr,
        gate_port: u16,
        protocol: Protocol,
        generation: u64,
    ) -> Result<Self, GatewayError> {
        let addr = SocketAddr::new(ip, gate_port);
        let (listener, local_addr) = match protocol {
            Protocol::Tcp => {
                let listener = bind_tcp_with_retry(addr).await?;
                let local = listener.local_addr()?;
                (Listener::Tcp(listener), local)
            }
            Protocol::Udp => {
                let demux = UdpDemux::bind(addr).await?;
                let local = demux.local_addr()?;
                (Listener::Udp(demux), local)
            }
        };

        info!("Gate open on {} ({})", local_addr, protocol);

        Ok(Self {
            gate_port,
            protocol,
            local_addr,
            generation: AtomicU64::new(generation),
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// Start accepting, handing every new connection to `on_accept`
    pub fn start<F>(&self, on_accept: F)
    where
        F: Fn(ChannelSocket) + Send + Sync + 'static,
    {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let local_addr = self.local_addr;

        let task = tokio::spawn(async move {
            match listener {
                Listener::Tcp(listener) => loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            debug!("Accepted {} on gate {}", peer, local_addr);
                            on_accept(ChannelSocket::accepted_tcp(stream));
                        }
                        Err(e) => {
                            error!("Failed to accept on gate {}: {}", local_addr, e);
                        }
                    }
                },
                Listener::Udp(mut demux) => {
                    while let Some(connection) = demux.accept().await {
                        debug!(
                            "UDP pseudo-connection from {} on gate {}",
                            connection.peer_addr(),
                            local_addr
                        );
                        on_accept(ChannelSocket::Udp(connection));
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
    }

    /// Port the gate was requested on, which routes refer to
    pub fn gate_port(&self) -> u16 {
        self.gate_port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    pub(crate) fn add_channel(&self, channel: Arc<Channel>) {
        self.channels.lock().push(channel);
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().clone()
    }

    /// Forget channels that have closed
    pub(crate) fn prune_closed(&self) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|c| c.is_alive());
        before - channels.len()
    }

    /// Stop accepting and close every channel
    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.listener.lock().take();

        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in &channels {
            channel.close();
        }
        info!(
            "Gate {} ({}) closed with {} channels",
            self.local_addr,
            self.protocol,
            channels.len()
        );
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_tcp_gate_accepts() {
        let gate = Gate::bind(LOCALHOST, 0, Protocol::Tcp, 1).await.unwrap();
        assert_ne!(gate.local_addr().port(), 0);
        assert_eq!(gate.generation(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.start(move |socket| {
            let _ = tx.send(socket.protocol());
        });

        let mut client = tokio::net::TcpStream::connect(gate.local_addr()).await.unwrap();
        client.write_all(b"x").await.unwrap();
        assert_eq!(rx.recv().await, Some(Protocol::Tcp));

        gate.close();
    }

    #[tokio::test]
    async fn test_udp_gate_accepts_per_remote() {
        let gate = Gate::bind(LOCALHOST, 0, Protocol::Udp, 1).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.start(move |socket| {
            let _ = tx.send(socket);
        });

        let a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"1", gate.local_addr()).await.unwrap();
        a.send_to(b"2", gate.local_addr()).await.unwrap();
        b.send_to(b"3", gate.local_addr()).await.unwrap();

        // Held so the pseudo-connections stay registered
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.peer_addr().unwrap(), a.local_addr().unwrap());
        assert_eq!(second.peer_addr().unwrap(), b.local_addr().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_gate_releases_port() {
        let gate = Gate::bind(LOCALHOST, 0, Protocol::Tcp, 1).await.unwrap();
        gate.start(|_| {});
        let addr = gate.local_addr();
        gate.close();
        drop(gate);

        tokio::task::yield_now().await;
        let rebound = Gate::bind(LOCALHOST, addr.port(), Protocol::Tcp, 2).await;
        assert!(rebound.is_ok());
    }
}
