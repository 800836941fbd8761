//! Local-network UDP channel.
//! Sends broadcast datagrams to the plugs and listens for their replies.
//!
//! Sending and receiving use separate sockets: the controller sends to the
//! plugs' receive port and listens on the port the plugs reply from, so a
//! broadcast never loops back into our own listener.

use crate::config::UdpConfig;
use crate::error::Result;
use log::{debug, error, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

const RECV_BUFFER_SIZE: usize = 4096;
const QUEUE_CAPACITY: usize = 32;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Datagram transport used for discovery, provisioning and fallback delivery.
pub trait UdpTransport: Send + Sync {
    /// Send one datagram to every plug on the local network.
    fn broadcast(&self, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Bind the receive port and forward every datagram into the returned
    /// queue until `cancel` fires or the receiver is dropped. Binding errors
    /// are returned immediately.
    fn listen(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<u8>>>;
}

/// Network implementation of [`UdpTransport`].
#[derive(Debug, Clone, Default)]
pub struct UdpChannel {
    config: UdpConfig,
}

impl UdpChannel {
    pub fn new(config: UdpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UdpConfig {
        &self.config
    }

    /// Create and configure the receive socket.
    fn create_socket(&self) -> Result<UdpSocket> {
        let addr = SocketAddr::V4(SocketAddrV4::new(self.config.bind_addr, self.config.recv_port));

        debug!("Creating UDP socket for port {}...", self.config.recv_port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on {}: {}", addr, e);
        }

        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on {}: {}", addr, e);
        }

        match socket.bind(&SockAddr::from(addr)) {
            Ok(_) => debug!("Successfully bound to {}", addr),
            Err(e) => {
                error!("Failed to bind to {}: {}", addr, e);
                return Err(e.into());
            }
        }

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

impl UdpTransport for UdpChannel {
    async fn broadcast(&self, payload: &[u8]) -> Result<()> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let len = socket.send_to(payload, self.config.send_addr).await?;
        debug!("Sent {} bytes to {}", len, self.config.send_addr);
        Ok(())
    }

    fn listen(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<u8>>> {
        let socket = self.create_socket()?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    res = socket.recv_from(&mut buf) => {
                        match res {
                            Ok((len, addr)) => {
                                debug!("Received UDP packet from {}: {} bytes", addr, len);
                                if tx.send(buf[..len].to_vec()).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Error occurred while reading: {}", e);
                                sleep(READ_ERROR_BACKOFF).await;
                            }
                        }
                    }
                }
            }
            debug!("UDP listener stopped");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .and_then(|s| s.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    fn loopback(port: u16) -> UdpChannel {
        UdpChannel::new(
            UdpConfig::default()
                .with_bind_addr(Ipv4Addr::LOCALHOST)
                .with_recv_port(port)
                .with_send_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port))),
        )
    }

    #[tokio::test]
    async fn broadcast_reaches_listener() {
        let channel = loopback(free_port());
        let cancel = CancellationToken::new();
        let mut rx = channel.listen(cancel.clone()).unwrap();

        channel.broadcast(br#"{"cmd":"device report"}"#).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, br#"{"cmd":"device report"}"#.to_vec());
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_closes_the_queue_and_releases_the_port() {
        let port = free_port();
        let channel = loopback(port);
        let cancel = CancellationToken::new();
        let mut rx = channel.listen(cancel.clone()).unwrap();

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(end.is_none());

        // The port is free again for a fresh listener.
        let again = CancellationToken::new();
        let _rx = channel.listen(again.clone()).unwrap();
        again.cancel();
    }
}
