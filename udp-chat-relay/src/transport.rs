//! UDP transport adapter.
//!
//! [`Transport`] owns the relay's single socket and moves raw bytes only;
//! decoding happens in [`crate::message`]. Sending goes through the
//! [`DatagramSink`] seam so the router can be driven against a fake sink.

use std::{future::Future, io, net::SocketAddr};

use tokio::net::UdpSocket;

/// Anything that can deliver one datagram to an address.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(
        &self,
        bytes: &[u8],
        to: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    max_datagram: usize,
}

impl Transport {
    /// Binds the relay socket. Port 0 lets the OS pick an ephemeral port.
    pub async fn bind(addr: SocketAddr, max_datagram: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            max_datagram,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives the next datagram. Anything past `max_datagram` bytes is
    /// truncated by the OS and will fail to decode downstream.
    pub async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; self.max_datagram];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, peer))
    }
}

impl DatagramSink for Transport {
    async fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, to).await?;
        Ok(())
    }
}
