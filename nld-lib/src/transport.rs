//! UDP socket wrapper: bounded outbound queue with an oversize check,
//! grounded on `nld_nld.py::NLDAsyncUDPServer` and the teacher's async
//! socket style (`gnosis_vpn-lib/src/socket/root.rs`).

use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Largest payload a UDP datagram can carry without fragmentation concerns
/// at the IPv4 MTU ceiling, matching the original's `UdpDataSizeError`.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind { addr: SocketAddr, #[source] source: std::io::Error },
    #[error("datagram of {size} bytes exceeds the {MAX_DATAGRAM_SIZE} byte limit")]
    DatagramTooLarge { size: usize },
    #[error("failed to send datagram to {dest}: {source}")]
    Send { dest: SocketAddr, #[source] source: std::io::Error },
    #[error("failed to receive datagram: {0}")]
    Recv(#[source] std::io::Error),
}

pub struct Transport {
    socket: UdpSocket,
    send_queue: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Transport { socket, send_queue: VecDeque::new() })
    }

    /// Validates size and appends to the outbound queue without blocking.
    /// Call [`Self::flush`] to actually push queued datagrams to the wire.
    pub fn enqueue_send(&mut self, dest: SocketAddr, payload: Vec<u8>) -> Result<(), Error> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::DatagramTooLarge { size: payload.len() });
        }
        self.send_queue.push_back((dest, payload));
        Ok(())
    }

    /// Drains the outbound queue, sending every pending datagram.
    pub async fn flush(&mut self) -> Result<(), Error> {
        while let Some((dest, payload)) = self.send_queue.pop_front() {
            self.socket
                .send_to(&payload, dest)
                .await
                .map_err(|source| Error::Send { dest, source })?;
        }
        Ok(())
    }

    /// Waits for and returns the next inbound datagram and its sender.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        self.socket.recv_from(buf).await.map_err(Error::Recv)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
