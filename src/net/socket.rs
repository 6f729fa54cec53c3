//! UDP endpoint shared by the host and viewer sides
//!
//! One socket per process. Setup failures surface as errors; steady-state
//! send/recv failures are logged at debug and treated as transient drops,
//! since the protocol recovers on the next tick.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use tracing::debug;

use crate::constants::SOCKET_BUFFER_SIZE;
use crate::error::NetworkError;
use crate::protocol::MAX_UDP_PAYLOAD;

/// A bound UDP socket with timed blocking receive.
///
/// Concurrent `send_to` and `recv_from` from different threads are
/// supported; the OS socket is the only shared state. Exactly one thread
/// must be the receiver.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Bind to a fixed port on all interfaces (host side).
    ///
    /// Pass port 0 to let the OS choose (useful in tests); the actual port
    /// is available via [`local_addr`](Self::local_addr).
    pub fn bind(port: u16) -> Result<Self, NetworkError> {
        Self::bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), true)
    }

    /// Bind to an ephemeral port (viewer side).
    pub fn bind_ephemeral() -> Result<Self, NetworkError> {
        Self::bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), false)
    }

    fn bind_addr(addr: SocketAddrV4, reuse: bool) -> Result<Self, NetworkError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            NetworkError::SocketOption(format!("socket creation failed: {e}"))
        })?;

        if reuse {
            socket
                .set_reuse_address(true)
                .map_err(|e| NetworkError::SocketOption(format!("SO_REUSEADDR: {e}")))?;
        }
        socket
            .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| NetworkError::SocketOption(format!("SO_RCVBUF: {e}")))?;
        socket
            .set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| NetworkError::SocketOption(format!("SO_SNDBUF: {e}")))?;

        socket
            .bind(&SocketAddr::V4(addr).into())
            .map_err(|e| NetworkError::BindFailed {
                port: addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            socket: socket.into(),
        })
    }

    /// Set the blocking-receive timeout.
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<(), NetworkError> {
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| NetworkError::SocketOption(format!("SO_RCVTIMEO: {e}")))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::SocketOption(e.to_string()))
    }

    /// Send one datagram. Transient failures are logged and swallowed.
    pub fn send_to(&self, buf: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(buf, dest) {
            debug!("send_to {} failed: {}", dest, e);
        }
    }

    /// Receive one datagram, or None on timeout / transient error.
    pub fn recv_from(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        match self.socket.recv_from(&mut buf) {
            Ok((n, source)) => {
                buf.truncate(n);
                Some((buf, source))
            }
            Err(e) => {
                if !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                    debug!("recv_from failed: {}", e);
                }
                None
            }
        }
    }
}
