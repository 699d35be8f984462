//! Connected UDP session with a receive deadline.
//!
//! [`UdpSession`] owns the one datagram endpoint used for every exchange.  It
//! does only byte I/O: framing lives in [`crate::packet`] and correlation in
//! [`crate::exchange`].  The [`Transport`] trait is the seam the exchange
//! engine talks to, so tests can substitute a scripted transport.
//!
//! Receive outcomes are three-way:
//! - [`Received::Datagram`] — a datagram arrived (possibly zero bytes long),
//! - [`Received::TimedOut`] — the configured deadline elapsed,
//! - `Err(TransportError)` — a genuine I/O failure (ICMP unreachable, ...).

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use thiserror::Error;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result of one [`Transport::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A datagram of this many bytes was written into the buffer.
    Datagram(usize),
    /// No datagram arrived before the deadline.
    TimedOut,
}

/// Datagram transport used by the exchange engine.
pub trait Transport {
    /// Send `datagram` as exactly one datagram.
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Block until a datagram arrives or the deadline elapses.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Received, TransportError>;
}

/// Read-timeout expiry shows up as `WouldBlock` on Unix and `TimedOut` on
/// Windows.
fn is_deadline_error(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// A datagram that went out short is an I/O failure, never a partial success.
fn check_sent(sent: usize, len: usize) -> Result<(), TransportError> {
    if sent != len {
        return Err(TransportError::Io(io::Error::new(
            ErrorKind::WriteZero,
            format!("short send: {sent} of {len} bytes"),
        )));
    }
    Ok(())
}

/// Resolve `host:port`, preferring an IPv4 address when both families exist.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::NoAddress(host.to_string()))
}

/// A connected UDP socket plus its receive deadline.
#[derive(Debug)]
pub struct UdpSession {
    socket: UdpSocket,
    peer: SocketAddr,
    timeout: Option<Duration>,
}

impl UdpSession {
    /// Resolve `host`, bind an ephemeral local port and connect to the server.
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let peer = resolve(host, port)?;
        log::info!("[session] resolved {host} to {peer}");

        let local = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local)?;
        Self::from_socket(socket, peer)
    }

    /// Connect an already bound socket to `peer`.
    pub fn from_socket(socket: UdpSocket, peer: SocketAddr) -> Result<Self, TransportError> {
        socket.connect(peer)?;
        log::info!("[session] connected to {peer}");
        Ok(Self {
            socket,
            peer,
            timeout: None,
        })
    }

    /// Set the deadline applied to every subsequent [`Transport::receive`].
    ///
    /// A zero duration is rejected by the OS layer as an I/O error.
    pub fn configure_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.socket.set_read_timeout(Some(timeout))?;
        self.timeout = Some(timeout);
        log::info!("[session] receive timeout configured: {timeout:?}");
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpSession {
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        let sent = self.socket.send(datagram)?;
        check_sent(sent, datagram.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Received, TransportError> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Received::Datagram(n)),
            Err(e) if is_deadline_error(&e) => Ok(Received::TimedOut),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}
