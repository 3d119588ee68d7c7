use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::NetStream;

/// TCP transport.
///
/// Provides bind/accept/connect over IPv4 and IPv6 sockets. Every stream
/// handed out has `TCP_NODELAY` set, since messaging frames are small and
/// flushed one at a time.
pub struct TcpTransport {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on the given address.
    ///
    /// Port 0 binds an ephemeral port; use [`TcpTransport::local_addr`] to
    /// discover it.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!(%addr, "listening for messaging connections");

        Ok(Self { listener, addr })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<(NetStream, SocketAddr)> {
        let (stream, remote) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%remote, "accepted connection");
        Ok((NetStream::from_tcp(stream), remote))
    }

    /// Connect to a listening peer (blocking, OS connect timeout).
    pub fn connect(addr: SocketAddr) -> Result<NetStream> {
        let stream =
            TcpStream::connect(addr).map_err(|source| TransportError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected");
        Ok(NetStream::from_tcp(stream))
    }

    /// Connect to a listening peer, giving up after `timeout`.
    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<NetStream> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|source| TransportError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        debug!(%addr, ?timeout, "connected");
        Ok(NetStream::from_tcp(stream))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

/// Resolve `host:port` text to the first matching socket address.
pub fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(address.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Resolve(address.to_string()))
}
