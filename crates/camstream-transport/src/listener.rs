use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use camstream_core::{ConnectionError, ResolvedEndpoint};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Producer-side listening socket on an OS-assigned port.
pub struct FrameListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl FrameListener {
    /// Bind `addr:0` and read back the port the OS picked.
    pub async fn bind(addr: IpAddr) -> Result<Self, ConnectionError> {
        let requested = SocketAddr::new(addr, 0);
        let inner = TcpListener::bind(requested)
            .await
            .map_err(|source| ConnectionError::Bind { addr: requested, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| ConnectionError::Bind { addr: requested, source })?;
        info!("[Transport] listening on {}", local_addr);
        Ok(Self { inner, local_addr })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ConnectionError> {
        let (stream, peer) = self.inner.accept().await.map_err(ConnectionError::Accept)?;
        // frames are tiny; don't let Nagle batch them
        stream.set_nodelay(true).map_err(ConnectionError::Accept)?;
        debug!("[Transport] accepted {}", peer);
        Ok((stream, peer))
    }
}

/// Consumer side: open the socket to a resolved producer.
pub async fn connect(endpoint: &ResolvedEndpoint, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let addr = endpoint.socket_addr();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout { addr, ms: timeout.as_millis() as u64 })?
        .map_err(|source| ConnectionError::Connect { addr, source })?;
    stream.set_nodelay(true).map_err(|source| ConnectionError::Connect { addr, source })?;
    info!("[Transport] connected to {}", endpoint);
    Ok(stream)
}
