use crate::error::{CollieError, Result};
use crate::transport::tcp::configure_stream;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Listens for incoming TCP connections on a bound address.
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Bind a listener. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CollieError::transport_with_source(format!("bind {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CollieError::transport_with_source("local_addr", e))?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next connection, configured for low latency.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| CollieError::transport_with_source("accept", e))?;
        configure_stream(&stream);
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
