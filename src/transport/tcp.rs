//! TCP socket helpers.
//!
//! # Example
//!
//! ```ignore
//! use wirelink::transport::{bind, connect};
//!
//! let listener = bind("127.0.0.1:0", 128).await?;
//! let stream = connect(&listener.local_addr()?.to_string(), Duration::from_secs(5)).await?;
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::{Result, WireError};

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        WireError::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", addr),
        ))
    })
}

/// Bind a listener on `addr` with the given accept backlog.
pub async fn bind(addr: &str, backlog: u32) -> Result<TcpListener> {
    let addr = resolve(addr).await?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

/// Connect to `addr`, giving up after `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(WireError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out after {:?}", addr, timeout),
        ))),
    }
}

/// Apply per-connection socket options.
pub fn configure(stream: &TcpStream, nodelay: bool) -> Result<()> {
    stream.set_nodelay(nodelay)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_connect() {
        let listener = bind("127.0.0.1:0", 16).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (client, accepted) = tokio::join!(
            connect(&addr, Duration::from_secs(1)),
            listener.accept()
        );
        let client = client.unwrap();
        let (server_side, peer) = accepted.unwrap();

        configure(&client, true).unwrap();
        assert!(client.nodelay().unwrap());
        assert_eq!(peer, client.local_addr().unwrap());
        drop(server_side);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let addr = bind("127.0.0.1:0", 1).await.unwrap().local_addr().unwrap();

        let result = connect(&addr.to_string(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        assert!(bind("not an address", 1).await.is_err());
    }
}
