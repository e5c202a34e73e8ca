//! Async TCP helpers for peer sessions.

use concord_proto::{ConcordError, ConcordResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a remote node by host name and port.
pub async fn connect_to(host: &str, port: u16) -> ConcordResult<TcpStream> {
    let target = format!("{}:{}", host, port);
    debug!("connecting to {}", target);

    let stream = TcpStream::connect(&target)
        .await
        .map_err(|_| ConcordError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Create a TCP listener on the given address and port.
///
/// Port 0 binds an ephemeral port; read it back from the returned
/// listener's `local_addr`.
pub async fn create_listen_socket(bind_addr: &str, port: u16) -> ConcordResult<TcpListener> {
    let addr = format!("{}:{}", bind_addr, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        ConcordError::SystemError
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}

/// Local address of a bound listener.
pub fn listen_addr(listener: &TcpListener) -> ConcordResult<SocketAddr> {
    listener.local_addr().map_err(|_| ConcordError::SystemError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_and_connect() {
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let addr = listen_addr(&listener).unwrap();
        assert_ne!(addr.port(), 0);

        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });
        let stream = connect_to("127.0.0.1", addr.port()).await.unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = create_listen_socket("127.0.0.1", 0).await.unwrap();
        let port = listen_addr(&listener).unwrap().port();
        drop(listener);

        let err = connect_to("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err, ConcordError::NetworkError);
    }
}
