use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Bind the first candidate port that is free on `host`.
///
/// Port `0` in the candidate list asks the OS for an ephemeral port. Returns the
/// listener and the port actually bound.
pub async fn bind_first_available(host: &str, ports: &[u16]) -> std::io::Result<(TcpListener, u16)> {
    let mut last_err = None;
    for &port in ports {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                tracing::info!(port = bound, "TCP listener bound");
                return Ok((listener, bound));
            }
            Err(e) => {
                tracing::debug!(port, error = %e, "TCP port unavailable, trying next");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no candidate TCP ports configured")
    }))
}

/// Open a TCP connection, giving up after `timeout`.
pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(res) => {
            let stream = res?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {} timed out", addr),
        )),
    }
}
