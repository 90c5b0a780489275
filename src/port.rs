//! Local port allocation
//!
//! A port counts as available when nothing accepts a TCP connection on
//! it. The probe is inherently racy: another process may bind the port
//! between the probe and our own bind, which then fails the start.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::{
    net::{TcpListener, TcpStream},
    time::{self, Instant},
};
use tracing::{debug, warn};

/// Upper bound for a single probe connection
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// is_port_available reports whether nothing listens on 127.0.0.1:port
pub async fn is_port_available(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => false,
        // Refused or timed out
        Ok(Err(_)) | Err(_) => true,
    }
}

/// find_port probes preferred, preferred+1, ... and returns the first
/// available port.
///
/// There is no upper bound: past 65535 probing wraps around to 1, so a
/// fully occupied port space keeps this future pending forever.
pub async fn find_port(preferred: u16) -> u16 {
    let mut port = preferred.max(1);
    while !is_port_available(port).await {
        debug!("port {port} in use, probing next");
        port = port.checked_add(1).unwrap_or(1);
    }
    port
}

/// ephemeral_port asks the OS for a currently unused port
pub async fn ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// wait_until_listening polls port until something accepts connections
/// or the window elapses. Returns whether the port came up
pub async fn wait_until_listening(port: u16, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if !is_port_available(port).await {
            return true;
        }
        if Instant::now() >= deadline {
            warn!("nothing listening on port {port} after {window:?}");
            return false;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// occupied_pair binds two consecutive ports and returns them with
    /// the first port number
    async fn occupied_pair() -> (TcpListener, TcpListener, u16) {
        loop {
            let first = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let port = first.local_addr().unwrap().port();
            if port > u16::MAX - 2 {
                continue;
            }
            let Ok(second) = TcpListener::bind((Ipv4Addr::LOCALHOST, port + 1)).await else {
                continue;
            };
            if is_port_available(port + 2).await {
                return (first, second, port);
            }
        }
    }

    #[tokio::test]
    async fn find_port_skips_occupied_ports() {
        let (_a, _b, port) = occupied_pair().await;
        assert_eq!(find_port(port).await, port + 2);
    }

    #[tokio::test]
    async fn find_port_returns_free_preferred_port() {
        let port = ephemeral_port().await.unwrap();
        assert_eq!(find_port(port).await, port);
    }

    #[tokio::test]
    async fn wait_until_listening_sees_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(wait_until_listening(port, Duration::from_millis(200)).await);

        drop(listener);
        assert!(!wait_until_listening(port, Duration::from_millis(100)).await);
    }
}
