use crate::args::PtArgs;
use crate::error::Result;
use crate::socks5::{
    auth::negotiate_auth,
    commands::{UNSPECIFIED_BIND, read_connect_request, send_reply},
    protocol::ReplyCode,
};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tracing::info;

/// SocksListener is the local SOCKS5 endpoint of a dial-based transport
pub struct SocksListener {
    listener: TcpListener,
}

/// SocksListener implementation block
impl SocksListener {
    /// bind opens the listener; port 0 lets the OS choose
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        // DEBUG
        info!("SOCKS5 listener bound on {:?}", listener.local_addr()?);

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// accept returns the next raw connection; the SOCKS handshake runs
    /// later in the connection's own task
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

/// SocksRequest is what a client asked for during the handshake
#[derive(Debug, Clone)]
pub struct SocksRequest {
    /// host:port to reach through the transport
    pub target: String,
    /// Transport arguments from the username/password fields
    pub args: PtArgs,
}

/// SocksConn is a connection that completed the handshake and awaits
/// either grant or reject
pub struct SocksConn<S> {
    stream: S,
    pub request: SocksRequest,
}

/// SocksConn implementation block
impl<S> SocksConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// handshake negotiates authentication and reads the CONNECT request
    pub async fn handshake(mut stream: S) -> Result<Self> {
        // Negotiate authentication with client
        let args = negotiate_auth(&mut stream).await?;

        // Handle connection request from client
        let target = read_connect_request(&mut stream).await?;

        Ok(Self {
            stream,
            request: SocksRequest { target, args },
        })
    }

    /// grant answers with success and hands back the stream for relaying
    pub async fn grant(mut self) -> Result<S> {
        send_reply(&mut self.stream, ReplyCode::Succeeded, UNSPECIFIED_BIND).await?;
        Ok(self.stream)
    }

    /// reject answers with reply_code and drops the connection
    pub async fn reject(mut self, reply_code: ReplyCode) -> Result<()> {
        send_reply(&mut self.stream, reply_code, UNSPECIFIED_BIND).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn handshake_then_reject() {
        let (mut client, server) = duplex(1024);
        let mut bytes = vec![0x05, 0x01, 0x02, 0x01, 3];
        bytes.extend_from_slice(b"x=y");
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90]);
        client.write_all(&bytes).await.unwrap();

        let conn = SocksConn::handshake(server).await.unwrap();
        assert_eq!(conn.request.target, "10.0.0.1:8080");
        assert_eq!(conn.request.args.get("x"), Some("y"));

        conn.reject(ReplyCode::ServerFailure).await.unwrap();

        // method choice + auth status + reply
        let mut reply = [0u8; 14];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x02, 0x01, 0x00]);
        assert_eq!(reply[5], ReplyCode::ServerFailure as u8);
    }

    #[tokio::test]
    async fn listener_accepts() {
        let listener = SocksListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await });

        let (_stream, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        connect.await.unwrap().unwrap();
    }
}
