use crate::args::PtArgs;
use crate::error::{Error, Result};
use crate::socks5::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// negotiate_auth handles authentication negotiation between the SOCKS server and client.
///
/// Username/password is not used for access control: the two fields
/// carry the connection's transport arguments. Returns those arguments,
/// empty when the client chose no authentication
pub async fn negotiate_auth<S>(stream: &mut S) -> Result<PtArgs>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    // Instantiate handshake buffer & read
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    // Parse version and client methods from handshake
    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(Error::Socks(format!("unsupported SOCKS version: {version}")));
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    // Retrieve desired method
    let method = select_auth_method(&methods);

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+

    // Write response to client with selected method
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;

    // Route to appropriate auth handler
    match method {
        AuthMethod::UserPass => read_transport_args(stream).await,
        AuthMethod::NoAuth => Ok(PtArgs::new()),
        AuthMethod::NoAcceptable => Err(Error::Socks("no acceptable auth method".into())),
    }
}

/// read_transport_args reads an RFC 1929 request and decodes the
/// concatenated username and password as transport arguments
async fn read_transport_args<S>(stream: &mut S) -> Result<PtArgs>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    // Get subnegotiation version -> 0x01 expected
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;

    if ver[0] != USERPASS_VERSION {
        return Err(Error::Socks(format!(
            "invalid username/password subnegotiation version: {}",
            ver[0]
        )));
    }

    // Read username
    let mut username_len = [0u8; 1];
    stream.read_exact(&mut username_len).await?;
    let mut username = vec![0u8; username_len[0] as usize];
    stream.read_exact(&mut username).await?;

    // Read password
    let mut password_len = [0u8; 1];
    stream.read_exact(&mut password_len).await?;
    let mut password = vec![0u8; password_len[0] as usize];
    stream.read_exact(&mut password).await?;

    // A lone NUL password only fills the mandatory field
    let mut raw = username;
    if password != [0u8] {
        raw.extend_from_slice(&password);
    }

    let parsed = std::str::from_utf8(&raw)
        .map_err(|e| Error::Socks(format!("transport arguments are not UTF-8: {e}")))
        .and_then(|s| {
            PtArgs::parse(s).map_err(|e| Error::Socks(format!("malformed transport arguments: {e}")))
        });

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    let status = match parsed {
        Ok(_) => AuthStatus::Success,
        Err(_) => AuthStatus::Failure,
    };
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

    parsed
}

/// select_auth_method take a reference to a u8 byte array that contains
/// auth methods from the socks client. It then returns the desired
/// auth method
fn select_auth_method(client_methods: &[u8]) -> AuthMethod {
    // Preferred auth method order: username/password first so transport
    // arguments get through
    const PREFERRED_METHODS: &[AuthMethod] = &[AuthMethod::UserPass, AuthMethod::NoAuth];

    // Iterate through preferences in order. If there's a match
    // return it
    for &preferred in PREFERRED_METHODS {
        if client_methods.contains(&(preferred as u8)) {
            return preferred;
        }
    }

    AuthMethod::NoAcceptable
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn prefers_userpass() {
        assert_eq!(select_auth_method(&[0x00, 0x02]), AuthMethod::UserPass);
        assert_eq!(select_auth_method(&[0x00]), AuthMethod::NoAuth);
        assert_eq!(select_auth_method(&[0x01]), AuthMethod::NoAcceptable);
    }

    #[tokio::test]
    async fn decodes_args_from_userpass() {
        let (mut client, mut server) = duplex(1024);
        let uname = b"cert=abc;iat-mode=";
        let mut hello = vec![0x05, 0x02, 0x00, 0x02, 0x01, uname.len() as u8];
        hello.extend_from_slice(uname);
        hello.extend_from_slice(&[1, b'0']);
        client.write_all(&hello).await.unwrap();

        let args = negotiate_auth(&mut server).await.unwrap();
        assert_eq!(args.get("cert"), Some("abc"));
        assert_eq!(args.get("iat-mode"), Some("0"));

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn nul_password_is_ignored() {
        let (mut client, mut server) = duplex(1024);
        let mut hello = vec![0x05, 0x01, 0x02, 0x01, 3];
        hello.extend_from_slice(b"a=1");
        hello.extend_from_slice(&[1, 0]);
        client.write_all(&hello).await.unwrap();

        let args = negotiate_auth(&mut server).await.unwrap();
        assert_eq!(args.get("a"), Some("1"));
        assert_eq!(args.len(), 1);
    }

    #[tokio::test]
    async fn malformed_args_fail_subnegotiation() {
        let (mut client, mut server) = duplex(1024);
        let mut hello = vec![0x05, 0x01, 0x02, 0x01, 5];
        hello.extend_from_slice(b"broke");
        hello.extend_from_slice(&[1, 0]);
        client.write_all(&hello).await.unwrap();

        assert!(negotiate_auth(&mut server).await.is_err());

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn rejects_other_versions() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(matches!(negotiate_auth(&mut server).await, Err(Error::Socks(_))));
    }
}
