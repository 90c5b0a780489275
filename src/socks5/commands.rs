use crate::error::{Error, Result};
use crate::socks5::address::parse_address_from_stream;
use crate::socks5::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bound address reported to clients; the bridge has no meaningful one
pub const UNSPECIFIED_BIND: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    0,
);

/// read_connect_request checks the incoming request for SOCKS5 version number
/// and command and returns the requested target. Anything but CONNECT is
/// answered with an error reply
pub async fn read_connect_request<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Instantiate a request buffer & read
    let mut reqbuf = [0u8; 4];
    stream.read_exact(&mut reqbuf).await?;

    // Parse
    let version = reqbuf[0];
    let command = reqbuf[1];
    // Not checking RSV (RESERVED) -> 0x00
    let atyp = reqbuf[3];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(Error::Socks(format!("unsupported SOCKS version: {version}")));
    }

    let Some(addr_type) = AddressType::from_byte(atyp) else {
        send_reply(stream, ReplyCode::AddrTypeUnsupported, UNSPECIFIED_BIND).await?;
        return Err(Error::Socks(format!("unsupported address type: {atyp}")));
    };

    // Check command and route
    match Command::from_byte(command) {
        Some(Command::Connect) => parse_address_from_stream(stream, addr_type).await,
        Some(Command::Bind) => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED_BIND).await?;
            Err(Error::Socks("BIND not supported".into()))
        }
        Some(Command::UdpAssociate) => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED_BIND).await?;
            Err(Error::Socks("UDP ASSOCIATE not supported".into()))
        }
        None => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED_BIND).await?;
            Err(Error::Socks(format!("unknown command: {command}")))
        }
    }
}

/// send_reply handles logic for sending replies from the SOCKS server to
/// the client
pub async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode, bound_addr: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Build initial reply vec
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];

    // Parse bound_addr as IPv4/6 and finish build accordingly
    match bound_addr {
        SocketAddr::V4(addr) => {
            reply.push(AddressType::IPv4 as u8);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(AddressType::IPv6 as u8);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    // Write reply
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}
