use crate::error::{Error, Result};
use crate::socks5::protocol::AddressType;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// parse_address_from_stream contains logic to parse the network address
/// from an incoming client connection request: IPv4, IPv6, or domain name.
/// The address type byte has already been read by the caller
pub async fn parse_address_from_stream<S>(stream: &mut S, addr_type: AddressType) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    // Match type and extract address or domain name
    let host = match addr_type {
        AddressType::IPv4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        AddressType::DomainName => {
            // First octet in DomainName contains the number of
            // octets to follow
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(Error::Socks("domain length cannot be 0".into()));
            }

            // Read domain and convert to string
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|e| Error::Socks(format!("invalid domain: {e}")))?
        }
        AddressType::IPv6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            // Bracketed so the result stays a valid host:port
            format!("[{}]", Ipv6Addr::from(addr))
        }
    };

    // Read port -> BigEndian (network order)
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(format!("{host}:{port}"))
}
