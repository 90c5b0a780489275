//! SOCKS5 server side of the bridge
//!
//! - CONNECT only
//! - No authentication, or username/password carrying transport arguments
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)

pub mod address;
pub mod auth;
pub mod commands;
pub mod protocol;
pub mod server;

pub use protocol::ReplyCode;
pub use server::{SocksConn, SocksListener, SocksRequest};
