//! Error types for the transport controller

use std::{io, net::SocketAddr};
use thiserror::Error;

/// Error covers both start-time failures, which are returned from
/// `Controller::start`, and per-connection failures, which are only
/// handed to the stop notifier
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("invalid proxy address {url:?}: {reason}")]
    InvalidProxyAddress { url: String, reason: String },

    #[error("failed to listen on {addr}: {source}")]
    ListenFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialize {name}: {source}")]
    ClientFactory {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to start {name}: {source}")]
    EmbeddedStartFailure {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("error parsing transport arguments: {0}")]
    ArgumentParseFailure(#[source] anyhow::Error),

    #[error("error getting proxy dialer: {0}")]
    ProxyDialer(String),

    #[error("error dialing transport: {0}")]
    DialFailure(#[source] anyhow::Error),

    #[error("SOCKS protocol error: {0}")]
    Socks(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
