//! Contracts the controller expects from transport backends
//!
//! Two shapes exist. A dial-based transport hands out a [`ClientFactory`]
//! whose `dial` the SOCKS bridge calls once per accepted connection. An
//! embedded transport runs its own listener on a port the controller
//! picks, and is only started and stopped from here.

use anyhow::Result;
use async_trait::async_trait;
use std::{
    any::Any,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{args::PtArgs, config::Config, proxy::Dialer};

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// The connection a transport returns from `dial`
pub type BoxedStream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Transport-native arguments produced by `parse_args` and consumed by
/// the same factory's `dial`
pub type ParsedArgs = Box<dyn Any + Send + Sync>;

/// Network names passed through to `dial`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
}

/// PluggableTransport is a dial-based backend
pub trait PluggableTransport: Send + Sync {
    /// client_factory prepares a factory using state_dir for any state
    /// the transport keeps
    fn client_factory(&self, state_dir: &Path) -> Result<Arc<dyn ClientFactory>>;
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// parse_args validates the merged per-connection arguments
    fn parse_args(&self, args: &PtArgs) -> Result<ParsedArgs>;

    /// dial opens a transport connection to target, reaching the network
    /// through dialer
    async fn dial(
        &self,
        network: Network,
        target: &str,
        dialer: Arc<dyn Dialer>,
        args: ParsedArgs,
    ) -> Result<BoxedStream>;
}

/// EmbeddedLaunch carries everything an embedded backend needs to start
#[derive(Debug, Clone)]
pub struct EmbeddedLaunch {
    pub name: String,
    /// Local port the backend must listen on
    pub port: u16,
    pub state_dir: PathBuf,
    /// Local address of the transport this one fronts, if any
    pub upstream: Option<SocketAddr>,
    /// Upstream proxy URL handed to `Controller::start`
    pub proxy: Option<String>,
    pub config: Arc<Config>,
}

/// EmbeddedTransport is a backend that owns its listener.
///
/// `start` returns once the backend has launched its own background
/// work; an error here means nothing was launched. `stop` asks the
/// backend to shut down, must tolerate repeated calls, and gives no
/// confirmation.
#[async_trait]
pub trait EmbeddedTransport: Send + Sync {
    async fn start(&self, launch: EmbeddedLaunch) -> Result<()>;

    async fn stop(&self);
}

/// Dummy is a no-op dial-based transport. It connects to the requested
/// target unchanged, through the upstream proxy if one is configured
pub struct Dummy;

impl PluggableTransport for Dummy {
    fn client_factory(&self, _state_dir: &Path) -> Result<Arc<dyn ClientFactory>> {
        Ok(Arc::new(Dummy))
    }
}

#[async_trait]
impl ClientFactory for Dummy {
    fn parse_args(&self, _args: &PtArgs) -> Result<ParsedArgs> {
        Ok(Box::new(()))
    }

    async fn dial(
        &self,
        _network: Network,
        target: &str,
        dialer: Arc<dyn Dialer>,
        _args: ParsedArgs,
    ) -> Result<BoxedStream> {
        let stream = dialer.dial(target).await?;
        Ok(Box::new(stream))
    }
}
