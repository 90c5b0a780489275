//! Per-connection relay task
//!
//! One task per accepted SOCKS connection: finish the SOCKS handshake,
//! resolve the transport arguments, dial through the transport and pipe
//! bytes until one direction ends or the transport is stopped.

use std::{io, net::SocketAddr, sync::Arc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    args::PtArgs,
    error::{Error, Result},
    logging::Scrubbed,
    proxy::{self, ProxyDescriptor},
    socks5::{ReplyCode, SocksConn},
    transport::{ClientFactory, Network},
};

/// TransportStopped is told when a relay task for a transport ends.
///
/// Called exactly once per relay task, from that task, with the error
/// that ended it or None for an orderly finish. Implementations needing
/// another execution context must hand off themselves
pub trait TransportStopped: Send + Sync {
    fn stopped(&self, name: &str, error: Option<&Error>);
}

impl<F> TransportStopped for F
where
    F: Fn(&str, Option<&Error>) + Send + Sync,
{
    fn stopped(&self, name: &str, error: Option<&Error>) {
        self(name, error)
    }
}

/// RelayContext is shared by all relay tasks of one transport lifecycle
pub struct RelayContext {
    pub name: String,
    pub factory: Arc<dyn ClientFactory>,
    /// Upstream proxy wrapped around the transport's dialer
    pub proxy: Option<ProxyDescriptor>,
    /// Controller-supplied arguments merged into every connection
    pub extra_args: Option<PtArgs>,
    /// Fired once when the transport is stopped
    pub shutdown: CancellationToken,
    pub notifier: Option<Arc<dyn TransportStopped>>,
    pub unsafe_logging: bool,
}

/// handle_connection runs the relay task for one accepted connection
pub async fn handle_connection<S>(ctx: Arc<RelayContext>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        handshake = SocksConn::handshake(stream) => handshake,
    };

    let conn = match handshake {
        Ok(conn) => conn,
        Err(e) => {
            debug!("{}: SOCKS handshake with {peer} failed: {e}", ctx.name);
            return;
        }
    };

    let result = relay(&ctx, conn).await;
    match &result {
        Ok(()) => debug!("{}: copy loop ended", ctx.name),
        Err(e) => error!("{}: {e}", ctx.name),
    }

    if let Some(notifier) = &ctx.notifier {
        notifier.stopped(&ctx.name, result.as_ref().err());
    }
}

/// relay takes a handshaken connection through parse, dial, grant and
/// copy. Both connections are closed when this returns
async fn relay<S>(ctx: &RelayContext, conn: SocksConn<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = conn.request.target.clone();

    // Merge controller arguments
    let mut args = conn.request.args.clone();
    if let Some(extra) = &ctx.extra_args {
        args.merge_extra(extra);
    }

    let parsed = match ctx.factory.parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            reject(conn, ReplyCode::ServerFailure).await;
            return Err(Error::ArgumentParseFailure(e));
        }
    };

    let dialer = match proxy::dialer_for(ctx.proxy.as_ref()) {
        Ok(dialer) => dialer,
        Err(e) => {
            reject(conn, ReplyCode::ServerFailure).await;
            return Err(e);
        }
    };

    debug!(
        "{}: dialing {}",
        ctx.name,
        Scrubbed::new(&target, ctx.unsafe_logging)
    );
    let remote = match ctx.factory.dial(Network::Tcp, &target, dialer, parsed).await {
        Ok(remote) => remote,
        Err(e) => {
            let code = e
                .downcast_ref::<io::Error>()
                .map(ReplyCode::from_io_error)
                .unwrap_or(ReplyCode::ServerFailure);
            reject(conn, code).await;
            return Err(Error::DialFailure(e));
        }
    };

    let local = conn.grant().await?;

    copy_loop(local, remote, &ctx.shutdown).await
}

async fn reject<S>(conn: SocksConn<S>, code: ReplyCode)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = conn.reject(code).await {
        debug!("failed to send SOCKS rejection: {e}");
    }
}

/// copy_loop exchanges bytes between the SOCKS connection and the
/// transport connection until either direction finishes or shutdown
/// fires
pub async fn copy_loop<L, R>(local: L, remote: R, shutdown: &CancellationToken) -> Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("shutdown signalled, closing relay");
            Ok(())
        }
        copied = tokio::io::copy(&mut local_rd, &mut remote_wr) => {
            finish("copying SOCKS to transport", copied)
        }
        copied = tokio::io::copy(&mut remote_rd, &mut local_wr) => {
            finish("copying transport to SOCKS", copied)
        }
    }
}

fn finish(direction: &str, copied: io::Result<u64>) -> Result<()> {
    match copied {
        Ok(bytes) => {
            debug!("{direction} finished after {bytes} bytes");
            Ok(())
        }
        Err(e) => {
            error!("{direction} resulted in error: {e}");
            Err(Error::Io(e))
        }
    }
}
