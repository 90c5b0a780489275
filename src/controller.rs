//! Transport lifecycle controller
//!
//! The controller owns one lifecycle slot per transport name. `start`
//! and `stop` on the same name are serialized by that slot's lock; calls
//! on different names only share the brief lookup of the slot map.
//!
//! `stop` never waits for connections to drain. It closes the listener,
//! fires the lifecycle's shutdown token and returns; relay tasks unwind
//! on their own. Embedded backends are stopped from a detached task with
//! no confirmation. Callers needing "fully stopped" build it on top,
//! for example via [`Controller::subscribe`].

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    port,
    proxy::ProxyDescriptor,
    registry::{ProxyUse, Registry, TransportDescriptor, TransportKind},
    relay::{self, RelayContext, TransportStopped},
    socks5::SocksListener,
    transport::{EmbeddedLaunch, EmbeddedTransport, PluggableTransport},
};

/// Pause after accept fails for lack of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Phase is the lifecycle position of one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Status is an observable snapshot of one transport. `port` is non-zero
/// only while Running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    pub phase: Phase,
    pub port: u16,
}

/// Teardown holds what stop needs to release a running transport
enum Teardown {
    Socks {
        /// Closes the listener and ends the accept loop
        close: CancellationToken,
        /// Broadcast to relay tasks of this lifecycle only
        shutdown: CancellationToken,
        accept_loop: JoinHandle<()>,
    },
    Embedded(Arc<dyn EmbeddedTransport>),
}

/// RunningTransport exists exactly while a transport is running
struct RunningTransport {
    port: u16,
    teardown: Teardown,
}

/// Slot serializes lifecycle changes for one name
struct Slot {
    running: Mutex<Option<RunningTransport>>,
    status: watch::Sender<Status>,
}

impl Slot {
    fn new() -> Self {
        let (status, _) = watch::channel(Status::default());
        Self {
            running: Mutex::new(None),
            status,
        }
    }

    fn set(&self, phase: Phase, port: u16) {
        self.status.send_replace(Status { phase, port });
    }
}

/// Controller starts and stops transports and bridges SOCKS connections
/// to dial-based ones
pub struct Controller {
    state_dir: PathBuf,
    config: Arc<Config>,
    registry: Registry,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    notifier: Option<Arc<dyn TransportStopped>>,
}

/// Controller implementation block
impl Controller {
    /// new is a constructor for the Controller type. The state directory
    /// is handed to transports as-is; see `logging::prepare_state_dir`
    pub fn new(state_dir: impl Into<PathBuf>, config: Config, registry: Registry) -> Self {
        Self {
            state_dir: state_dir.into(),
            config: Arc::new(config),
            registry,
            slots: Mutex::new(HashMap::new()),
            notifier: None,
        }
    }

    /// with_notifier registers the callback told about ending relay tasks
    pub fn with_notifier(mut self, notifier: Arc<dyn TransportStopped>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// start launches a transport and returns its local port. Starting a
    /// running transport returns the existing port without side effects.
    ///
    /// `proxy` is an optional upstream proxy URL such as
    /// `socks5://127.0.0.1:9050`; an empty string means none
    pub async fn start(&self, name: &str, proxy: Option<&str>) -> Result<u16> {
        // Fast path; start_one rechecks under the slot lock
        let status = self.status(name).await;
        if status.phase == Phase::Running {
            return Ok(status.port);
        }

        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownTransport(name.to_string()))?;

        let proxy = proxy
            .filter(|p| !p.is_empty())
            .map(ProxyDescriptor::parse)
            .transpose()
            .inspect_err(|e| error!("failed to parse proxy address: {e}"))?;

        // Dependencies come up first
        let mut started_dependency = None;
        let upstream = match &descriptor.depends_on {
            Some(dependency) => {
                let dep = self
                    .registry
                    .get(dependency)
                    .ok_or_else(|| Error::UnknownTransport(dependency.clone()))?;
                let already_running = self.phase(dependency).await == Phase::Running;
                let port = self.start_one(dep, proxy.as_ref(), None).await?;
                if !already_running {
                    started_dependency = Some(dependency.as_str());
                }
                Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            }
            None => None,
        };

        let started = self.start_one(descriptor, proxy.as_ref(), upstream).await;

        // A failed start leaves nothing running that this call brought up
        if let (Err(_), Some(dependency)) = (&started, started_dependency) {
            self.stop_one(dependency).await;
        }

        started
    }

    /// start_one runs the lifecycle transition for a single transport
    async fn start_one(
        &self,
        descriptor: &TransportDescriptor,
        proxy: Option<&ProxyDescriptor>,
        upstream: Option<SocketAddr>,
    ) -> Result<u16> {
        let name = descriptor.name.as_str();
        let slot = self.slot(name).await;
        let mut running = slot.running.lock().await;

        if let Some(current) = running.as_ref() {
            debug!("{name} already running on port {}", current.port);
            return Ok(current.port);
        }

        slot.set(Phase::Starting, 0);

        let launched = match &descriptor.kind {
            TransportKind::Dial(transport) => {
                self.launch_dial(descriptor, transport.as_ref(), proxy).await
            }
            TransportKind::Embedded(backend) => {
                self.launch_embedded(descriptor, backend, proxy, upstream).await
            }
        };

        match launched {
            Ok(transport) => {
                let port = transport.port;
                *running = Some(transport);
                slot.set(Phase::Running, port);
                info!("launched transport {name} on port {port}");
                Ok(port)
            }
            Err(e) => {
                slot.set(Phase::Stopped, 0);
                error!("failed to initialize {name}: {e}");
                Err(e)
            }
        }
    }

    /// launch_dial opens the SOCKS listener and spawns its accept loop
    async fn launch_dial(
        &self,
        descriptor: &TransportDescriptor,
        transport: &dyn PluggableTransport,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<RunningTransport> {
        let name = descriptor.name.clone();

        let factory = transport
            .client_factory(&self.state_dir)
            .map_err(|source| Error::ClientFactory {
                name: name.clone(),
                source,
            })?;

        let mut extra_args = descriptor.extra_args.map(|build| build(&self.config));
        let dial_proxy = match (&descriptor.proxy_use, proxy) {
            (ProxyUse::ExtraArg(arg), Some(proxy)) => {
                extra_args
                    .get_or_insert_default()
                    .set(*arg, proxy.as_str());
                None
            }
            (ProxyUse::ExtraArg(_), None) => None,
            (ProxyUse::Dialer, proxy) => proxy.cloned(),
        };

        let port = match descriptor.preferred_port {
            Some(preferred) => port::find_port(preferred).await,
            None => 0,
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = SocksListener::bind(addr)
            .await
            .map_err(|source| Error::ListenFailure { addr, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| Error::ListenFailure { addr, source })?
            .port();

        let close = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let ctx = Arc::new(RelayContext {
            name,
            factory,
            proxy: dial_proxy,
            extra_args,
            shutdown: shutdown.clone(),
            notifier: self.notifier.clone(),
            unsafe_logging: self.config.log.unsafe_logging,
        });

        let accept_loop = tokio::spawn(accept_loop(listener, ctx, close.clone()));

        Ok(RunningTransport {
            port,
            teardown: Teardown::Socks {
                close,
                shutdown,
                accept_loop,
            },
        })
    }

    /// launch_embedded picks the backend's port and starts it
    async fn launch_embedded(
        &self,
        descriptor: &TransportDescriptor,
        backend: &Arc<dyn EmbeddedTransport>,
        proxy: Option<&ProxyDescriptor>,
        upstream: Option<SocketAddr>,
    ) -> Result<RunningTransport> {
        let name = descriptor.name.clone();

        let port = match descriptor.preferred_port {
            Some(preferred) => port::find_port(preferred).await,
            None => port::ephemeral_port()
                .await
                .map_err(|source| Error::ListenFailure {
                    addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
                    source,
                })?,
        };

        let launch = EmbeddedLaunch {
            name: name.clone(),
            port,
            state_dir: self.state_dir.clone(),
            upstream,
            proxy: proxy.map(|p| p.as_str().to_string()),
            config: Arc::clone(&self.config),
        };

        backend
            .start(launch)
            .await
            .map_err(|source| Error::EmbeddedStartFailure { name, source })?;

        if let Some(window) = descriptor.ready_within {
            port::wait_until_listening(port, window).await;
        }

        Ok(RunningTransport {
            port,
            teardown: Teardown::Embedded(Arc::clone(backend)),
        })
    }

    /// stop takes a transport down. Unknown or stopped names are a no-op.
    /// A transport started as a dependency is stopped along with its
    /// dependent
    pub async fn stop(&self, name: &str) {
        self.stop_one(name).await;

        if let Some(dependency) = self
            .registry
            .get(name)
            .and_then(|d| d.depends_on.as_deref())
        {
            self.stop_one(dependency).await;
        }
    }

    async fn stop_one(&self, name: &str) {
        let Some(slot) = self.slots.lock().await.get(name).cloned() else {
            warn!("no listener for {name}");
            return;
        };

        let mut running = slot.running.lock().await;
        let Some(transport) = running.take() else {
            warn!("no listener for {name}");
            return;
        };

        info!("shutting down {name}");
        slot.set(Phase::Stopping, 0);

        match transport.teardown {
            Teardown::Socks {
                close,
                shutdown,
                accept_loop,
            } => {
                close.cancel();
                shutdown.cancel();
                // The accept loop exits right after close; awaiting it
                // guarantees the listener is gone
                if let Err(e) = accept_loop.await {
                    error!("accept loop for {name} failed: {e}");
                }
            }
            Teardown::Embedded(backend) => {
                tokio::spawn(async move { backend.stop().await });
            }
        }

        slot.set(Phase::Stopped, 0);
    }

    /// stop_all stops every running transport
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        for name in names {
            if self.phase(&name).await == Phase::Running {
                self.stop(&name).await;
            }
        }
    }

    /// port returns the local port of a running transport, or 0
    pub async fn port(&self, name: &str) -> u16 {
        self.status(name).await.port
    }

    /// local_address returns 127.0.0.1:port while the transport runs
    pub async fn local_address(&self, name: &str) -> Option<SocketAddr> {
        match self.port(name).await {
            0 => None,
            port => Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port))),
        }
    }

    pub async fn phase(&self, name: &str) -> Phase {
        self.status(name).await.phase
    }

    pub async fn status(&self, name: &str) -> Status {
        match self.slots.lock().await.get(name) {
            Some(slot) => *slot.status.borrow(),
            None => Status::default(),
        }
    }

    /// subscribe watches a transport's status, for callers that need to
    /// wait for a transition
    pub async fn subscribe(&self, name: &str) -> watch::Receiver<Status> {
        self.slot(name).await.status.subscribe()
    }

    async fn slot(&self, name: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        Arc::clone(
            slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }
}

/// accept_loop spawns a relay task per accepted connection until the
/// listener is closed or accept fails permanently
async fn accept_loop(listener: SocksListener, ctx: Arc<RelayContext>, close: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = close.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                // Clone for this connection
                let ctx = Arc::clone(&ctx);

                // Spawn async task
                tokio::spawn(async move {
                    debug!("{}: new client {peer}", ctx.name);
                    relay::handle_connection(ctx, stream, peer).await;
                });
            }
            Err(e) if is_transient(&e) => {
                debug!("{}: transient accept error: {e}", ctx.name);
                if is_fd_exhaustion(&e) {
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
            Err(e) => {
                error!("{}: accept failed: {e}", ctx.name);
                break;
            }
        }
    }

    debug!("{}: accept loop exited", ctx.name);
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_fd_exhaustion(e)
}

/// Too many open files in the process
const EMFILE: i32 = 24;
/// Too many open files in the system
const ENFILE: i32 = 23;

fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(EMFILE | ENFILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::names;

    fn controller() -> Controller {
        Controller::new(std::env::temp_dir(), Config::default(), Registry::with_builtins())
    }

    #[tokio::test]
    async fn unknown_transport_fails_without_state() {
        let ctl = controller();
        assert!(matches!(
            ctl.start("nope", None).await,
            Err(Error::UnknownTransport(_))
        ));
        assert_eq!(ctl.status("nope").await, Status::default());
    }

    #[tokio::test]
    async fn invalid_proxy_fails_before_listening() {
        let ctl = controller();
        let err = ctl.start(names::DUMMY, Some("::not a url::")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidProxyAddress { .. }));
        assert_eq!(ctl.port(names::DUMMY).await, 0);
        assert_eq!(ctl.phase(names::DUMMY).await, Phase::Stopped);
    }

    #[tokio::test]
    async fn start_stop_updates_status() {
        let ctl = controller();
        let mut status = ctl.subscribe(names::DUMMY).await;

        let port = ctl.start(names::DUMMY, None).await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(*status.borrow_and_update(), Status { phase: Phase::Running, port });
        assert_eq!(
            ctl.local_address(names::DUMMY).await,
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        );

        ctl.stop(names::DUMMY).await;
        assert_eq!(ctl.status(names::DUMMY).await, Status::default());
        assert_eq!(ctl.local_address(names::DUMMY).await, None);
        assert!(port::is_port_available(port).await);

        // Second stop is a no-op
        ctl.stop(names::DUMMY).await;
        ctl.stop("never-started").await;
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(ENFILE)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }
}
