#![allow(dead_code)]

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use ptcontrol::{
    ClientFactory, EmbeddedLaunch, EmbeddedTransport, Error, PluggableTransport, PtArgs,
    TransportStopped,
    proxy::Dialer,
    transport::{BoxedStream, Network, ParsedArgs},
};
use std::{
    io,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};

/// Bound for every wait in the tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Remote is the far side of a mock transport connection
pub struct Remote {
    pub target: String,
    pub args: PtArgs,
    pub stream: DuplexStream,
}

/// MockTransport dials in-memory pipes and hands their far ends to the test.
///
/// A `reject` argument fails parse_args; a `refuse` argument fails the
/// dial with ConnectionRefused
pub struct MockTransport {
    pub factories: AtomicUsize,
    pub dials: Arc<AtomicUsize>,
    remotes: mpsc::UnboundedSender<Remote>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Remote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            factories: AtomicUsize::new(0),
            dials: Arc::new(AtomicUsize::new(0)),
            remotes,
        });
        (transport, rx)
    }

    pub fn factory_count(&self) -> usize {
        self.factories.load(Ordering::SeqCst)
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl PluggableTransport for MockTransport {
    fn client_factory(&self, _state_dir: &Path) -> Result<Arc<dyn ClientFactory>> {
        self.factories.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockFactory {
            dials: Arc::clone(&self.dials),
            remotes: self.remotes.clone(),
        }))
    }
}

struct MockFactory {
    dials: Arc<AtomicUsize>,
    remotes: mpsc::UnboundedSender<Remote>,
}

#[async_trait]
impl ClientFactory for MockFactory {
    fn parse_args(&self, args: &PtArgs) -> Result<ParsedArgs> {
        if args.get("reject").is_some() {
            bail!("rejected arguments");
        }
        Ok(Box::new(args.clone()))
    }

    async fn dial(
        &self,
        _network: Network,
        target: &str,
        _dialer: Arc<dyn Dialer>,
        args: ParsedArgs,
    ) -> Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let args = args
            .downcast::<PtArgs>()
            .map_err(|_| anyhow!("unexpected argument type"))?;
        if args.get("refuse").is_some() {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }

        let (near, far) = duplex(64 * 1024);
        self.remotes
            .send(Remote {
                target: target.to_string(),
                args: *args,
                stream: far,
            })
            .map_err(|_| anyhow!("test dropped the remote receiver"))?;
        Ok(Box::new(near))
    }
}

/// BrokenTransport cannot produce a client factory
pub struct BrokenTransport;

impl PluggableTransport for BrokenTransport {
    fn client_factory(&self, _state_dir: &Path) -> Result<Arc<dyn ClientFactory>> {
        bail!("no state for you")
    }
}

/// MockEmbedded records the launches and stops it sees. With `bind_after`
/// set it starts listening on the launch port after that delay
#[derive(Default)]
pub struct MockEmbedded {
    pub fail: bool,
    pub bind_after: Option<Duration>,
    pub launches: Mutex<Vec<EmbeddedLaunch>>,
    pub stops: AtomicUsize,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl MockEmbedded {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn binding_after(delay: Duration) -> Self {
        Self {
            bind_after: Some(delay),
            ..Default::default()
        }
    }

    pub fn launches(&self) -> Vec<EmbeddedLaunch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddedTransport for MockEmbedded {
    async fn start(&self, launch: EmbeddedLaunch) -> Result<()> {
        if self.fail {
            bail!("backend refused to start");
        }
        if let Some(delay) = self.bind_after {
            let port = launch.port;
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
                while listener.accept().await.is_ok() {}
            });
            *self.listener.lock().unwrap() = Some(task);
        }
        self.launches.lock().unwrap().push(launch);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.listener.lock().unwrap().take() {
            task.abort();
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// StopEvent is what a RecordingNotifier saw for one relay task
#[derive(Debug, Clone)]
pub struct StopEvent {
    pub name: String,
    pub error: Option<String>,
}

/// recording_notifier forwards every stop notification to a channel
pub fn recording_notifier() -> (Arc<dyn TransportStopped>, mpsc::UnboundedReceiver<StopEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let notifier = move |name: &str, error: Option<&Error>| {
        let _ = tx.send(StopEvent {
            name: name.to_string(),
            error: error.map(ToString::to_string),
        });
    };
    (Arc::new(notifier), rx)
}

/// socks_connect runs a client handshake against a local listener and
/// returns the stream and the server's reply code. Arguments are sent in
/// the username/password fields, split at 255 bytes
pub async fn socks_connect(port: u16, target: (&str, u16), args: &PtArgs) -> io::Result<(TcpStream, u8)> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (host, target_port) = target;

    let method = if args.is_empty() { 0x00 } else { 0x02 };
    stream.write_all(&[0x05, 0x01, method]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, method] {
        return Err(io::Error::other(format!("unexpected method choice {choice:?}")));
    }

    if method == 0x02 {
        let encoded = args.encode().into_bytes();
        let (user, pass) = encoded.split_at(encoded.len().min(255));
        let pass: &[u8] = if pass.is_empty() { &[0] } else { pass };

        let mut req = vec![0x01, user.len() as u8];
        req.extend_from_slice(user);
        req.push(pass.len() as u8);
        req.extend_from_slice(pass);
        stream.write_all(&req).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "argument sub-negotiation failed",
            ));
        }
    }

    let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    Ok((stream, reply[1]))
}

/// wait_for polls cond until it holds or WAIT elapses
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
