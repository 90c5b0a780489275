//! Transport registry
//!
//! Maps transport names to their backend and the conventions the
//! controller applies when starting them.

use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    args::PtArgs,
    config::Config,
    transport::{Dummy, EmbeddedTransport, PluggableTransport},
};

/// Well-known transport names
pub mod names {
    pub const DUMMY: &str = "dummy";
    pub const OBFS2: &str = "obfs2";
    pub const OBFS3: &str = "obfs3";
    pub const OBFS4: &str = "obfs4";
    pub const SCRAMBLESUIT: &str = "scramblesuit";
    pub const MEEK_LITE: &str = "meek_lite";
    pub const WEBTUNNEL: &str = "webtunnel";
    pub const SNOWFLAKE: &str = "snowflake";
    pub const OBFS4_TUBESOCKS: &str = "obfs4_tubesocks";
    pub const MEEK_TUBESOCKS: &str = "meek_tubesocks";
    pub const V2RAY_WS: &str = "v2ray_ws";
    pub const V2RAY_SRTP: &str = "v2ray_srtp";
    pub const V2RAY_WECHAT: &str = "v2ray_wechat";
    pub const HYSTERIA2: &str = "hysteria2";
}

/// Builds controller-supplied arguments from the configuration
pub type ExtraArgsFn = fn(&Config) -> PtArgs;

/// TransportKind holds the backend for a transport
#[derive(Clone)]
pub enum TransportKind {
    /// Bridged through a local SOCKS5 listener
    Dial(Arc<dyn PluggableTransport>),
    /// Owns its listener, started and stopped only
    Embedded(Arc<dyn EmbeddedTransport>),
}

/// ProxyUse decides how an upstream proxy reaches a dial-based transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyUse {
    /// Wrap the transport's outward dialer
    Dialer,
    /// Pass the proxy URL as the named extra argument
    ExtraArg(&'static str),
}

/// TransportDescriptor is the static description of one transport
#[derive(Clone)]
pub struct TransportDescriptor {
    pub name: String,
    pub kind: TransportKind,
    /// Port to start probing from. None lets the OS choose
    pub preferred_port: Option<u16>,
    pub proxy_use: ProxyUse,
    pub extra_args: Option<ExtraArgsFn>,
    /// Transport that must be running first; its local address is handed
    /// to this one
    pub depends_on: Option<String>,
    /// How long to wait for an embedded backend to start listening
    pub ready_within: Option<Duration>,
}

impl TransportDescriptor {
    /// dial describes a dial-based transport with an OS-assigned port
    pub fn dial(name: impl Into<String>, transport: Arc<dyn PluggableTransport>) -> Self {
        Self::with_kind(name, TransportKind::Dial(transport))
    }

    /// embedded describes an embedded-library transport
    pub fn embedded(name: impl Into<String>, backend: Arc<dyn EmbeddedTransport>) -> Self {
        Self::with_kind(name, TransportKind::Embedded(backend))
    }

    fn with_kind(name: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            name: name.into(),
            kind,
            preferred_port: None,
            proxy_use: ProxyUse::Dialer,
            extra_args: None,
            depends_on: None,
            ready_within: None,
        }
    }

    pub fn preferred_port(mut self, port: u16) -> Self {
        self.preferred_port = Some(port);
        self
    }

    pub fn proxy_as_arg(mut self, arg: &'static str) -> Self {
        self.proxy_use = ProxyUse::ExtraArg(arg);
        self
    }

    pub fn extra_args(mut self, build: ExtraArgsFn) -> Self {
        self.extra_args = Some(build);
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on = Some(name.into());
        self
    }

    pub fn ready_within(mut self, window: Duration) -> Self {
        self.ready_within = Some(window);
        self
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.kind, TransportKind::Embedded(_))
    }

    // ===============
    // PRESETS
    // ===============

    /// snowflake routes the broker settings and the upstream proxy into
    /// the per-connection arguments
    pub fn snowflake(transport: Arc<dyn PluggableTransport>) -> Self {
        Self::dial(names::SNOWFLAKE, transport)
            .extra_args(Config::snowflake_args)
            .proxy_as_arg("proxy")
    }

    pub fn v2ray_ws(backend: Arc<dyn EmbeddedTransport>) -> Self {
        Self::embedded(names::V2RAY_WS, backend).preferred_port(47800)
    }

    pub fn v2ray_srtp(backend: Arc<dyn EmbeddedTransport>) -> Self {
        Self::embedded(names::V2RAY_SRTP, backend).preferred_port(47600)
    }

    pub fn v2ray_wechat(backend: Arc<dyn EmbeddedTransport>) -> Self {
        Self::embedded(names::V2RAY_WECHAT, backend).preferred_port(47700)
    }

    /// hysteria2 gives no startup confirmation, so the controller waits
    /// for its SOCKS port to come up
    pub fn hysteria2(backend: Arc<dyn EmbeddedTransport>) -> Self {
        Self::embedded(names::HYSTERIA2, backend)
            .preferred_port(48000)
            .ready_within(Duration::from_secs(1))
    }

    pub fn obfs4_tubesocks(backend: Arc<dyn EmbeddedTransport>) -> Self {
        Self::embedded(names::OBFS4_TUBESOCKS, backend)
            .preferred_port(47350)
            .depends_on(names::OBFS4)
    }

    pub fn meek_tubesocks(backend: Arc<dyn EmbeddedTransport>) -> Self {
        Self::embedded(names::MEEK_TUBESOCKS, backend)
            .preferred_port(47360)
            .depends_on(names::MEEK_LITE)
    }
}

/// Registry is the set of transports a controller can start
#[derive(Clone, Default)]
pub struct Registry {
    transports: HashMap<String, TransportDescriptor>,
}

impl Registry {
    /// new returns an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// with_builtins returns a registry holding the transports that ship
    /// with this crate
    pub fn with_builtins() -> Self {
        Self::new().with(TransportDescriptor::dial(names::DUMMY, Arc::new(Dummy)))
    }

    /// with adds or replaces a transport
    pub fn with(mut self, descriptor: TransportDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn register(&mut self, descriptor: TransportDescriptor) {
        self.transports.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&TransportDescriptor> {
        self.transports.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transports.contains_key(name)
    }

    /// names lists the registered transports in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
