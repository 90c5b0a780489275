//! A local controller for pluggable transports
//!
//! ## Overview
//!
//! - Starts and stops named transports on demand, one lifecycle per name
//! - Dial-based transports get a local SOCKS5 listener on 127.0.0.1
//!     - CONNECT only
//!     - Transport arguments carried in the username/password fields
//!     - Optional upstream proxy (http, socks4, socks4a, socks5, socks5h)
//! - Embedded transports run their own listener on a port picked here
//! - Stopping a transport closes its listener and tears down every
//!   connection it accepted, without touching other transports
//!
//! # Example
//! ```no_run
//! use ptcontrol::{Config, Controller, Registry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = Controller::new("/tmp/pt-state", Config::default(), Registry::with_builtins());
//!     let port = controller.start("dummy", None).await?;
//!     println!("dummy listening on 127.0.0.1:{port}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     controller.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod port;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod socks5;
pub mod transport;

// Re-export main types at crate root for convenience
pub use args::PtArgs;
pub use config::Config;
pub use controller::{Controller, Phase, Status};
pub use error::{Error, Result};
pub use proxy::{Dialer, ProxyDescriptor};
pub use registry::{Registry, TransportDescriptor, names};
pub use relay::TransportStopped;
pub use transport::{ClientFactory, EmbeddedLaunch, EmbeddedTransport, PluggableTransport};
