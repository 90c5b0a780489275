use anyhow::{Context, Result, bail};
use clap::Parser;
use ptcontrol::{Config, Controller, Registry, logging};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Start pluggable transports behind local SOCKS5 listeners", long_about = None)]
struct Args {
    /// Directory for transport state and the log file
    #[arg(short, long)]
    state_dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream proxy URL, e.g. socks5://127.0.0.1:9050
    #[arg(short, long)]
    proxy: Option<String>,

    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE)
    #[arg(long)]
    log_level: Option<String>,

    /// Write the log to the state directory instead of stderr
    #[arg(long)]
    log_to_file: bool,

    /// Do not scrub addresses from log output
    #[arg(long)]
    unsafe_logging: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Transports to start
    #[arg(required = true)]
    transports: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Command line overrides the file
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if args.verbose {
        config.log.level = "DEBUG".into();
    }
    config.log.enable |= args.log_to_file;
    config.log.unsafe_logging |= args.unsafe_logging;

    logging::prepare_state_dir(&args.state_dir)?;
    logging::init(&args.state_dir, &config.log)?;

    let registry = Registry::with_builtins();
    for name in &args.transports {
        if !registry.contains(name) {
            bail!(
                "unknown transport {name}, available: {}",
                registry.names().join(", ")
            );
        }
    }

    let controller = Controller::new(args.state_dir, config, registry);

    for name in &args.transports {
        let port = controller
            .start(name, args.proxy.as_deref())
            .await
            .with_context(|| format!("failed to start {name}"))?;
        println!("{name} 127.0.0.1:{port}");
    }

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("interrupted, stopping transports");
    controller.stop_all().await;

    Ok(())
}
