//! Astacus server binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use clap::{Parser, Subcommand};
use log::{info, warn};

use astacus::config::{GlobalConfig, CONFIG_ENV};
use astacus::server;

#[derive(Parser)]
#[command(name = "astacus", about = "Cluster-wide backup and restore")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST server (coordinator, node, or both per config)
    Server {
        /// YAML configuration file; falls back to $ASTACUS_CONFIG
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), Error> {
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server { config } => run_server(config),
    }
}

fn run_server(config_path: Option<PathBuf>) -> Result<(), Error> {
    let config_path = config_path
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .ok_or_else(|| {
            format_err!("no configuration; pass --config or set {}", CONFIG_ENV)
        })?;
    let config = GlobalConfig::load(&config_path)?;

    if let Some(dsn) = &config.sentry_dsn {
        warn!("sentry_dsn is configured but telemetry is not built in ({} chars)", dsn.len());
    }

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .map_err(|err| format_err!("invalid http listen address: {}", err))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let service = server::Service::build(&config)?;
        info!(
            "starting (coordinator: {}, node: {})",
            service.coordinator.is_some(),
            service.node.is_some()
        );
        server::serve(service, addr, systemd_notify_ready).await
    })?;
    bail!("server exited unexpectedly");
}

/// Tell systemd we are ready, when started with NOTIFY_SOCKET set.
fn systemd_notify_ready() {
    let socket_path = match std::env::var("NOTIFY_SOCKET") {
        Ok(path) => path,
        Err(_) => return,
    };
    if let Err(err) = systemd_notify(&socket_path, b"READY=1") {
        warn!("systemd notify to {} failed: {}", socket_path, err);
    }
}

fn systemd_notify(socket_path: &str, payload: &[u8]) -> Result<(), Error> {
    use nix::sys::socket::{
        sendto, socket, AddressFamily, MsgFlags, SockAddr, SockFlag, SockType, UnixAddr,
    };

    let addr = if let Some(abstract_name) = socket_path.strip_prefix('@') {
        UnixAddr::new_abstract(abstract_name.as_bytes())?
    } else {
        UnixAddr::new(socket_path)?
    };
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )?;
    let result = sendto(fd, payload, &SockAddr::Unix(addr), MsgFlags::empty());
    let _ = nix::unistd::close(fd);
    result?;
    Ok(())
}
