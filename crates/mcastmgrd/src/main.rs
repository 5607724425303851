//! Multicast Membership Daemon
//!
//! Main entry point for mcastmgrd.
//! Serves membership sessions on a Unix socket and applies them to the kernel.

use anyhow::Context;
use clap::Parser;
use mcast_membership::memory::{InMemoryControlPlane, StaticInterfaceResolver};
use mcast_membership::{InterfaceResolver, MulticastControlPlane};
use mcastmgrd::{ControlPlaneKind, DaemonConfig, MembershipServer, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// SONiC multicast membership manager
#[derive(Parser, Debug)]
#[command(name = "mcastmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Control socket path (overrides the configuration file)
    #[arg(short = 's', long)]
    socket: Option<PathBuf>,

    /// Control plane (overrides the configuration file)
    #[arg(long, value_parser = ["kernel", "memory"])]
    control_plane: Option<String>,

    /// Log level used when RUST_LOG is not set (overrides the configuration file)
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mcastmgrd: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging.level) {
        eprintln!("mcastmgrd: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("mcastmgrd: Starting multicast membership daemon");

    match run_daemon(config).await {
        Ok(()) => {
            info!("mcastmgrd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "mcastmgrd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = DaemonConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Some(socket) = &args.socket {
        config.server.socket_path = socket.clone();
    }
    match args.control_plane.as_deref() {
        Some("kernel") => config.membership.control_plane = ControlPlaneKind::Kernel,
        Some("memory") => config.membership.control_plane = ControlPlaneKind::Memory,
        _ => {}
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {:?}", level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

type Adapters = (Arc<dyn MulticastControlPlane>, Arc<dyn InterfaceResolver>);

fn build_adapters(kind: ControlPlaneKind) -> Adapters {
    match kind {
        #[cfg(target_os = "linux")]
        ControlPlaneKind::Kernel => {
            let plane: Arc<dyn MulticastControlPlane> =
                Arc::new(mcastmgrd::SocketControlPlane::new());
            let resolver: Arc<dyn InterfaceResolver> =
                Arc::new(mcastmgrd::KernelInterfaceResolver::new());
            (plane, resolver)
        }
        #[cfg(not(target_os = "linux"))]
        ControlPlaneKind::Kernel => {
            warn!("mcastmgrd: Kernel control plane unavailable, using memory");
            build_adapters(ControlPlaneKind::Memory)
        }
        ControlPlaneKind::Memory => {
            warn!("mcastmgrd: Using in-memory control plane, kernel memberships are not changed");
            let resolver = StaticInterfaceResolver::new();
            resolver.add_interface(1, "lo", [std::net::Ipv4Addr::LOCALHOST]);
            let plane: Arc<dyn MulticastControlPlane> = Arc::new(InMemoryControlPlane::new());
            (plane, Arc::new(resolver))
        }
    }
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    info!(
        socket = %config.server.socket_path.display(),
        control_plane = config.membership.control_plane.as_str(),
        max_sessions = config.server.max_sessions,
        max_groups_per_session = config.membership.max_groups_per_session,
        "mcastmgrd: Configuration loaded"
    );

    let (plane, resolver) = build_adapters(config.membership.control_plane);
    let server = MembershipServer::bind(&config, plane, resolver)
        .with_context(|| format!("binding {}", config.server.socket_path.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    server.serve(shutdown_rx).await?;
    Ok(())
}

/// Waits for SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "mcastmgrd: Cannot listen for SIGTERM");
                if signal::ctrl_c().await.is_ok() {
                    info!("mcastmgrd: Received SIGINT");
                }
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("mcastmgrd: Received SIGINT"),
            _ = term.recv() => info!("mcastmgrd: Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("mcastmgrd: Received SIGINT");
        }
    }
}
