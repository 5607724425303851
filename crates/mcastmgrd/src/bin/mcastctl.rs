//! Membership session harness
//!
//! Opens one session, binds it, joins the given groups, waits for Enter,
//! leaves them again and disconnects.

use anyhow::{bail, Context};
use clap::Parser;
use mcast_membership::{BindRequest, GroupAddress};
use mcastmgrd::ControlClient;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Hold multicast memberships through mcastmgrd
#[derive(Parser, Debug)]
#[command(name = "mcastctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control socket path
    #[arg(short = 's', long, default_value = "/run/mcastmgrd.sock")]
    socket: PathBuf,

    /// Interface name, or a local IPv4 address owned by the interface
    #[arg(short = 'i', long)]
    interface: String,

    /// Multicast groups to join
    #[arg(required = true)]
    groups: Vec<GroupAddress>,
}

fn bind_request(interface: &str) -> anyhow::Result<BindRequest> {
    if let Ok(addr) = interface.parse::<Ipv4Addr>() {
        return Ok(BindRequest::by_address(addr));
    }
    let index = if_nametoindex(interface)
        .with_context(|| format!("unknown interface {}", interface))?;
    Ok(BindRequest::by_index(index))
}

#[cfg(target_os = "linux")]
fn if_nametoindex(name: &str) -> anyhow::Result<u32> {
    Ok(nix::net::if_::if_nametoindex(name)?)
}

#[cfg(not(target_os = "linux"))]
fn if_nametoindex(name: &str) -> anyhow::Result<u32> {
    bail!("interface names are not supported on this platform: {}", name)
}

fn describe(status: i32) -> String {
    if status >= 0 {
        format!("ok ({})", status)
    } else {
        format!("{} ({})", std::io::Error::from_raw_os_error(-status), status)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let request = bind_request(&args.interface)?;

    let mut client = ControlClient::connect(&args.socket)
        .await
        .with_context(|| format!("connecting to {}", args.socket.display()))?;

    let status = client.bind(request).await?;
    println!("bind {}: {}", args.interface, describe(status));
    if status < 0 {
        bail!("bind failed");
    }

    for group in &args.groups {
        let status = client.join(*group).await?;
        println!("join {}: {}", group, describe(status));
    }

    println!("Press Enter to leave the groups");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;

    for group in &args.groups {
        let status = client.leave(*group).await?;
        println!("leave {}: {}", group, describe(status));
    }

    client.disconnect().await?;
    Ok(())
}
