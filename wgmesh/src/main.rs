//! Thin CLI entry point. Loads config, derives the WireGuard keypair and
//! mesh addresses, and hands everything to `wgmesh_core::Orchestrator`.
//! Mirrors `server/src/main.rs`'s `#[tokio::main]` + `pretty_env_logger`
//! shape rather than the `client` binary's synchronous daemon loop, since
//! discovery here runs many concurrent cancellable tasks instead of one
//! blocking fetch cycle.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wgmesh_core::{keys, Config};
use wireguard_control::Key;

#[derive(Parser)]
#[command(name = "wgmesh", about = "Zero-coordination peer discovery for WireGuard meshes")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short, global = true, default_value = "/etc/wgmesh/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring up discovery and NAT traversal for the configured interface.
    Up,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Up => up(&cli.config).await,
    }
}

async fn up(config_path: &PathBuf) -> Result<()> {
    let config = Config::from_file(config_path).with_context(|| format!("loading {}", config_path.display()))?;

    // An operator-set RUST_LOG always wins; otherwise fall back to the
    // config file's log-level, same precedence the teacher's client gives
    // its CLI verbosity flag over the environment (`client/src/util.rs`).
    std::env::set_var("RUST_LOG", config.effective_log_level());
    pretty_env_logger::init();

    let secret = config.resolve_secret()?;
    let derived = keys::derive(&secret)?;

    let private_key = Key::generate_private();
    let public_key_bytes = private_key.get_public();
    let public_key = public_key_bytes.to_base64();

    let subnet_base = derived.subnet;
    let (third, fourth) =
        keys::derive_mesh_ipv4_octets(public_key_bytes.as_bytes(), secret.as_bytes(), &subnet_base);
    let mesh_ipv4 = std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, subnet_base[0], third, fourth));

    let iface_id = keys::derive_mesh_ipv6_iface_id(public_key_bytes.as_bytes(), secret.as_bytes());
    let mut ipv6_bytes = [0u8; 16];
    ipv6_bytes[..8].copy_from_slice(&derived.mesh_prefix_v6);
    ipv6_bytes[8..].copy_from_slice(&iface_id);
    let mesh_ipv6 = std::net::IpAddr::V6(std::net::Ipv6Addr::from(ipv6_bytes));

    log::info!("starting wgmesh for interface {} as {public_key}", config.node.interface);
    log::info!("mesh addresses: {mesh_ipv4}, {mesh_ipv6}");

    let mut orchestrator =
        wgmesh_core::Orchestrator::new(config, private_key, public_key, mesh_ipv4, mesh_ipv6)?;
    orchestrator.run().await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    log::info!("shutting down, broadcasting goodbye to active peers");
    orchestrator.shutdown().await;

    Ok(())
}
