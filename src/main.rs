use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use veilnet::{Node, NodeConfig, TunnelConfig};

#[derive(Parser, Debug)]
#[command(name = "veilnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the overlay socket on.
    #[arg(long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Overlay UDP port (0 = ephemeral).
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Address to bind the SOCKS5 listener on. The ingress has no
    /// authentication, so keep it off public interfaces.
    #[arg(long, default_value = "127.0.0.1")]
    socks_ip: IpAddr,

    /// SOCKS5 TCP port; 0 disables the ingress.
    #[arg(long, default_value = "1080")]
    socks_port: u16,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Refuse to exit traffic to the Internet.
    #[arg(long)]
    no_exit: bool,

    /// Seconds between introduction requests.
    #[arg(long, default_value = "5")]
    walk_interval: u64,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

fn node_config(args: &Args) -> NodeConfig {
    NodeConfig {
        overlay_addr: SocketAddr::new(args.ip, args.port),
        socks_addr: (args.socks_port != 0).then(|| SocketAddr::new(args.socks_ip, args.socks_port)),
        bootstrap: args.bootstrap.clone(),
        walk_interval: Duration::from_secs(args.walk_interval.max(1)),
        tunnel: TunnelConfig {
            exit_enabled: !args.no_exit,
            ..Default::default()
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(node_config(&args)).await?;
    info!(
        overlay = %node.local_addr(),
        socks = ?node.socks_addr(),
        "veilnet node running"
    );

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry().await;
                let stats = &snapshot.tunnel;
                info!(
                    circuits = stats.circuits,
                    ready = stats.ready_circuits,
                    relay_bindings = stats.relay_bindings,
                    exit_sockets = stats.exit_sockets,
                    candidates = stats.candidates,
                    associations = snapshot.associations,
                    cells_in = stats.cells_received,
                    cells_out = stats.cells_sent,
                    dropped_unknown = stats.unknown_circuit,
                    dropped_bad = stats.bad_frame,
                    extend_dropped = stats.extend_target_dropped,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
