use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use fluxgate_core::openports::{self, OpenPortsConfig, PortSink};
use fluxgate_core::shutdown::{install_signal_handlers, StopFlag};
use fluxgate_core::sink::HttpSink;
use fluxgate_core::source::RecordChannel;
use fluxgate_modules::config::OpenPortsFileConfig;
use fluxgate_modules::{build_network_filter, init_tracing};

/// Fluxgate open-ports module — analyze IP flows to find open ports on
/// each monitored address and send them to the collector periodically.
#[derive(Parser, Debug)]
#[command(name = "fluxgate-openports", version, about)]
struct Cli {
    /// Record source: '-', 'file:PATH' or 'tcp:HOST:PORT'.
    #[arg(short = 'i', long)]
    input: Option<String>,

    /// Base URL of the collector API. If not given, results are printed
    /// to stdout (for testing/debugging).
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// Period of sending data to the collector in seconds (default: 300).
    #[arg(short = 'S', long)]
    send_interval: Option<u64>,

    /// Period of pairing-cache rotation in seconds; should exceed the
    /// maximum expected delay between the two directions of a connection
    /// (default: 120).
    #[arg(short = 'r', long)]
    cache_rotation: Option<u64>,

    /// IP networks (CIDR) to monitor, comma or space separated. If not
    /// set, all IPs are included.
    #[arg(short = 'n', long)]
    networks: Option<String>,

    /// Same as --networks, but read prefixes from a file (one per line,
    /// '#'/'//' comments supported).
    #[arg(short = 'N', long)]
    networks_file: Option<PathBuf>,

    /// Source tag copied into every emitted data-point (default:
    /// open_ports).
    #[arg(short = 's', long)]
    src_tag: Option<String>,

    /// Also detect open UDP ports (experimental).
    #[arg(long)]
    udp_too: bool,

    /// Do not drop connections from well-known ports to non-well-known
    /// ports (the drop compensates for inaccurate flow timestamps).
    #[arg(long)]
    no_port_filter: bool,

    /// Path to a TOML configuration file (optional).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Verbose mode.
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = match cli
        .config
        .as_deref()
        .map(OpenPortsFileConfig::from_file)
        .transpose()
    {
        Ok(file) => file.unwrap_or_default(),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };

    let send_interval = cli.send_interval.or(file.send_interval).unwrap_or(300);
    let cache_rotation = cli.cache_rotation.or(file.cache_rotation).unwrap_or(120);
    if cache_rotation < 1 {
        error!("cache rotation interval must be at least 1 second");
        std::process::exit(1);
    }
    if send_interval < 1 {
        error!("send interval must be at least 1 second");
        std::process::exit(1);
    }

    let input = cli.input.or(file.input).unwrap_or_else(|| "-".to_string());
    let src_tag = cli
        .src_tag
        .or(file.src_tag)
        .unwrap_or_else(|| "open_ports".to_string());
    let udp_too = cli.udp_too || file.udp_too.unwrap_or(false);
    let port_sanity_filter = !(cli.no_port_filter || file.no_port_filter.unwrap_or(false));

    let networks = cli.networks.or(file.networks);
    let networks_file = cli.networks_file.or(file.networks_file);
    let filter = match build_network_filter(networks.as_deref(), networks_file.as_deref()) {
        Ok(filter) => filter,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };
    if !filter.is_empty() {
        info!(
            networks = filter.len(),
            "only watching configured networks for open ports"
        );
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        send_interval, cache_rotation, udp_too, "starting fluxgate open-ports module"
    );

    let sink = match cli.url.or(file.url) {
        Some(url) => {
            let http = match HttpSink::new(&url) {
                Ok(http) => http,
                Err(e) => {
                    error!("{e:#}");
                    std::process::exit(2);
                }
            };
            if let Err(e) = http.health_check().await {
                error!("{e:#}");
                std::process::exit(2);
            }
            info!(url = http.base_url(), "collector reachable");
            PortSink::Http(http)
        }
        None => {
            info!("no collector URL configured, printing results to stdout");
            PortSink::Stdout
        }
    };

    let source = match RecordChannel::open(&input).await {
        Ok(source) => source,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };

    let stop = StopFlag::new();
    install_signal_handlers(stop.clone());

    let config = OpenPortsConfig {
        send_interval,
        cache_rotation,
        udp_too,
        port_sanity_filter,
        src_tag,
    };
    openports::run(source, sink, Arc::new(filter), config, stop).await?;

    info!("finished");
    Ok(())
}
