use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use fluxgate_core::activity::{self, ActivityConfig};
use fluxgate_core::shutdown::{install_signal_handlers, StopFlag};
use fluxgate_core::sink::RecordSink;
use fluxgate_core::source::RecordChannel;
use fluxgate_modules::config::ActivityFileConfig;
use fluxgate_modules::{build_network_filter, init_tracing};

/// Fluxgate activity module — count flows, packets and bytes sent and
/// received by each IP address per fixed time interval and emit the
/// counters as data-points.
#[derive(Parser, Debug)]
#[command(name = "fluxgate-activity", version, about)]
struct Cli {
    /// Record source: '-', 'file:PATH' or 'tcp:HOST:PORT'.
    #[arg(short = 'i', long)]
    input: Option<String>,

    /// Data-point sink: '-', 'file:PATH' or 'tcp:HOST:PORT'.
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Length of one aggregation interval in seconds (default: 10 min).
    #[arg(short = 'I', long)]
    interval: Option<u64>,

    /// Max age of incoming data in seconds; slots older than this are
    /// sent and deleted (default: 20 min).
    #[arg(short = 'm', long)]
    maxage: Option<u64>,

    /// IP networks (CIDR) to monitor, comma or space separated. If not
    /// set, all IPs are included.
    #[arg(short = 'n', long)]
    networks: Option<String>,

    /// Same as --networks, but read prefixes from a file (one per line,
    /// '#'/'//' comments supported).
    #[arg(short = 'N', long)]
    networks_file: Option<PathBuf>,

    /// Source tag copied into every emitted data-point.
    #[arg(short = 's', long)]
    src_tag: Option<String>,

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
        .map(ActivityFileConfig::from_file)
        .transpose()
    {
        Ok(file) => file.unwrap_or_default(),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };

    let interval = cli.interval.or(file.interval).unwrap_or(600);
    let maxage = cli.maxage.or(file.maxage).unwrap_or(1200);
    if maxage < interval {
        error!("max data age ({maxage}s) can't be less than the interval length ({interval}s)");
        std::process::exit(1);
    }

    let input = cli.input.or(file.input).unwrap_or_else(|| "-".to_string());
    let output = cli.output.or(file.output).unwrap_or_else(|| "-".to_string());
    let src_tag = cli.src_tag.or(file.src_tag).unwrap_or_default();

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
        info!(networks = filter.len(), "only monitoring configured networks");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        interval, maxage, "starting fluxgate activity module"
    );

    let source = match RecordChannel::open(&input).await {
        Ok(source) => source,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };
    let sink = match RecordSink::open(&output).await {
        Ok(sink) => sink,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };

    let stop = StopFlag::new();
    install_signal_handlers(stop.clone());

    let config = ActivityConfig {
        interval,
        maxage,
        src_tag,
    };
    activity::run(source, sink, filter, config, stop).await?;

    info!("finished");
    Ok(())
}
