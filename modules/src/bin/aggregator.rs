use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use fluxgate_core::aggregate;
use fluxgate_core::shutdown::{install_signal_handlers, StopFlag};
use fluxgate_core::sink::RecordSink;
use fluxgate_core::source::RecordChannel;
use fluxgate_modules::config::AggregatorFileConfig;
use fluxgate_modules::init_tracing;

/// Fluxgate data-point aggregator — receive data-point lists, merge
/// duplicates over a time window and re-emit them aggregated.
#[derive(Parser, Debug)]
#[command(name = "fluxgate-aggregator", version, about)]
struct Cli {
    /// Data-point source: '-', 'file:PATH' or 'tcp:HOST:PORT'.
    #[arg(short = 'i', long)]
    input: Option<String>,

    /// Data-point sink: '-', 'file:PATH' or 'tcp:HOST:PORT'.
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Period of sending aggregated data in seconds (default: 900).
    #[arg(short = 'S', long)]
    send_interval: Option<u64>,

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
        .map(AggregatorFileConfig::from_file)
        .transpose()
    {
        Ok(file) => file.unwrap_or_default(),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };

    let send_interval = cli.send_interval.or(file.send_interval).unwrap_or(900);
    if send_interval < 1 {
        error!("send interval must be at least 1 second");
        std::process::exit(1);
    }
    let input = cli.input.or(file.input).unwrap_or_else(|| "-".to_string());
    let output = cli.output.or(file.output).unwrap_or_else(|| "-".to_string());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        send_interval, "starting fluxgate data-point aggregator"
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

    aggregate::run(source, sink, send_interval, stop).await?;

    info!("finished");
    Ok(())
}
