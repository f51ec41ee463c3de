//! Shared wiring for the fluxgate module binaries.

pub mod config;

use std::path::Path;

use anyhow::Result;
use fluxgate_core::filter::NetworkFilter;

/// Initialize tracing. `RUST_LOG` wins; otherwise `-v` widens the default
/// filter to debug.
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "fluxgate_core=debug,fluxgate_modules=debug"
    } else {
        "fluxgate_core=info,fluxgate_modules=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Build the network filter from an inline list (comma or space separated)
/// or a prefix file. Inline networks take precedence when both are given.
pub fn build_network_filter(
    networks: Option<&str>,
    networks_file: Option<&Path>,
) -> Result<NetworkFilter> {
    match (networks, networks_file) {
        (Some(list), _) => {
            NetworkFilter::from_list(list.split([',', ' ']).filter(|s| !s.is_empty()))
        }
        (None, Some(path)) => NetworkFilter::from_file(path),
        (None, None) => Ok(NetworkFilter::allow_all()),
    }
}
