//! Optional TOML configuration files.
//!
//! Every value here mirrors a CLI option; precedence is CLI flag, then
//! config file, then the built-in default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;

fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    toml::de::from_str(&contents)
        .with_context(|| format!("cannot parse config file {}", path.display()))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityFileConfig {
    pub input: Option<String>,
    pub output: Option<String>,
    pub interval: Option<u64>,
    pub maxage: Option<u64>,
    pub src_tag: Option<String>,
    pub networks: Option<String>,
    pub networks_file: Option<PathBuf>,
}

impl ActivityFileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load(path)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenPortsFileConfig {
    pub input: Option<String>,
    pub url: Option<String>,
    pub send_interval: Option<u64>,
    pub cache_rotation: Option<u64>,
    pub src_tag: Option<String>,
    pub networks: Option<String>,
    pub networks_file: Option<PathBuf>,
    pub udp_too: Option<bool>,
    pub no_port_filter: Option<bool>,
}

impl OpenPortsFileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load(path)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregatorFileConfig {
    pub input: Option<String>,
    pub output: Option<String>,
    pub send_interval: Option<u64>,
}

impl AggregatorFileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(tag: &str, contents: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("fluxgate-cfg-{tag}-{}.toml", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_activity_config_partial_file() {
        let path = write_temp("act", "interval = 300\nsrc_tag = \"probe-1\"\n");
        let config = ActivityFileConfig::from_file(&path).expect("config should parse");
        std::fs::remove_file(&path).ok();

        assert_eq!(config.interval, Some(300));
        assert_eq!(config.src_tag.as_deref(), Some("probe-1"));
        assert_eq!(config.maxage, None, "unset keys stay None");
    }

    #[test]
    fn test_openports_config_flags() {
        let path = write_temp(
            "op",
            "url = \"http://collector:5000\"\nudp_too = true\ncache_rotation = 60\n",
        );
        let config = OpenPortsFileConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.url.as_deref(), Some("http://collector:5000"));
        assert_eq!(config.udp_too, Some(true));
        assert_eq!(config.cache_rotation, Some(60));
    }

    #[test]
    fn test_config_bad_toml_fails() {
        let path = write_temp("bad", "interval = \"not a number\"\n");
        let err = ActivityFileConfig::from_file(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{err:#}").contains("cannot parse"));
    }

    #[test]
    fn test_config_missing_file_fails() {
        assert!(ActivityFileConfig::from_file(Path::new("/nonexistent/fluxgate.toml")).is_err());
    }
}
