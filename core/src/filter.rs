//! IP network filter.
//!
//! An immutable set of IP prefixes answering containment queries for both
//! IPv4 and IPv6 addresses. Built from inline CIDR strings or from a file
//! with one prefix per line (`#` and `//` comments supported). An empty
//! filter means "no filter configured" and accepts every address.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;

#[derive(Debug, Clone, Default)]
pub struct NetworkFilter {
    networks: Vec<IpNetwork>,
}

impl NetworkFilter {
    /// A filter that accepts every address.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build from CIDR strings (IPv4 or IPv6, mixed freely).
    pub fn from_list<I, S>(networks: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for net in networks {
            let net = net.as_ref();
            parsed.push(
                net.parse::<IpNetwork>()
                    .with_context(|| format!("invalid network '{net}'"))?,
            );
        }
        Ok(Self { networks: parsed })
    }

    /// Build from a file with one CIDR per line. Text after `#` or `//` is
    /// stripped; blank lines are ignored. Errors name the offending line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read networks file {}", path.display()))?;
        let mut parsed = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let net = strip_comment(line).trim();
            if net.is_empty() {
                continue;
            }
            parsed.push(net.parse::<IpNetwork>().with_context(|| {
                format!(
                    "invalid network '{}' on line {} of {}",
                    net,
                    idx + 1,
                    path.display()
                )
            })?);
        }
        Ok(Self { networks: parsed })
    }

    /// Whether the address passes the filter. An empty filter passes all.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    /// The configured prefixes, for startup logging.
    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }
}

fn strip_comment(line: &str) -> &str {
    let end = line
        .find('#')
        .into_iter()
        .chain(line.find("//"))
        .min()
        .unwrap_or(line.len());
    &line[..end]
}
