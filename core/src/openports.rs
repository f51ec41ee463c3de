//! Open-port discovery pipeline.
//!
//! A port counts as open when a successfully established connection to it
//! is observed: for TCP a (bi)flow whose flags carry both SYN and ACK, for
//! UDP (optional) any paired biflow. Uniflow sources go through the
//! pairing cache first. Confirmed ports accumulate in a registry that a
//! wall-clock-aligned sender drains every send interval.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::datapoint::{DataPoint, DP_TYPE_IP};
use crate::filter::NetworkFilter;
use crate::flow::{self, tcp_flags, FlowRecord};
use crate::pairing::{run_rotation, Biflow, PairingCache};
use crate::shutdown::StopFlag;
use crate::sink::HttpSink;
use crate::source::RecordChannel;

pub const ATTR_TCP: &str = "open_ports";
pub const ATTR_UDP: &str = "open_ports_udp";

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// One confirmed open port: observation window and connection count.
#[derive(Debug, Clone, PartialEq)]
pub struct PortRecord {
    pub time_first: DateTime<Utc>,
    pub time_last: DateTime<Utc>,
    pub conns: u64,
}

/// TCP admission: only a conversation whose combined flags carry both SYN
/// and ACK proves a completed handshake. Without SYN it is likely the
/// continuation of a longer flow whose initiator cannot be told from the
/// timestamps; the flags of a paired biflow are the union of both
/// directions, so either side may contribute either flag.
pub fn handshake_flags(flags: u8) -> bool {
    flags & tcp_flags::SYN_ACK == tcp_flags::SYN_ACK
}

/// Registry of confirmed open ports, keyed by `(server_ip, server_port)`.
/// Written by the ingest loop, drained by the sender; the mutex is held
/// only around single-key upserts and the drain swap.
pub struct OpenPortRegistry {
    filter: Arc<NetworkFilter>,
    /// Drop biflows where a well-known client port talks to a high server
    /// port; flow-timestamp jitter sometimes inverts client and server.
    port_sanity_filter: bool,
    ports: Mutex<HashMap<(IpAddr, u16), PortRecord>>,
}

impl OpenPortRegistry {
    pub fn new(filter: Arc<NetworkFilter>, port_sanity_filter: bool) -> Self {
        Self {
            filter,
            port_sanity_filter,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert the biflow's server endpoint. Returns false when a filter
    /// rejected it.
    pub fn record(&self, biflow: &Biflow) -> bool {
        if !self.filter.contains(biflow.server_ip) {
            return false;
        }
        if self.port_sanity_filter && biflow.client_port < 1024 && biflow.server_port > 1024 {
            return false;
        }

        let mut ports = match self.ports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ports
            .entry((biflow.server_ip, biflow.server_port))
            .and_modify(|rec| {
                rec.time_first = rec.time_first.min(biflow.time_first);
                rec.time_last = rec.time_last.max(biflow.time_last);
                rec.conns += 1;
            })
            .or_insert(PortRecord {
                time_first: biflow.time_first,
                time_last: biflow.time_last,
                conns: 1,
            });
        true
    }

    /// Swap the registry out for an empty one and return the snapshot.
    pub fn drain(&self) -> HashMap<(IpAddr, u16), PortRecord> {
        let mut ports = match self.ports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *ports)
    }

    pub fn len(&self) -> usize {
        match self.ports.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Aggregated timestamps can only be inverted if a record with
/// `time_last < time_first` slipped in; such entries are dropped here.
fn emission_valid(ip: IpAddr, port: u16, rec: &PortRecord) -> bool {
    if rec.time_last < rec.time_first {
        warn!(
            %ip,
            port,
            time_first = %rec.time_first,
            time_last = %rec.time_last,
            "open-port record with time_last < time_first, dropping it"
        );
        return false;
    }
    true
}

/// Serialize a drained registry snapshot into data-points.
pub fn registry_datapoints(
    drained: &HashMap<(IpAddr, u16), PortRecord>,
    attr: &str,
    src_tag: &str,
) -> Vec<DataPoint> {
    drained
        .iter()
        .filter(|((ip, port), rec)| emission_valid(*ip, *port, rec))
        .map(|((ip, port), rec)| DataPoint {
            kind: DP_TYPE_IP.to_string(),
            id: ip.to_string(),
            attr: attr.to_string(),
            v: json!(port),
            t1: rec.time_first,
            t2: rec.time_last,
            c: None,
            src: src_tag.to_string(),
        })
        .collect()
}

/// Where open-port data-points go: the collector API, or stdout when no
/// URL was configured (testing/debugging).
pub enum PortSink {
    Http(HttpSink),
    Stdout,
}

/// Drain the registry and ship its contents.
pub async fn send_open_ports(
    registry: &OpenPortRegistry,
    sink: &PortSink,
    attr: &str,
    src_tag: &str,
) {
    let drained = registry.drain();
    if drained.is_empty() {
        return;
    }
    debug!(count = drained.len(), attr, "sending open ports");
    match sink {
        PortSink::Http(http) => {
            let datapoints = registry_datapoints(&drained, attr, src_tag);
            http.post_datapoints(&datapoints).await;
        }
        PortSink::Stdout => {
            for ((ip, port), rec) in &drained {
                if !emission_valid(*ip, *port, rec) {
                    continue;
                }
                println!(
                    "{ip}:{port}  {} - {} ({}x)",
                    rec.time_first.format(TIME_FORMAT),
                    rec.time_last.format(TIME_FORMAT),
                    rec.conns
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenPortsConfig {
    /// Period of sending data to the collector, seconds.
    pub send_interval: u64,
    /// Pairing-cache rotation period, seconds.
    pub cache_rotation: u64,
    /// Also detect open UDP ports.
    pub udp_too: bool,
    /// The client-port sanity filter; disabled by `--no-port-filter`.
    pub port_sanity_filter: bool,
    pub src_tag: String,
}

/// Run the open-ports module until end-of-stream or stop. Residual
/// registry contents are sent before returning.
pub async fn run(
    mut source: RecordChannel,
    sink: PortSink,
    filter: Arc<NetworkFilter>,
    config: OpenPortsConfig,
    stop: StopFlag,
) -> Result<()> {
    let sink = Arc::new(sink);
    let rotation_period = Duration::from_secs(config.cache_rotation);

    let tcp_ports = Arc::new(OpenPortRegistry::new(filter.clone(), config.port_sanity_filter));
    let tcp_cache = Arc::new(PairingCache::tcp());
    tokio::spawn(run_rotation(tcp_cache.clone(), rotation_period, stop.clone()));
    let tcp_sender = tokio::spawn(run_port_sender(
        tcp_ports.clone(),
        sink.clone(),
        ATTR_TCP,
        config.src_tag.clone(),
        config.send_interval,
        stop.clone(),
    ));

    let (udp_ports, udp_cache, udp_sender) = if config.udp_too {
        let ports = Arc::new(OpenPortRegistry::new(filter.clone(), config.port_sanity_filter));
        let cache = Arc::new(PairingCache::udp());
        tokio::spawn(run_rotation(cache.clone(), rotation_period, stop.clone()));
        let sender = tokio::spawn(run_port_sender(
            ports.clone(),
            sink.clone(),
            ATTR_UDP,
            config.src_tag.clone(),
            config.send_interval,
            stop.clone(),
        ));
        (Some(ports), Some(cache), Some(sender))
    } else {
        (None, None, None)
    };

    let mut received = 0u64;
    let mut filtered = 0u64;
    let mut malformed = 0u64;

    while !stop.is_set() {
        let payload = tokio::select! {
            result = source.recv() => match result {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    info!("end of stream");
                    break;
                }
                Err(e) => {
                    error!("source failed: {e:#}");
                    break;
                }
            },
            _ = stop.wait() => break,
        };

        let rec = match FlowRecord::decode(&payload) {
            Ok(rec) => rec,
            Err(e) => {
                malformed += 1;
                debug!("skipping record: {e:#}");
                continue;
            }
        };
        received += 1;

        if !filter.contains(rec.src_ip) && !filter.contains(rec.dst_ip) {
            filtered += 1;
            continue;
        }

        if rec.protocol == flow::PROTO_TCP {
            if rec.packets > 0 && rec.packets_rev_or_zero() > 0 {
                let biflow = Biflow::from_tcp_record(&rec);
                if handshake_flags(biflow.tcp_flags) {
                    tcp_ports.record(&biflow);
                }
            } else if let Some(biflow) = tcp_cache.process(&rec) {
                if handshake_flags(biflow.tcp_flags) {
                    tcp_ports.record(&biflow);
                }
            }
        } else if rec.protocol == flow::PROTO_UDP {
            if let (Some(cache), Some(ports)) = (&udp_cache, &udp_ports) {
                if rec.packets > 0 && rec.packets_rev_or_zero() > 0 {
                    ports.record(&Biflow::from_udp_record(&rec));
                } else if let Some(biflow) = cache.process(&rec) {
                    ports.record(&biflow);
                }
            }
        }
    }

    // Stop the senders (covers the end-of-stream path too), then ship
    // whatever is still in the registries.
    stop.trigger();
    tcp_sender.await.context("sender task failed")?;
    if let Some(sender) = udp_sender {
        sender.await.context("UDP sender task failed")?;
    }
    send_open_ports(&tcp_ports, &sink, ATTR_TCP, &config.src_tag).await;
    if let Some(ports) = &udp_ports {
        send_open_ports(ports, &sink, ATTR_UDP, &config.src_tag).await;
    }

    info!(received, filtered, malformed, "open-ports ingest finished");
    Ok(())
}

async fn run_port_sender(
    registry: Arc<OpenPortRegistry>,
    sink: Arc<PortSink>,
    attr: &'static str,
    src_tag: String,
    period: u64,
    stop: StopFlag,
) {
    loop {
        let deadline = next_aligned_tick(period);
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                send_open_ports(&registry, &sink, attr, &src_tag).await;
            }
            _ = stop.wait() => return,
        }
    }
}

/// The next wall-clock boundary of `period` seconds:
/// `floor(now / period) * period + period`.
pub(crate) fn next_aligned_tick(period: u64) -> tokio::time::Instant {
    let period = Duration::from_secs(period.max(1));
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let into_period = Duration::from_nanos((now.as_nanos() % period.as_nanos()) as u64);
    tokio::time::Instant::now() + (period - into_period)
}
