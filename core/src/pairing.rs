//! Biflow pairing cache.
//!
//! Flow sources that export each direction of a conversation as a separate
//! record need the two directions paired back together before open-port
//! detection. Unmatched records are cached under their forward key; a
//! record whose reverse key is cached pops it and yields a [`Biflow`].
//!
//! The cache keeps two generations: `current` (reads and writes) and
//! `previous` (reads only). A background task rotates them every R seconds,
//! so an unmatched entry lives at most 2R before being dropped: bounded
//! memory with a soft TTL and no per-entry timers.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::flow::FlowRecord;
use crate::shutdown::StopFlag;

/// Directed 4-tuple of one uniflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn of(rec: &FlowRecord) -> Self {
        Self {
            src_ip: rec.src_ip,
            src_port: rec.src_port,
            dst_ip: rec.dst_ip,
            dst_port: rec.dst_port,
        }
    }

    pub fn reversed(self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedFlow {
    time_first: DateTime<Utc>,
    time_last: DateTime<Utc>,
    tcp_flags: u8,
}

/// A paired conversation in canonical client → server orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct Biflow {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub time_first: DateTime<Utc>,
    pub time_last: DateTime<Utc>,
    pub tcp_flags: u8,
}

impl Biflow {
    /// A TCP record that already carries both directions: the exporter's
    /// orientation is trusted (src = client).
    pub fn from_tcp_record(rec: &FlowRecord) -> Self {
        Self {
            client_ip: rec.src_ip,
            client_port: rec.src_port,
            server_ip: rec.dst_ip,
            server_port: rec.dst_port,
            time_first: rec.time_first,
            time_last: rec.time_last,
            tcp_flags: rec.tcp_flags,
        }
    }

    /// A UDP record carrying both directions; there are no timestamps to
    /// lean on, so the lower port is taken as the server side.
    pub fn from_udp_record(rec: &FlowRecord) -> Self {
        let key = orient_udp(FlowKey::of(rec));
        Self {
            client_ip: key.src_ip,
            client_port: key.src_port,
            server_ip: key.dst_ip,
            server_port: key.dst_port,
            time_first: rec.time_first,
            time_last: rec.time_last,
            tcp_flags: 0,
        }
    }
}

/// Protocol-specific orientation and flag handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMode {
    Tcp,
    Udp,
}

#[derive(Default)]
struct Generations {
    current: HashMap<FlowKey, CachedFlow>,
    previous: HashMap<FlowKey, CachedFlow>,
}

/// Two-generation pairing cache. The ingest task is the only lookup/insert
/// caller; the rotation task only swaps the generations. The mutex is held
/// for single-key pops/inserts and for the O(1) swap, never longer.
pub struct PairingCache {
    mode: PairingMode,
    generations: Mutex<Generations>,
}

impl PairingCache {
    pub fn tcp() -> Self {
        Self::new(PairingMode::Tcp)
    }

    pub fn udp() -> Self {
        Self::new(PairingMode::Udp)
    }

    pub fn new(mode: PairingMode) -> Self {
        Self {
            mode,
            generations: Mutex::new(Generations::default()),
        }
    }

    /// Try to pair `rec` with the cached opposite direction.
    ///
    /// On a hit the cached entry is consumed (pop semantics, idempotent)
    /// and the canonical biflow is returned. On a miss the record is cached
    /// under its forward key, overwriting any stale entry there; a repeat
    /// of the same key this soon is an old record whose reverse will never
    /// come.
    pub fn process(&self, rec: &FlowRecord) -> Option<Biflow> {
        let key = FlowKey::of(rec);
        let rev_key = key.reversed();

        let mut generations = match self.generations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cached = generations
            .current
            .remove(&rev_key)
            .or_else(|| generations.previous.remove(&rev_key));

        match cached {
            Some(reverse) => {
                drop(generations);
                Some(self.pair(rec, key, reverse))
            }
            None => {
                generations.current.insert(
                    key,
                    CachedFlow {
                        time_first: rec.time_first,
                        time_last: rec.time_last,
                        tcp_flags: rec.tcp_flags,
                    },
                );
                None
            }
        }
    }

    fn pair(&self, rec: &FlowRecord, key: FlowKey, reverse: CachedFlow) -> Biflow {
        let oriented = match self.mode {
            PairingMode::Tcp => orient_tcp(key, rec.time_first, reverse.time_first),
            PairingMode::Udp => orient_udp(key),
        };
        let tcp_flags = match self.mode {
            PairingMode::Tcp => rec.tcp_flags | reverse.tcp_flags,
            PairingMode::Udp => 0,
        };
        Biflow {
            client_ip: oriented.src_ip,
            client_port: oriented.src_port,
            server_ip: oriented.dst_ip,
            server_port: oriented.dst_port,
            time_first: rec.time_first.min(reverse.time_first),
            time_last: rec.time_last.max(reverse.time_last),
            tcp_flags,
        }
    }

    /// Snapshot the current generation as the new previous one and empty
    /// the current. An in-flight lookup observing the old snapshot is fine:
    /// both generations are searched either way.
    pub fn rotate(&self) {
        let mut generations = match self.generations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        generations.previous = std::mem::take(&mut generations.current);
    }

    /// Entry counts `(current, previous)`, for logging and tests.
    pub fn len(&self) -> (usize, usize) {
        let generations = match self.generations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (generations.current.len(), generations.previous.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }
}

/// Client → server orientation for TCP: the direction with the earlier
/// `time_first` initiated the connection; on a timestamp tie the side with
/// the larger port is the client (well-known ports are servers).
fn orient_tcp(
    key: FlowKey,
    time_first_current: DateTime<Utc>,
    time_first_cached: DateTime<Utc>,
) -> FlowKey {
    if time_first_current < time_first_cached
        || (time_first_current == time_first_cached && key.dst_port <= key.src_port)
    {
        key
    } else {
        key.reversed()
    }
}

/// Client → server orientation for UDP: the lower port is the server.
fn orient_udp(key: FlowKey) -> FlowKey {
    if key.dst_port < key.src_port {
        key
    } else {
        key.reversed()
    }
}

/// Rotate `cache` every `period` until the stop flag is set. Spawn with
/// `tokio::spawn`; the task exits on shutdown, any cached residue is
/// dropped with the process.
pub async fn run_rotation(cache: std::sync::Arc<PairingCache>, period: Duration, stop: StopFlag) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                cache.rotate();
                let (current, previous) = cache.len();
                debug!(current, previous, "pairing cache rotated");
            }
            _ = stop.wait() => return,
        }
    }
}
