//! Data-point aggregator.
//!
//! Receives already-formed data-points, groups them by
//! `(type, id, attr, canonical_json(v))`, and emits one aggregated
//! data-point per group on every wall-clock tick: minimum `t1`, maximum
//! `t2`, maximum confidence (1.0 when absent), and the union of source
//! tags. A thin instance of the emission pattern shared by the flow
//! modules; its reason to exist is the stable canonical-key rule.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::datapoint::{canonical_json, DataPoint};
use crate::openports::next_aligned_tick;
use crate::shutdown::StopFlag;
use crate::sink::RecordSink;
use crate::source::RecordChannel;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    kind: String,
    id: String,
    attr: String,
    /// Canonical rendering of `v`; arbitrary JSON values must compare
    /// stably regardless of key order.
    value: String,
}

struct GroupAccum {
    v: Value,
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    c: f64,
    src: BTreeSet<String>,
}

#[derive(Default)]
pub struct DpAggregator {
    groups: Mutex<HashMap<GroupKey, GroupAccum>>,
}

impl DpAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch of data-points into the running groups.
    pub fn ingest(&self, datapoints: Vec<DataPoint>) {
        let mut groups = match self.groups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for dp in datapoints {
            let key = GroupKey {
                kind: dp.kind,
                id: dp.id,
                attr: dp.attr,
                value: canonical_json(&dp.v),
            };
            let confidence = dp.c.unwrap_or(1.0);
            let entry = groups.entry(key).or_insert_with(|| GroupAccum {
                v: dp.v,
                t1: dp.t1,
                t2: dp.t2,
                c: 0.0,
                src: BTreeSet::new(),
            });
            entry.t1 = entry.t1.min(dp.t1);
            entry.t2 = entry.t2.max(dp.t2);
            entry.c = entry.c.max(confidence);
            if !dp.src.is_empty() {
                entry.src.insert(dp.src);
            }
        }
    }

    /// Swap the groups out and render one data-point per group. Ordering
    /// across groups is unspecified.
    pub fn drain(&self) -> Vec<DataPoint> {
        let drained = {
            let mut groups = match self.groups.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *groups)
        };
        drained
            .into_iter()
            .map(|(key, accum)| DataPoint {
                kind: key.kind,
                id: key.id,
                attr: key.attr,
                v: accum.v,
                t1: accum.t1,
                t2: accum.t2,
                c: Some(accum.c),
                src: accum.src.into_iter().collect::<Vec<_>>().join(","),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        match self.groups.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run the aggregator module until end-of-stream or stop. The sender
/// drains on every wall-aligned tick and once more on shutdown.
pub async fn run(
    mut source: RecordChannel,
    sink: RecordSink,
    send_interval: u64,
    stop: StopFlag,
) -> Result<()> {
    let aggregator = Arc::new(DpAggregator::new());
    let sender = tokio::spawn(run_drain(
        aggregator.clone(),
        sink,
        send_interval,
        stop.clone(),
    ));

    let mut received = 0u64;
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

        let datapoints: Vec<DataPoint> = match serde_json::from_slice(&payload) {
            Ok(list) => list,
            Err(e) => {
                malformed += 1;
                warn!("cannot decode received data-point list: {e}");
                continue;
            }
        };
        received += datapoints.len() as u64;
        aggregator.ingest(datapoints);
    }

    stop.trigger();
    sender.await.context("sender task failed")??;
    info!(received, malformed, "aggregator ingest finished");
    Ok(())
}

async fn run_drain(
    aggregator: Arc<DpAggregator>,
    mut sink: RecordSink,
    period: u64,
    stop: StopFlag,
) -> Result<()> {
    loop {
        let deadline = next_aligned_tick(period);
        let stopping = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => false,
            _ = stop.wait() => true,
        };

        let datapoints = aggregator.drain();
        if !datapoints.is_empty() {
            debug!(count = datapoints.len(), "sending aggregated datapoints");
        }
        for dp in datapoints {
            if let Err(e) = sink.send(std::slice::from_ref(&dp)).await {
                warn!("dropping aggregated datapoint, sink write failed: {e:#}");
            }
        }

        if stopping {
            sink.close().await?;
            return Ok(());
        }
    }
}
