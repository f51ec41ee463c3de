//! Activity pipeline.
//!
//! Ingest loop: pull flow records from the source, advance the slot table
//! (retired slots go to a bounded hand-off queue), attribute the record.
//! Sender task: take slots off the queue in order and emit one activity
//! data-point per IP. Closing the queue is the end sentinel; per-slot
//! emission order is strictly ascending because retirement is ascending
//! and the ingest loop is the only producer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::datapoint::{DataPoint, DP_TYPE_IP};
use crate::filter::NetworkFilter;
use crate::flow::FlowRecord;
use crate::shutdown::StopFlag;
use crate::sink::RecordSink;
use crate::slots::{SlotPayload, SlotTable};
use crate::source::RecordChannel;

pub const ATTR_ACTIVITY: &str = "activity";

/// Capacity of the slot hand-off queue. A full queue blocks the ingest
/// loop, backpressuring the source.
pub const EMIT_QUEUE_CAPACITY: usize = 5;

#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Slot length in seconds.
    pub interval: u64,
    /// Slot retirement threshold in seconds; validated `>= interval`.
    pub maxage: u64,
    /// Copied into every emitted data-point.
    pub src_tag: String,
}

/// Run the activity module until end-of-stream or stop. Drains every
/// resident slot, in ascending order, before returning.
pub async fn run(
    mut source: RecordChannel,
    sink: RecordSink,
    filter: NetworkFilter,
    config: ActivityConfig,
    stop: StopFlag,
) -> Result<()> {
    let (queue_tx, queue_rx) = mpsc::channel(EMIT_QUEUE_CAPACITY);
    let sender = tokio::spawn(run_sender(
        queue_rx,
        sink,
        config.interval as i64,
        config.src_tag.clone(),
    ));

    let mut table = SlotTable::new(config.interval, config.maxage);
    let mut received = 0u64;
    let mut filtered = 0u64;
    let mut malformed = 0u64;

    'ingest: while !stop.is_set() {
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
        if rec.time_last < rec.time_first {
            debug!(
                src = %rec.src_ip,
                dst = %rec.dst_ip,
                "record has time_last < time_first"
            );
        }

        for slot in table.advance(rec.time_last) {
            if queue_tx.send(slot).await.is_err() {
                error!("emission queue closed early");
                break 'ingest;
            }
        }
        if table.observe(&rec, &filter) {
            received += 1;
        } else {
            filtered += 1;
        }
    }

    let folds = table.folds();
    for slot in table.flush() {
        if queue_tx.send(slot).await.is_err() {
            break;
        }
    }
    drop(queue_tx);
    sender.await.context("sender task failed")??;

    info!(received, filtered, malformed, folded = folds, "activity ingest finished");
    Ok(())
}

async fn run_sender(
    mut queue: mpsc::Receiver<(i64, SlotPayload)>,
    mut sink: RecordSink,
    interval: i64,
    src_tag: String,
) -> Result<()> {
    while let Some((slot_start, payload)) = queue.recv().await {
        if payload.is_empty() {
            continue;
        }
        let t1 = slot_datetime(slot_start);
        let t2 = slot_datetime(slot_start + interval);
        debug!(slot = %t1, ips = payload.len(), "sending slot");
        for (ip, counters) in &payload {
            let dp = DataPoint {
                kind: DP_TYPE_IP.to_string(),
                id: ip.to_string(),
                attr: ATTR_ACTIVITY.to_string(),
                v: counters.to_value(),
                t1,
                t2,
                c: None,
                src: src_tag.clone(),
            };
            if let Err(e) = sink.send(std::slice::from_ref(&dp)).await {
                warn!(ip = %ip, "dropping datapoint, sink write failed: {e:#}");
            }
        }
    }
    sink.close().await?;
    Ok(())
}

fn slot_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
