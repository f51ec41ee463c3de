//! Time-slot table for per-IP activity counting.
//!
//! Flows are attributed to fixed wall-clock slots `[S, S + interval)`. A
//! flow fully inside one slot increments that slot's counters once; a flow
//! straddling slot boundaries is split proportionally to its per-slot
//! overlap, so the contributions of one flow always sum to its raw totals
//! and to one flow-count per direction that carried packets.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::warn;

use crate::datapoint::round4;
use crate::filter::NetworkFilter;
use crate::flow::FlowRecord;

/// Per-IP, per-slot counters. Flow counts are fractional: a flow spanning
/// several slots contributes its per-slot time fraction to each.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CounterBundle {
    pub in_bytes: f64,
    pub in_packets: f64,
    pub in_flows: f64,
    pub out_bytes: f64,
    pub out_packets: f64,
    pub out_flows: f64,
}

impl CounterBundle {
    /// Add one flow fragment. A direction with zero packets contributes
    /// nothing to its flow count, regardless of the time fraction.
    fn add(
        &mut self,
        in_bytes: f64,
        in_packets: f64,
        out_bytes: f64,
        out_packets: f64,
        fraction: f64,
    ) {
        self.in_bytes += in_bytes;
        self.in_packets += in_packets;
        if in_packets > 0.0 {
            self.in_flows += fraction;
        }
        self.out_bytes += out_bytes;
        self.out_packets += out_packets;
        if out_packets > 0.0 {
            self.out_flows += fraction;
        }
    }

    /// The time-series value of an activity data-point: every counter
    /// rounded to 4 decimals and wrapped in a singleton list, as the
    /// downstream schema expects one list entry per time slot.
    pub fn to_value(&self) -> serde_json::Value {
        json!({
            "in_flows": [round4(self.in_flows)],
            "in_packets": [round4(self.in_packets)],
            "in_bytes": [round4(self.in_bytes)],
            "out_flows": [round4(self.out_flows)],
            "out_packets": [round4(self.out_packets)],
            "out_bytes": [round4(self.out_bytes)],
        })
    }
}

/// Counters of every IP active in one slot.
pub type SlotPayload = HashMap<IpAddr, CounterBundle>;

/// The mutable working set of the activity engine: a contiguous run of
/// slots keyed by slot-start (Unix seconds), plus the monotone current
/// time derived from the maximum observed flow-end timestamp.
pub struct SlotTable {
    interval: i64,
    maxage: i64,
    slots: BTreeMap<i64, SlotPayload>,
    current_time: Option<DateTime<Utc>>,
    /// Largest slot-start ever created; creation continues from here even
    /// across retirement so the run of keys stays contiguous.
    head: i64,
    fold_warned: bool,
    folds: u64,
}

impl SlotTable {
    /// `maxage` must be validated as `>= interval` by the caller.
    pub fn new(interval: u64, maxage: u64) -> Self {
        Self {
            interval: interval as i64,
            maxage: maxage as i64,
            slots: BTreeMap::new(),
            current_time: None,
            head: 0,
            fold_warned: false,
            folds: 0,
        }
    }

    fn slot_of(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp().div_euclid(self.interval) * self.interval
    }

    /// Advance the current time to `t_last` if it is newer. Retires every
    /// slot older than `maxage` (returned in ascending slot order for the
    /// caller to enqueue) and appends missing slots up to
    /// `floor(current_time, interval)` inclusive.
    pub fn advance(&mut self, t_last: DateTime<Utc>) -> Vec<(i64, SlotPayload)> {
        let mut retired = Vec::new();
        match self.current_time {
            None => {
                self.current_time = Some(t_last);
                self.head = self.slot_of(t_last - Duration::seconds(self.maxage));
                self.slots.insert(self.head, SlotPayload::new());
                self.extend_to(self.slot_of(t_last));
            }
            Some(current) if t_last > current => {
                self.current_time = Some(t_last);
                let now_micros = t_last.timestamp_micros();
                while let Some((&slot, _)) = self.slots.first_key_value() {
                    if now_micros - slot * 1_000_000 <= self.maxage * 1_000_000 {
                        break;
                    }
                    if let Some(payload) = self.slots.remove(&slot) {
                        retired.push((slot, payload));
                    }
                }
                self.extend_to(self.slot_of(t_last));
            }
            Some(_) => {}
        }
        retired
    }

    fn extend_to(&mut self, target: i64) {
        while self.head < target {
            self.head += self.interval;
            self.slots.insert(self.head, SlotPayload::new());
            // a fresh slot re-arms the late-arrival warning
            self.fold_warned = false;
        }
    }

    /// Attribute one record to its slot(s). Endpoints are filtered
    /// independently; returns false when neither endpoint passes.
    pub fn observe(&mut self, rec: &FlowRecord, filter: &NetworkFilter) -> bool {
        let src_ok = filter.contains(rec.src_ip);
        let dst_ok = filter.contains(rec.dst_ip);
        if !src_ok && !dst_ok {
            return false;
        }

        let bytes = rec.bytes as f64;
        let packets = rec.packets as f64;
        let bytes_rev = rec.bytes_rev_or_zero() as f64;
        let packets_rev = rec.packets_rev_or_zero() as f64;

        let first_slot = self.slot_of(rec.time_first);
        let duration = rec.duration_secs();
        let start_micros = rec.time_first.timestamp_micros();
        let end_micros = rec.time_last.timestamp_micros();

        // Zero-duration flows take the single-slot path: no division.
        if duration <= 0.0 || end_micros - first_slot * 1_000_000 <= self.interval * 1_000_000 {
            let slot = self.resident_slot(first_slot);
            self.insert(slot, rec, src_ok, dst_ok, bytes, packets, bytes_rev, packets_rev, 1.0);
        } else {
            let mut slot = first_slot;
            while slot * 1_000_000 < end_micros {
                let slot_end_micros = (slot + self.interval) * 1_000_000;
                let overlap = slot_end_micros.min(end_micros) - (slot * 1_000_000).max(start_micros);
                let frac = overlap as f64 / (duration * 1e6);
                let target = self.resident_slot(slot);
                self.insert(
                    target,
                    rec,
                    src_ok,
                    dst_ok,
                    frac * bytes,
                    frac * packets,
                    frac * bytes_rev,
                    frac * packets_rev,
                    frac,
                );
                slot += self.interval;
            }
        }
        true
    }

    /// Increment the counters of both endpoints that passed the filter.
    /// For `src_ip` outgoing = forward counters; for `dst_ip` incoming =
    /// forward counters; the reverse counters take the mirrored roles.
    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        slot: i64,
        rec: &FlowRecord,
        src_ok: bool,
        dst_ok: bool,
        fwd_bytes: f64,
        fwd_packets: f64,
        rev_bytes: f64,
        rev_packets: f64,
        fraction: f64,
    ) {
        let payload = self.slots.entry(slot).or_default();
        if src_ok {
            payload
                .entry(rec.src_ip)
                .or_default()
                .add(rev_bytes, rev_packets, fwd_bytes, fwd_packets, fraction);
        }
        if dst_ok {
            payload
                .entry(rec.dst_ip)
                .or_default()
                .add(fwd_bytes, fwd_packets, rev_bytes, rev_packets, fraction);
        }
    }

    /// Map a wanted slot to a resident one: late fragments whose slot was
    /// already retired fold into the oldest still-resident slot.
    fn resident_slot(&mut self, wanted: i64) -> i64 {
        if self.slots.contains_key(&wanted) {
            return wanted;
        }
        let oldest = self
            .slots
            .first_key_value()
            .map(|(&slot, _)| slot)
            .unwrap_or(wanted);
        self.folds += 1;
        if !self.fold_warned {
            self.fold_warned = true;
            warn!(
                wanted_slot = wanted,
                oldest_slot = oldest,
                "flow belongs to an already-retired slot, folding it into the \
                 oldest resident slot; increase --maxage if this persists"
            );
        }
        oldest
    }

    /// Drain every remaining slot in ascending order (shutdown path).
    pub fn flush(self) -> Vec<(i64, SlotPayload)> {
        self.slots.into_iter().collect()
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// How many flow fragments were folded into the oldest slot.
    pub fn folds(&self) -> u64 {
        self.folds
    }

    /// Resident slot-start keys, ascending.
    pub fn slot_starts(&self) -> Vec<i64> {
        self.slots.keys().copied().collect()
    }
}
