//! Flow record input model.
//!
//! A [`FlowRecord`] is one summary of IP traffic between two endpoints with
//! first/last timestamps and packet/byte counts. Bidirectional exporters
//! fill `bytes_rev`/`packets_rev`; unidirectional ones leave them absent.

use std::net::IpAddr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// TCP flag bits as carried in exported flow records.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
    /// Both SYN and ACK: the mark of a completed handshake.
    pub const SYN_ACK: u8 = SYN | ACK;
}

/// One flow record as delivered by the source channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub packets: u64,
    /// Reverse-direction bytes; present iff the record is bidirectional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_rev: Option<u64>,
    /// Reverse-direction packets; present iff the record is bidirectional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets_rev: Option<u64>,
    #[serde(default)]
    pub tcp_flags: u8,
    pub time_first: DateTime<Utc>,
    pub time_last: DateTime<Utc>,
}

impl FlowRecord {
    /// Decode one source payload: JSON object (`{` first byte) or the
    /// fixed-layout binary wire record of [`crate::wire`].
    pub fn decode(payload: &[u8]) -> anyhow::Result<FlowRecord> {
        if payload.first() == Some(&b'{') {
            serde_json::from_slice(payload).context("malformed JSON flow record")
        } else {
            crate::wire::decode_record(payload).context("malformed binary flow record")
        }
    }

    /// Whether the exporter delivered both directions in this record.
    pub fn is_biflow(&self) -> bool {
        self.bytes_rev.is_some() || self.packets_rev.is_some()
    }

    pub fn bytes_rev_or_zero(&self) -> u64 {
        self.bytes_rev.unwrap_or(0)
    }

    pub fn packets_rev_or_zero(&self) -> u64 {
        self.packets_rev.unwrap_or(0)
    }

    /// Flow duration in seconds with microsecond precision. Negative when
    /// the record violates `time_first <= time_last`.
    pub fn duration_secs(&self) -> f64 {
        (self.time_last.timestamp_micros() - self.time_first.timestamp_micros()) as f64 / 1e6
    }
}
