//! Binary flow-record wire format.
//!
//! Fixed-layout, big-endian record carried as one payload of the source
//! channel's length-prefixed framing. Layout (89 bytes):
//!
//! ```text
//! offset  len  field
//! 0       1    format version (currently 1)
//! 1       1    address family (4 or 6)
//! 2       1    protocol
//! 3       1    tcp_flags
//! 4       1    biflow marker (1 = reverse counters valid)
//! 5       16   src address (IPv4 in the first 4 bytes, rest zero)
//! 21      16   dst address
//! 37      2    src_port
//! 39      2    dst_port
//! 41      8    bytes
//! 49      8    packets
//! 57      8    bytes_rev
//! 65      8    packets_rev
//! 73      8    time_first, microseconds since the Unix epoch (signed)
//! 81      8    time_last, microseconds since the Unix epoch (signed)
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::DateTime;

use crate::flow::FlowRecord;

pub const WIRE_VERSION: u8 = 1;
pub const WIRE_RECORD_LEN: usize = 89;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

fn read_addr(family: u8, buf: &[u8]) -> Option<IpAddr> {
    match family {
        FAMILY_V4 => Some(IpAddr::V4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]))),
        FAMILY_V6 => {
            let octets: [u8; 16] = buf[..16].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn write_addr(ip: &IpAddr, buf: &mut [u8]) {
    match ip {
        IpAddr::V4(v4) => buf[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => buf[..16].copy_from_slice(&v6.octets()),
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_be_bytes(
        buf[offset..offset + 8].try_into().ok()?,
    ))
}

fn read_i64(buf: &[u8], offset: usize) -> Option<i64> {
    Some(i64::from_be_bytes(
        buf[offset..offset + 8].try_into().ok()?,
    ))
}

/// Parse one wire record from exactly [`WIRE_RECORD_LEN`] bytes.
///
/// Returns `None` on short input, unknown version or family, or an
/// out-of-range timestamp.
pub fn decode_record(buf: &[u8]) -> Option<FlowRecord> {
    if buf.len() < WIRE_RECORD_LEN {
        return None;
    }
    if buf[0] != WIRE_VERSION {
        return None;
    }
    let family = buf[1];
    let src_ip = read_addr(family, &buf[5..21])?;
    let dst_ip = read_addr(family, &buf[21..37])?;
    let biflow = buf[4] != 0;

    let time_first = DateTime::from_timestamp_micros(read_i64(buf, 73)?)?;
    let time_last = DateTime::from_timestamp_micros(read_i64(buf, 81)?)?;

    Some(FlowRecord {
        src_ip,
        dst_ip,
        src_port: read_u16(buf, 37),
        dst_port: read_u16(buf, 39),
        protocol: buf[2],
        bytes: read_u64(buf, 41)?,
        packets: read_u64(buf, 49)?,
        bytes_rev: if biflow { read_u64(buf, 57) } else { None },
        packets_rev: if biflow { read_u64(buf, 65) } else { None },
        tcp_flags: buf[3],
        time_first,
        time_last,
    })
}

/// Encode a flow record into the wire layout.
pub fn encode_record(rec: &FlowRecord) -> Vec<u8> {
    let mut buf = vec![0u8; WIRE_RECORD_LEN];
    buf[0] = WIRE_VERSION;
    buf[1] = match rec.src_ip {
        IpAddr::V4(_) => FAMILY_V4,
        IpAddr::V6(_) => FAMILY_V6,
    };
    buf[2] = rec.protocol;
    buf[3] = rec.tcp_flags;
    buf[4] = rec.is_biflow() as u8;
    write_addr(&rec.src_ip, &mut buf[5..21]);
    write_addr(&rec.dst_ip, &mut buf[21..37]);
    buf[37..39].copy_from_slice(&rec.src_port.to_be_bytes());
    buf[39..41].copy_from_slice(&rec.dst_port.to_be_bytes());
    buf[41..49].copy_from_slice(&rec.bytes.to_be_bytes());
    buf[49..57].copy_from_slice(&rec.packets.to_be_bytes());
    buf[57..65].copy_from_slice(&rec.bytes_rev_or_zero().to_be_bytes());
    buf[65..73].copy_from_slice(&rec.packets_rev_or_zero().to_be_bytes());
    buf[73..81].copy_from_slice(&rec.time_first.timestamp_micros().to_be_bytes());
    buf[81..89].copy_from_slice(&rec.time_last.timestamp_micros().to_be_bytes());
    buf
}
