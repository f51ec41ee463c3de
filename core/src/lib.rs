//! Fluxgate core — streaming flow-telemetry aggregation.
//!
//! The engines shared by the fluxgate ingest modules: per-IP activity
//! counting over fixed time slots, open-port discovery via biflow pairing,
//! and data-point aggregation. Each module binary wires an ingest loop
//! (source channel → filter → engine) to an emission pipeline (bounded
//! queue or wall-aligned timer → sink).

pub mod activity;
pub mod aggregate;
pub mod datapoint;
pub mod filter;
pub mod flow;
pub mod openports;
pub mod pairing;
pub mod shutdown;
pub mod sink;
pub mod slots;
pub mod source;
pub mod wire;
