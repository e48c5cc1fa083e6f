//! Dredge - passive MongoDB query-shape sniffer
//!
//! Frames are captured from a live interface, a kernel ring or a capture file,
//! decoded down to TCP payloads, reassembled per flow and parsed as MongoDB
//! wire messages. Each request document is reduced to its query shape and
//! published as a JSON record.

pub mod capture;
pub mod config;
pub mod core;
pub mod protocols;
pub mod publish;
pub mod utils;
