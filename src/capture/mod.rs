//! Packet capture module for Dredge
//!
//! This module handles frame acquisition from network interfaces, the Linux
//! packet ring and capture files, behind the [`PacketSource`] trait.

pub mod pcap;
pub mod ring;

use crate::config::{CaptureBackend, CaptureConfig};
use std::time::SystemTime;
use thiserror::Error;
use tracing::info;

/// Pseudo-interface capturing on every interface at once
pub const ANY_INTERFACE: &str = "any";

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("PCAP error: {0}")]
    Pcap(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Poll timeout expired")]
    Timeout,

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Buffer size too small: {target_mb} MB cannot hold one {block_size} byte block")]
    BufferTooSmall { target_mb: usize, block_size: usize },

    #[error("Invalid capture configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported link type: {0}")]
    UnsupportedLinkType(i32),
}

impl CaptureError {
    /// Whether this error means the capture can never start
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CaptureError::Unsupported(_)
                | CaptureError::BufferTooSmall { .. }
                | CaptureError::InvalidConfig(_)
                | CaptureError::UnsupportedLinkType(_)
        )
    }
}

/// Link-layer encapsulation of captured frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II
    Ethernet,
    /// Linux cooked capture, used by the `any` pseudo-interface
    LinuxSll,
}

impl LinkType {
    /// Link type expected when capturing live on an interface
    pub fn for_interface(interface: &str) -> Self {
        if interface == ANY_INTERFACE {
            LinkType::LinuxSll
        } else {
            LinkType::Ethernet
        }
    }
}

/// One raw frame read from a capture source
#[derive(Debug, Clone)]
pub struct Frame {
    /// Captured bytes
    pub data: Vec<u8>,
    /// Arrival time
    pub timestamp: SystemTime,
    /// Length of the frame on the wire
    pub original_len: u32,
}

impl Frame {
    /// Create a frame that was captured in full
    pub fn new(data: Vec<u8>, timestamp: SystemTime) -> Self {
        let original_len: u32 = data.len() as u32;
        Self {
            data,
            timestamp,
            original_len,
        }
    }

    /// Whether the snapshot length cut off part of the frame
    pub fn is_truncated(&self) -> bool {
        self.original_len as usize > self.data.len()
    }
}

/// Capture statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames delivered by the capture source
    pub received: u64,
    /// Frames dropped by the kernel before they could be read
    pub dropped: u64,
}

/// Frame source trait for different capture methods
pub trait PacketSource: Send {
    /// Read the next frame
    ///
    /// `Ok(None)` marks the end of the stream. `Err(CaptureError::Timeout)`
    /// means the poll interval passed without traffic.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Link-layer encapsulation of every frame from this source
    fn link_type(&self) -> LinkType;

    /// Whether [`PacketSource::set_filter`] is available
    fn supports_filter(&self) -> bool {
        false
    }

    /// Install a BPF filter expression
    fn set_filter(&mut self, _filter: &str) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported("packet filters are not supported by this backend"))
    }

    /// Get capture statistics
    fn stats(&mut self) -> Result<CaptureStats, CaptureError>;

    /// Release the capture handle
    fn close(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// List available network interfaces
pub fn list_interfaces() -> Result<Vec<String>, CaptureError> {
    match ::pcap::Device::list() {
        Ok(devices) => Ok(devices.into_iter().map(|d| d.name).collect()),
        Err(e) => Err(CaptureError::Interface(e.to_string())),
    }
}

/// Open the capture source selected by the configuration
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn PacketSource>, CaptureError> {
    if let Some(path) = &config.pcap_file {
        info!(path = %path, "Reading frames from capture file");
        return Ok(Box::new(pcap::PcapFileSource::open(path)?));
    }

    let interface: &str = config.interface_name();
    match config.backend {
        CaptureBackend::Pcap => {
            info!(interface, snaplen = config.snaplen, "Opening live capture");
            let capture: pcap::LiveCapture = pcap::LiveCapture::open(
                interface,
                config.snaplen,
                config.poll_timeout(),
                config.promiscuous,
            )?;
            Ok(Box::new(capture))
        }
        CaptureBackend::Ring => ring::open_ring(interface, config),
    }
}
