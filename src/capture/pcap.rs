//! libpcap capture sources for Dredge
//!
//! This module handles live capture on a named interface (or `any`) and
//! offline replay of capture files.

use crate::capture::{CaptureError, CaptureStats, Frame, LinkType, PacketSource};
use pcap::{Activated, Active, Capture, Linktype, Offline};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Live capture through libpcap
pub struct LiveCapture {
    /// Interface name
    interface: String,
    /// Capture handle, released on close
    capture: Option<Capture<Active>>,
    /// Link type of captured frames
    link_type: LinkType,
}

impl LiveCapture {
    /// Open a live capture on an interface
    pub fn open(
        interface: &str,
        snaplen: u32,
        poll_timeout: Duration,
        promiscuous: bool,
    ) -> Result<Self, CaptureError> {
        let capture: Capture<Active> = Capture::from_device(interface)
            .map_err(|e: pcap::Error| CaptureError::Interface(format!("{}: {}", interface, e)))?
            .promisc(promiscuous)
            .snaplen(snaplen.min(i32::MAX as u32) as i32)
            .timeout(poll_timeout.as_millis().min(i32::MAX as u128) as i32)
            .open()
            .map_err(|e: pcap::Error| CaptureError::Pcap(format!("{}: {}", interface, e)))?;

        let link_type: LinkType = link_type_from_pcap(capture.get_datalink())
            .unwrap_or_else(|| LinkType::for_interface(interface));
        debug!(interface, ?link_type, "Live capture opened");

        Ok(Self {
            interface: interface.to_string(),
            capture: Some(capture),
            link_type,
        })
    }
}

impl PacketSource for LiveCapture {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.capture.as_mut() {
            Some(capture) => read_frame(capture),
            None => Ok(None),
        }
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn supports_filter(&self) -> bool {
        true
    }

    fn set_filter(&mut self, filter: &str) -> Result<(), CaptureError> {
        match self.capture.as_mut() {
            Some(capture) => install_filter(capture, filter),
            None => Err(CaptureError::Pcap("capture already closed".to_string())),
        }
    }

    fn stats(&mut self) -> Result<CaptureStats, CaptureError> {
        let capture: &mut Capture<Active> = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::Pcap("capture already closed".to_string()))?;
        let stat: pcap::Stat = capture
            .stats()
            .map_err(|e: pcap::Error| CaptureError::Pcap(e.to_string()))?;

        Ok(CaptureStats {
            received: stat.received as u64,
            dropped: stat.dropped as u64 + stat.if_dropped as u64,
        })
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        if self.capture.take().is_some() {
            debug!(interface = %self.interface, "Live capture closed");
        }
        Ok(())
    }
}

/// PCAP file reader for offline replay
pub struct PcapFileSource {
    /// PCAP file path
    file_path: String,
    /// Capture handle
    capture: Option<Capture<Offline>>,
    /// Link type from the file header
    link_type: LinkType,
    /// Frames read so far
    frames_read: u64,
}

impl PcapFileSource {
    /// Open a capture file
    pub fn open(file_path: &str) -> Result<Self, CaptureError> {
        let capture: Capture<Offline> = Capture::from_file(file_path)
            .map_err(|e: pcap::Error| CaptureError::Pcap(format!("{}: {}", file_path, e)))?;

        let datalink: Linktype = capture.get_datalink();
        let link_type: LinkType =
            link_type_from_pcap(datalink).ok_or(CaptureError::UnsupportedLinkType(datalink.0))?;

        Ok(Self {
            file_path: file_path.to_string(),
            capture: Some(capture),
            link_type,
            frames_read: 0,
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let frame: Option<Frame> = match self.capture.as_mut() {
            Some(capture) => read_frame(capture)?,
            None => None,
        };
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn supports_filter(&self) -> bool {
        true
    }

    fn set_filter(&mut self, filter: &str) -> Result<(), CaptureError> {
        match self.capture.as_mut() {
            Some(capture) => install_filter(capture, filter),
            None => Err(CaptureError::Pcap("capture already closed".to_string())),
        }
    }

    fn stats(&mut self) -> Result<CaptureStats, CaptureError> {
        // Nothing is dropped when replaying a file
        Ok(CaptureStats {
            received: self.frames_read,
            dropped: 0,
        })
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        if self.capture.take().is_some() {
            debug!(path = %self.file_path, frames = self.frames_read, "Capture file closed");
        }
        Ok(())
    }
}

fn link_type_from_pcap(datalink: Linktype) -> Option<LinkType> {
    match datalink {
        Linktype::ETHERNET => Some(LinkType::Ethernet),
        Linktype::LINUX_SLL => Some(LinkType::LinuxSll),
        _ => None,
    }
}

fn read_frame<T: Activated + ?Sized>(capture: &mut Capture<T>) -> Result<Option<Frame>, CaptureError> {
    match capture.next_packet() {
        Ok(packet) => {
            let timestamp: SystemTime = UNIX_EPOCH
                + Duration::new(
                    packet.header.ts.tv_sec as u64,
                    packet.header.ts.tv_usec as u32 * 1000,
                );
            Ok(Some(Frame {
                data: packet.data.to_vec(),
                timestamp,
                original_len: packet.header.len,
            }))
        }
        Err(pcap::Error::TimeoutExpired) => Err(CaptureError::Timeout),
        Err(pcap::Error::NoMorePackets) => Ok(None),
        Err(e) => Err(CaptureError::Pcap(e.to_string())),
    }
}

fn install_filter<T: Activated + ?Sized>(capture: &mut Capture<T>, filter: &str) -> Result<(), CaptureError> {
    capture
        .filter(filter, true)
        .map_err(|e: pcap::Error| CaptureError::InvalidConfig(format!("filter `{}`: {}", filter, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_type_mapping() {
        assert_eq!(link_type_from_pcap(Linktype::ETHERNET), Some(LinkType::Ethernet));
        assert_eq!(link_type_from_pcap(Linktype::LINUX_SLL), Some(LinkType::LinuxSll));
        assert_eq!(link_type_from_pcap(Linktype(105)), None);
    }

    #[test]
    fn test_missing_capture_file() {
        let result = PcapFileSource::open("/nonexistent/dredge/trace.pcap");
        assert!(matches!(result, Err(CaptureError::Pcap(_))));
    }
}
