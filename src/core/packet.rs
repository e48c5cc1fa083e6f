//! Packet handling module
//!
//! This module strips link, network and transport headers from captured
//! frames and yields the TCP payload with its endpoint metadata.

use crate::capture::{Frame, LinkType};
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use std::net::IpAddr;
use std::time::SystemTime;
use thiserror::Error;
use tracing::trace;

const ETHERNET_HEADER_LEN: usize = 14;
const SLL_HEADER_LEN: usize = 16;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

/// IPv6 extension headers walked to reach the transport header
const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DESTINATION: u8 = 60;

/// TCP flag bits
pub const TCP_FIN: u8 = 0x01;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{layer} header too short: need {needed} bytes, have {have}")]
    PacketTooShort {
        layer: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("invalid {layer} {field}: {reason}")]
    InvalidField {
        layer: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Endpoint metadata and payload recovered from one frame
#[derive(Debug, Clone)]
pub struct PacketInfo {
    /// Source IP address
    pub src_ip: Option<IpAddr>,
    /// Destination IP address
    pub dst_ip: Option<IpAddr>,
    /// Source port
    pub src_port: Option<u16>,
    /// Destination port
    pub dst_port: Option<u16>,
    /// TCP flags
    pub tcp_flags: Option<u8>,
    /// Whether the payload may be incomplete
    pub truncated: bool,
    /// Timestamp when the frame was captured
    pub timestamp: SystemTime,
    /// TCP payload bytes
    pub payload: Vec<u8>,
}

impl PacketInfo {
    fn new(timestamp: SystemTime) -> Self {
        Self {
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            tcp_flags: None,
            truncated: false,
            timestamp,
            payload: Vec::new(),
        }
    }

    /// Whether this segment ends the TCP stream (FIN or RST)
    pub fn closes_stream(&self) -> bool {
        self.tcp_flags
            .map(|flags: u8| flags & (TCP_FIN | TCP_RST) != 0)
            .unwrap_or(false)
    }
}

/// Layered frame decoder for one capture session
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    link_type: LinkType,
}

impl FrameDecoder {
    /// Create a decoder for frames of the given link type
    pub fn new(link_type: LinkType) -> Self {
        Self { link_type }
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Decode one frame
    ///
    /// Layers the decoder does not understand end decoding early; the
    /// returned packet then carries only the layers recovered so far.
    pub fn decode(&self, frame: &Frame) -> Result<PacketInfo, DecodeError> {
        let mut info: PacketInfo = PacketInfo::new(frame.timestamp);
        info.truncated = frame.is_truncated();

        let (ethertype, offset) = self.decode_link(&frame.data)?;
        let network: &[u8] = &frame.data[offset..];
        match ethertype {
            ETHERTYPE_IPV4 => decode_ipv4(network, &mut info)?,
            ETHERTYPE_IPV6 => decode_ipv6(network, &mut info)?,
            other => trace!(ethertype = %format!("{:#06x}", other), "Skipping non-IP frame"),
        }

        Ok(info)
    }

    /// Returns the network protocol tag and the offset of the network header
    fn decode_link(&self, data: &[u8]) -> Result<(u16, usize), DecodeError> {
        let (mut ethertype, mut offset) = match self.link_type {
            LinkType::Ethernet => {
                let ethernet: EthernetPacket<'_> =
                    EthernetPacket::new(data).ok_or(DecodeError::PacketTooShort {
                        layer: "ethernet",
                        needed: ETHERNET_HEADER_LEN,
                        have: data.len(),
                    })?;
                (ethernet.get_ethertype().0, ETHERNET_HEADER_LEN)
            }
            LinkType::LinuxSll => {
                if data.len() < SLL_HEADER_LEN {
                    return Err(DecodeError::PacketTooShort {
                        layer: "linux_sll",
                        needed: SLL_HEADER_LEN,
                        have: data.len(),
                    });
                }
                (read_u16(data, 14), SLL_HEADER_LEN)
            }
        };

        while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
            if data.len() < offset + VLAN_TAG_LEN {
                return Err(DecodeError::PacketTooShort {
                    layer: "vlan",
                    needed: offset + VLAN_TAG_LEN,
                    have: data.len(),
                });
            }
            ethertype = read_u16(data, offset + 2);
            offset += VLAN_TAG_LEN;
        }

        Ok((ethertype, offset))
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn decode_ipv4(data: &[u8], info: &mut PacketInfo) -> Result<(), DecodeError> {
    let ipv4: Ipv4Packet<'_> = Ipv4Packet::new(data).ok_or(DecodeError::PacketTooShort {
        layer: "ipv4",
        needed: IPV4_MIN_HEADER_LEN,
        have: data.len(),
    })?;

    if ipv4.get_version() != 4 {
        return Err(DecodeError::InvalidField {
            layer: "ipv4",
            field: "version",
            reason: format!("expected 4, got {}", ipv4.get_version()),
        });
    }
    let header_len: usize = ipv4.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(DecodeError::InvalidField {
            layer: "ipv4",
            field: "header_length",
            reason: format!("{} bytes is below the minimum", header_len),
        });
    }
    if header_len > data.len() {
        return Err(DecodeError::PacketTooShort {
            layer: "ipv4",
            needed: header_len,
            have: data.len(),
        });
    }
    let total_len: usize = ipv4.get_total_length() as usize;
    if total_len < header_len {
        return Err(DecodeError::InvalidField {
            layer: "ipv4",
            field: "total_length",
            reason: format!("{} is smaller than the header ({})", total_len, header_len),
        });
    }

    info.src_ip = Some(IpAddr::V4(ipv4.get_source()));
    info.dst_ip = Some(IpAddr::V4(ipv4.get_destination()));

    // Ethernet padding follows short packets; the snapshot length cuts long ones
    let end: usize = if total_len > data.len() {
        info.truncated = true;
        data.len()
    } else {
        total_len
    };

    if ipv4.get_fragment_offset() != 0 {
        trace!("Skipping non-first IPv4 fragment");
        return Ok(());
    }
    if ipv4.get_flags() & 0x1 != 0 {
        // More fragments follow, so this payload is partial
        info.truncated = true;
    }

    match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => decode_tcp(&data[header_len..end], info),
        other => {
            trace!(protocol = other.0, "Skipping non-TCP IPv4 packet");
            Ok(())
        }
    }
}

fn decode_ipv6(data: &[u8], info: &mut PacketInfo) -> Result<(), DecodeError> {
    let ipv6: Ipv6Packet<'_> = Ipv6Packet::new(data).ok_or(DecodeError::PacketTooShort {
        layer: "ipv6",
        needed: IPV6_HEADER_LEN,
        have: data.len(),
    })?;

    if ipv6.get_version() != 6 {
        return Err(DecodeError::InvalidField {
            layer: "ipv6",
            field: "version",
            reason: format!("expected 6, got {}", ipv6.get_version()),
        });
    }

    info.src_ip = Some(IpAddr::V6(ipv6.get_source()));
    info.dst_ip = Some(IpAddr::V6(ipv6.get_destination()));

    let claimed_end: usize = IPV6_HEADER_LEN + ipv6.get_payload_length() as usize;
    let end: usize = if claimed_end > data.len() {
        info.truncated = true;
        data.len()
    } else {
        claimed_end
    };

    let mut next_header: u8 = ipv6.get_next_header().0;
    let mut offset: usize = IPV6_HEADER_LEN;
    loop {
        match next_header {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DESTINATION => {
                if end < offset + 2 {
                    return Err(DecodeError::PacketTooShort {
                        layer: "ipv6_extension",
                        needed: offset + 2,
                        have: end,
                    });
                }
                next_header = data[offset];
                offset += (data[offset + 1] as usize + 1) * 8;
                if offset > end {
                    return Err(DecodeError::PacketTooShort {
                        layer: "ipv6_extension",
                        needed: offset,
                        have: end,
                    });
                }
            }
            IPV6_FRAGMENT => {
                if end < offset + 8 {
                    return Err(DecodeError::PacketTooShort {
                        layer: "ipv6_fragment",
                        needed: offset + 8,
                        have: end,
                    });
                }
                let fragment_offset: u16 = read_u16(data, offset + 2) >> 3;
                if fragment_offset != 0 {
                    trace!("Skipping non-first IPv6 fragment");
                    return Ok(());
                }
                info.truncated = true;
                next_header = data[offset];
                offset += 8;
            }
            _ => break,
        }
    }

    if next_header == IpNextHeaderProtocols::Tcp.0 {
        decode_tcp(&data[offset..end], info)
    } else {
        trace!(next_header, "Skipping non-TCP IPv6 packet");
        Ok(())
    }
}

fn decode_tcp(data: &[u8], info: &mut PacketInfo) -> Result<(), DecodeError> {
    let tcp: TcpPacket<'_> = TcpPacket::new(data).ok_or(DecodeError::PacketTooShort {
        layer: "tcp",
        needed: TCP_MIN_HEADER_LEN,
        have: data.len(),
    })?;

    let header_len: usize = tcp.get_data_offset() as usize * 4;
    if header_len < TCP_MIN_HEADER_LEN {
        return Err(DecodeError::InvalidField {
            layer: "tcp",
            field: "data_offset",
            reason: format!("{} bytes is below the minimum", header_len),
        });
    }

    info.src_port = Some(tcp.get_source());
    info.dst_port = Some(tcp.get_destination());
    info.tcp_flags = Some(tcp.get_flags() as u8);

    if header_len > data.len() {
        // Options cut off by the snapshot length
        info.truncated = true;
    } else {
        info.payload = data[header_len..].to_vec();
    }

    Ok(())
}
