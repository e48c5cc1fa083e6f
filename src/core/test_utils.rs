//! Frame builders shared by the core tests

use crate::capture::Frame;
use std::time::SystemTime;

pub const CLIENT_V4: [u8; 4] = [10, 0, 0, 5];
pub const SERVER_V4: [u8; 4] = [10, 0, 0, 9];
pub const CLIENT_V6: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x05];
pub const SERVER_V6: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x09];

pub fn ethernet_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut data: Vec<u8> = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
    data.extend_from_slice(&ethertype.to_be_bytes());
    data.extend_from_slice(payload);
    data
}

pub fn sll_frame(protocol: u16, payload: &[u8]) -> Vec<u8> {
    // Packet type, ARPHRD_ETHER, address length, padded address
    let mut data: Vec<u8> = vec![0, 0, 0, 1, 0, 6, 0x02, 0, 0, 0, 0, 0x01, 0, 0];
    data.extend_from_slice(&protocol.to_be_bytes());
    data.extend_from_slice(payload);
    data
}

pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], segment: &[u8]) -> Vec<u8> {
    let total_len: u16 = (20 + segment.len()) as u16;
    let mut data: Vec<u8> = vec![0x45, 0x00];
    data.extend_from_slice(&total_len.to_be_bytes());
    data.extend_from_slice(&[0x12, 0x34, 0x40, 0x00, 64, 6, 0, 0]);
    data.extend_from_slice(&src);
    data.extend_from_slice(&dst);
    data.extend_from_slice(segment);
    data
}

pub fn ipv6_packet(src: [u8; 16], dst: [u8; 16], segment: &[u8]) -> Vec<u8> {
    let payload_len: u16 = segment.len() as u16;
    let mut data: Vec<u8> = vec![0x60, 0, 0, 0];
    data.extend_from_slice(&payload_len.to_be_bytes());
    data.extend_from_slice(&[6, 64]);
    data.extend_from_slice(&src);
    data.extend_from_slice(&dst);
    data.extend_from_slice(segment);
    data
}

pub fn tcp_segment(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut data: Vec<u8> = Vec::with_capacity(20 + payload.len());
    data.extend_from_slice(&src_port.to_be_bytes());
    data.extend_from_slice(&dst_port.to_be_bytes());
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&[5 << 4, flags, 0xff, 0xff, 0, 0, 0, 0]);
    data.extend_from_slice(payload);
    data
}

/// Ethernet/IPv4/TCP frame from the test client to the test server
pub fn client_frame(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Frame {
    let segment: Vec<u8> = tcp_segment(src_port, dst_port, flags, payload);
    let data: Vec<u8> = ethernet_frame(0x0800, &ipv4_packet(CLIENT_V4, SERVER_V4, &segment));
    Frame::new(data, SystemTime::UNIX_EPOCH)
}
