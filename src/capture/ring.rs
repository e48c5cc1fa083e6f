//! Ring-buffer capture for Dredge
//!
//! On Linux this maps a TPACKET_V2 receive ring shared with the kernel, so
//! frames are read without a system call per packet. The ring is sized in
//! blocks of frames from a target size in megabytes.
//!
//! The ring cannot install packet filters. Configurations asking for one
//! are rejected before capture starts.

use crate::capture::{CaptureError, PacketSource};
use crate::config::CaptureConfig;
use tracing::info;

/// Frames grouped into one ring block
pub const FRAMES_PER_BLOCK: usize = 128;

const MEGABYTE: usize = 1024 * 1024;

/// Geometry of the receive ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    /// Bytes reserved per frame slot
    pub frame_size: usize,
    /// Bytes per block
    pub block_size: usize,
    /// Number of blocks in the ring
    pub num_blocks: usize,
}

impl RingLayout {
    /// Frame slots in one block
    pub fn frames_per_block(&self) -> usize {
        self.block_size / self.frame_size
    }

    /// Frame slots in the whole ring
    pub fn frame_count(&self) -> usize {
        self.frames_per_block() * self.num_blocks
    }

    /// Bytes mapped for the whole ring
    pub fn total_size(&self) -> usize {
        self.block_size * self.num_blocks
    }
}

/// Compute ring geometry from a target size, snapshot length and page size
///
/// Snapshot lengths below a page share the page between an integral number
/// of frames; larger ones round up to the next whole page multiple.
pub fn compute_ring_layout(
    target_mb: usize,
    snaplen: usize,
    page_size: usize,
) -> Result<RingLayout, CaptureError> {
    if snaplen == 0 || page_size == 0 {
        return Err(CaptureError::InvalidConfig(format!(
            "snaplen ({}) and page size ({}) must be non-zero",
            snaplen, page_size
        )));
    }

    let frame_size: usize = if snaplen < page_size {
        page_size / (page_size / snaplen)
    } else {
        (snaplen / page_size + 1) * page_size
    };
    let block_size: usize = frame_size * FRAMES_PER_BLOCK;
    let num_blocks: usize = target_mb.saturating_mul(MEGABYTE) / block_size;

    if num_blocks == 0 {
        return Err(CaptureError::BufferTooSmall {
            target_mb,
            block_size,
        });
    }

    Ok(RingLayout {
        frame_size,
        block_size,
        num_blocks,
    })
}

/// System memory page size
pub fn page_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        let size: libc::c_long = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// Open a ring-buffer capture on an interface
pub fn open_ring(interface: &str, config: &CaptureConfig) -> Result<Box<dyn PacketSource>, CaptureError> {
    let layout: RingLayout =
        compute_ring_layout(config.buffer_size_mb, config.snaplen as usize, page_size())?;
    info!(
        interface,
        frame_size = layout.frame_size,
        block_size = layout.block_size,
        num_blocks = layout.num_blocks,
        "Opening ring-buffer capture"
    );
    open_platform_ring(interface, layout, config)
}

#[cfg(target_os = "linux")]
fn open_platform_ring(
    interface: &str,
    layout: RingLayout,
    config: &CaptureConfig,
) -> Result<Box<dyn PacketSource>, CaptureError> {
    let capture: linux::RingCapture = linux::RingCapture::open(interface, layout, config.poll_timeout())?;
    Ok(Box::new(capture))
}

#[cfg(not(target_os = "linux"))]
fn open_platform_ring(
    _interface: &str,
    _layout: RingLayout,
    _config: &CaptureConfig,
) -> Result<Box<dyn PacketSource>, CaptureError> {
    Err(CaptureError::Unsupported("ring-buffer capture requires Linux"))
}

#[cfg(target_os = "linux")]
pub mod linux {
    //! TPACKET_V2 receive ring

    use super::RingLayout;
    use crate::capture::{CaptureError, CaptureStats, Frame, LinkType, PacketSource, ANY_INTERFACE};
    use std::ffi::CString;
    use std::io;
    use std::mem;
    use std::ptr;
    use std::sync::atomic::{fence, Ordering};
    use std::time::{Duration, UNIX_EPOCH};

    const SOL_PACKET: libc::c_int = 263;
    const PACKET_RX_RING: libc::c_int = 5;
    const PACKET_STATISTICS: libc::c_int = 6;
    const PACKET_VERSION: libc::c_int = 10;
    const TPACKET_V2: libc::c_int = 1;
    const ETH_P_ALL: u16 = 0x0003;

    const TP_STATUS_KERNEL: u32 = 0;
    const TP_STATUS_USER: u32 = 1;

    #[repr(C)]
    #[allow(dead_code)]
    struct TpacketReq {
        tp_block_size: libc::c_uint,
        tp_block_nr: libc::c_uint,
        tp_frame_size: libc::c_uint,
        tp_frame_nr: libc::c_uint,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    #[allow(dead_code)]
    struct Tpacket2Hdr {
        tp_status: u32,
        tp_len: u32,
        tp_snaplen: u32,
        tp_mac: u16,
        tp_net: u16,
        tp_sec: u32,
        tp_nsec: u32,
        tp_vlan_tci: u16,
        tp_vlan_tpid: u16,
        tp_padding: [u8; 4],
    }

    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    struct TpacketStats {
        tp_packets: libc::c_uint,
        tp_drops: libc::c_uint,
    }

    /// AF_PACKET socket with a memory-mapped receive ring
    pub struct RingCapture {
        interface: String,
        fd: libc::c_int,
        ring: *mut u8,
        layout: RingLayout,
        frame_index: usize,
        poll_timeout_ms: libc::c_int,
        received: u64,
        dropped: u64,
    }

    // The ring mapping is owned exclusively by this handle.
    unsafe impl Send for RingCapture {}

    impl RingCapture {
        /// Create the socket, map the ring and bind it to an interface
        pub fn open(interface: &str, layout: RingLayout, poll_timeout: Duration) -> Result<Self, CaptureError> {
            let fd: libc::c_int = unsafe {
                libc::socket(libc::AF_PACKET, libc::SOCK_RAW, ETH_P_ALL.to_be() as libc::c_int)
            };
            if fd < 0 {
                return Err(CaptureError::Io(io::Error::last_os_error()));
            }

            // Dropping the partially built handle closes the socket on error
            let mut capture: RingCapture = RingCapture {
                interface: interface.to_string(),
                fd,
                ring: ptr::null_mut(),
                layout,
                frame_index: 0,
                poll_timeout_ms: poll_timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
                received: 0,
                dropped: 0,
            };

            capture.set_option(PACKET_VERSION, &TPACKET_V2)?;
            let request: TpacketReq = TpacketReq {
                tp_block_size: layout.block_size as libc::c_uint,
                tp_block_nr: layout.num_blocks as libc::c_uint,
                tp_frame_size: layout.frame_size as libc::c_uint,
                tp_frame_nr: layout.frame_count() as libc::c_uint,
            };
            capture.set_option(PACKET_RX_RING, &request)?;

            let ring: *mut libc::c_void = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    layout.total_size(),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if ring == libc::MAP_FAILED {
                return Err(CaptureError::Io(io::Error::last_os_error()));
            }
            capture.ring = ring as *mut u8;

            capture.bind()?;
            Ok(capture)
        }

        fn set_option<T>(&self, name: libc::c_int, value: &T) -> Result<(), CaptureError> {
            let rc: libc::c_int = unsafe {
                libc::setsockopt(
                    self.fd,
                    SOL_PACKET,
                    name,
                    value as *const T as *const libc::c_void,
                    mem::size_of::<T>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(CaptureError::Io(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn bind(&self) -> Result<(), CaptureError> {
            let ifindex: libc::c_int = if self.interface == ANY_INTERFACE {
                0
            } else {
                let name: CString = CString::new(self.interface.as_str())
                    .map_err(|_| CaptureError::Interface(format!("invalid interface name {:?}", self.interface)))?;
                let index: libc::c_uint = unsafe { libc::if_nametoindex(name.as_ptr()) };
                if index == 0 {
                    return Err(CaptureError::Interface(format!("unknown interface {}", self.interface)));
                }
                index as libc::c_int
            };

            let mut address: libc::sockaddr_ll = unsafe { mem::zeroed() };
            address.sll_family = libc::AF_PACKET as libc::c_ushort;
            address.sll_protocol = ETH_P_ALL.to_be();
            address.sll_ifindex = ifindex;

            let rc: libc::c_int = unsafe {
                libc::bind(
                    self.fd,
                    &address as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(CaptureError::Io(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn frame_header(&self, index: usize) -> *mut Tpacket2Hdr {
            let per_block: usize = self.layout.frames_per_block();
            let offset: usize =
                (index / per_block) * self.layout.block_size + (index % per_block) * self.layout.frame_size;
            unsafe { self.ring.add(offset) as *mut Tpacket2Hdr }
        }

        fn frame_status(&self, header: *mut Tpacket2Hdr) -> u32 {
            unsafe { ptr::read_volatile(ptr::addr_of!((*header).tp_status)) }
        }

        /// Wait for the ring to become readable; false on timeout
        fn wait_readable(&self) -> Result<bool, CaptureError> {
            let mut poll_fd: libc::pollfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN | libc::POLLERR,
                revents: 0,
            };
            let rc: libc::c_int = unsafe { libc::poll(&mut poll_fd, 1, self.poll_timeout_ms) };
            if rc < 0 {
                let error: io::Error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(CaptureError::Io(error));
            }
            Ok(rc > 0)
        }

        fn release(&mut self) {
            if !self.ring.is_null() {
                unsafe {
                    libc::munmap(self.ring as *mut libc::c_void, self.layout.total_size());
                }
                self.ring = ptr::null_mut();
            }
            if self.fd >= 0 {
                unsafe {
                    libc::close(self.fd);
                }
                self.fd = -1;
            }
        }
    }

    impl PacketSource for RingCapture {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.ring.is_null() {
                return Ok(None);
            }

            let header: *mut Tpacket2Hdr = self.frame_header(self.frame_index);
            if self.frame_status(header) & TP_STATUS_USER == 0 {
                if !self.wait_readable()? || self.frame_status(header) & TP_STATUS_USER == 0 {
                    return Err(CaptureError::Timeout);
                }
            }
            fence(Ordering::Acquire);

            let meta: Tpacket2Hdr = unsafe { ptr::read_volatile(header) };
            let start: usize = (meta.tp_mac as usize).min(self.layout.frame_size);
            let length: usize = (meta.tp_snaplen as usize).min(self.layout.frame_size - start);
            let data: Vec<u8> =
                unsafe { std::slice::from_raw_parts((header as *const u8).add(start), length) }.to_vec();

            // Hand the slot back to the kernel
            fence(Ordering::Release);
            unsafe { ptr::write_volatile(ptr::addr_of_mut!((*header).tp_status), TP_STATUS_KERNEL) };
            self.frame_index = (self.frame_index + 1) % self.layout.frame_count();
            self.received += 1;

            Ok(Some(Frame {
                data,
                timestamp: UNIX_EPOCH + Duration::new(meta.tp_sec as u64, meta.tp_nsec),
                original_len: meta.tp_len,
            }))
        }

        fn link_type(&self) -> LinkType {
            LinkType::Ethernet
        }

        fn stats(&mut self) -> Result<CaptureStats, CaptureError> {
            if self.fd < 0 {
                return Ok(CaptureStats {
                    received: self.received,
                    dropped: self.dropped,
                });
            }

            // The kernel resets its counters on every read
            let mut stats: TpacketStats = TpacketStats::default();
            let mut length: libc::socklen_t = mem::size_of::<TpacketStats>() as libc::socklen_t;
            let rc: libc::c_int = unsafe {
                libc::getsockopt(
                    self.fd,
                    SOL_PACKET,
                    PACKET_STATISTICS,
                    &mut stats as *mut TpacketStats as *mut libc::c_void,
                    &mut length,
                )
            };
            if rc < 0 {
                return Err(CaptureError::Io(io::Error::last_os_error()));
            }
            self.dropped += stats.tp_drops as u64;

            Ok(CaptureStats {
                received: self.received,
                dropped: self.dropped,
            })
        }

        fn close(&mut self) -> Result<(), CaptureError> {
            self.release();
            Ok(())
        }
    }

    impl Drop for RingCapture {
        fn drop(&mut self) {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_large_snaplen() {
        let layout: RingLayout = compute_ring_layout(30, 65535, 4096).unwrap();
        assert_eq!(layout.frame_size, 65536);
        assert_eq!(layout.block_size, 65536 * FRAMES_PER_BLOCK);
        assert_eq!(layout.num_blocks, 3);
        assert_eq!(layout.frames_per_block(), FRAMES_PER_BLOCK);
        assert_eq!(layout.frame_count(), 3 * FRAMES_PER_BLOCK);
    }

    #[test]
    fn test_layout_small_snaplen_shares_page() {
        let layout: RingLayout = compute_ring_layout(30, 1500, 4096).unwrap();
        assert_eq!(layout.frame_size, 2048);
        assert_eq!(layout.block_size, 2048 * FRAMES_PER_BLOCK);
        assert_eq!(layout.num_blocks, 120);
    }

    #[test]
    fn test_layout_snaplen_equal_to_page() {
        let layout: RingLayout = compute_ring_layout(30, 4096, 4096).unwrap();
        assert_eq!(layout.frame_size, 8192);
    }

    #[test]
    fn test_layout_buffer_too_small() {
        let result = compute_ring_layout(1, 65535, 4096);
        match result {
            Err(CaptureError::BufferTooSmall { target_mb, block_size }) => {
                assert_eq!(target_mb, 1);
                assert_eq!(block_size, 65536 * FRAMES_PER_BLOCK);
            }
            other => panic!("expected BufferTooSmall, got {:?}", other),
        }
    }

    #[test]
    fn test_layout_zero_target() {
        assert!(matches!(
            compute_ring_layout(0, 1500, 4096),
            Err(CaptureError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_layout_rejects_zero_inputs() {
        assert!(matches!(compute_ring_layout(30, 0, 4096), Err(CaptureError::InvalidConfig(_))));
        assert!(matches!(compute_ring_layout(30, 1500, 0), Err(CaptureError::InvalidConfig(_))));
    }

    #[test]
    fn test_page_size_positive() {
        assert!(page_size() > 0);
    }
}
