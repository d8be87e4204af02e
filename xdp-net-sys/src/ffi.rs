//! Declarations from `<linux/if_xdp.h>` and the socket-level constants
//! needed to drive an AF_XDP socket.
//!
//! The libc crate only carries part of this header (and its layout of
//! `xdp_umem_reg` has changed across kernel versions), so the structs are
//! spelled out here with the layout the datapath was written against.
#![allow(non_camel_case_types)]

pub use libc::{c_int, c_void, socklen_t};

// ── Address family / socket level ───────────────────────────
pub const AF_XDP: c_int = 44;
pub const PF_XDP: c_int = AF_XDP;
pub const SOL_XDP: c_int = 283;

// ── sockaddr_xdp.sxdp_flags ─────────────────────────────────
pub const XDP_SHARED_UMEM: u16 = 1 << 0;
/// Force copy mode.
pub const XDP_COPY: u16 = 1 << 1;
/// Force zero-copy mode.
pub const XDP_ZEROCOPY: u16 = 1 << 2;
/// Kernel sets `XDP_RING_NEED_WAKEUP` in the ring flags when it wants a kick.
pub const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

// ── xdp_umem_reg.flags ──────────────────────────────────────
pub const XDP_UMEM_UNALIGNED_CHUNK_FLAG: u32 = 1 << 0;

// ── xdp_ring.flags ──────────────────────────────────────────
pub const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

// ── SOL_XDP socket options ──────────────────────────────────
pub const XDP_MMAP_OFFSETS: c_int = 1;
pub const XDP_RX_RING: c_int = 2;
pub const XDP_TX_RING: c_int = 3;
pub const XDP_UMEM_REG: c_int = 4;
pub const XDP_UMEM_FILL_RING: c_int = 5;
pub const XDP_UMEM_COMPLETION_RING: c_int = 6;
pub const XDP_STATISTICS: c_int = 7;
pub const XDP_OPTIONS: c_int = 8;

// ── Page offsets for mmap() of the four rings ───────────────
pub const XDP_PGOFF_RX_RING: i64 = 0;
pub const XDP_PGOFF_TX_RING: i64 = 0x8000_0000;
pub const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x1_0000_0000;
pub const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x1_8000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct sockaddr_xdp {
    pub sxdp_family: u16,
    pub sxdp_flags: u16,
    pub sxdp_ifindex: u32,
    pub sxdp_queue_id: u32,
    pub sxdp_shared_umem_fd: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct xdp_ring_offset {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct xdp_mmap_offsets {
    pub rx: xdp_ring_offset,
    pub tx: xdp_ring_offset,
    /// Fill ring
    pub fr: xdp_ring_offset,
    /// Completion ring
    pub cr: xdp_ring_offset,
}

/// Ring offsets as reported by kernels older than 5.4, which have no
/// `flags` field.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct xdp_ring_offset_v1 {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct xdp_mmap_offsets_v1 {
    pub rx: xdp_ring_offset_v1,
    pub tx: xdp_ring_offset_v1,
    pub fr: xdp_ring_offset_v1,
    pub cr: xdp_ring_offset_v1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct xdp_umem_reg {
    /// Start of packet data area
    pub addr: u64,
    /// Length of packet data area
    pub len: u64,
    pub chunk_size: u32,
    pub headroom: u32,
    pub flags: u32,
    /// TX metadata length (kernel 6.8+). Older kernels see this as padding,
    /// so it must be zero.
    pub tx_metadata_len: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct xdp_statistics {
    /// Dropped for other reasons
    pub rx_dropped: u64,
    /// Dropped due to invalid descriptor
    pub rx_invalid_descs: u64,
    /// Dropped due to invalid descriptor
    pub tx_invalid_descs: u64,
}

/// Rx/Tx descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct xdp_desc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

impl xdp_ring_offset_v1 {
    /// Upgrade to the current layout. Old kernels keep the flags word right
    /// after the consumer cursor.
    pub fn upgrade(self) -> xdp_ring_offset {
        xdp_ring_offset {
            producer: self.producer,
            consumer: self.consumer,
            desc: self.desc,
            flags: self.consumer + std::mem::size_of::<u32>() as u64,
        }
    }
}

impl xdp_mmap_offsets_v1 {
    pub fn upgrade(self) -> xdp_mmap_offsets {
        xdp_mmap_offsets {
            rx: self.rx.upgrade(),
            tx: self.tx.upgrade(),
            fr: self.fr.upgrade(),
            cr: self.cr.upgrade(),
        }
    }
}
