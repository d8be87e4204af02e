// UMEM: the frame arena shared with the kernel
//
// One page-aligned region sliced into fixed-size frames. Frames
// `0..tx_frame_count` are reserved for transmission and tracked by the free
// list below; the remaining frames are donated to the kernel for reception
// and only ever travel Fill -> RX -> userspace -> Fill.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::mmap::MmapRegion;
use super::queue::FillQueue;
use crate::api::{Error, Result};
use crate::config::XdpConfig;

/// Used to tell apart frames of different sockets.
static NEXT_UMEM_ID: AtomicU32 = AtomicU32::new(1);

/// Index of a frame inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIdx(pub u32);

impl FrameIdx {
    /// Frame containing `addr`. The address may point anywhere inside the
    /// frame.
    #[inline]
    pub fn from_addr(addr: u64, frame_size: u32) -> Self {
        FrameIdx((addr / frame_size as u64) as u32)
    }

    /// Offset of the first byte of the frame.
    #[inline]
    pub fn addr(self, frame_size: u32) -> u64 {
        self.0 as u64 * frame_size as u64
    }
}

/// Stack of TX frame indices owned by userspace and not in use.
#[derive(Debug)]
pub struct FreeList {
    indices: Vec<u32>,
    capacity: u32,
}

impl FreeList {
    /// A full list holding `0..count`.
    pub fn new(count: u32) -> Self {
        let mut indices = Vec::with_capacity(count as usize);
        // Pop order starts at frame 0.
        indices.extend((0..count).rev());
        Self {
            indices,
            capacity: count,
        }
    }

    /// Take one frame. `None` means every TX frame is in flight.
    #[inline]
    pub fn alloc(&mut self) -> Option<FrameIdx> {
        self.indices.pop().map(FrameIdx)
    }

    /// Return a frame.
    #[inline]
    pub fn free(&mut self, idx: FrameIdx) {
        debug_assert!(idx.0 < self.capacity, "frame {} is not a TX frame", idx.0);
        debug_assert!(
            (self.indices.len() as u32) < self.capacity,
            "TX free list overflow"
        );
        self.indices.push(idx.0);
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.indices.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// The frame arena and its TX free list.
pub struct Umem {
    id: u32,
    area: Arc<MmapRegion>,
    frame_size: u32,
    rx_frame_count: u32,
    tx_frame_count: u32,
    free: FreeList,
}

impl Umem {
    /// Map the arena for `config`. The config must already be validated.
    pub fn new(config: &XdpConfig) -> Result<Self> {
        let area = MmapRegion::anonymous(config.arena_len())?;
        tracing::debug!(
            "UMEM: {} frames x {} bytes at {:p}",
            config.frame_count(),
            config.frame_size,
            area.as_ptr()
        );
        Ok(Self {
            id: NEXT_UMEM_ID.fetch_add(1, Ordering::Relaxed),
            area: Arc::new(area),
            frame_size: config.frame_size,
            rx_frame_count: config.rx_frame_count,
            tx_frame_count: config.tx_frame_count,
            free: FreeList::new(config.tx_frame_count),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.rx_frame_count + self.tx_frame_count
    }

    #[inline]
    pub fn rx_frame_count(&self) -> u32 {
        self.rx_frame_count
    }

    #[inline]
    pub fn tx_frame_count(&self) -> u32 {
        self.tx_frame_count
    }

    /// Whether `idx` belongs to the TX partition.
    #[inline]
    pub fn is_tx_frame(&self, idx: FrameIdx) -> bool {
        idx.0 < self.tx_frame_count
    }

    /// Whether `idx` exists at all.
    #[inline]
    pub fn contains(&self, idx: FrameIdx) -> bool {
        idx.0 < self.frame_count()
    }

    /// The shared mapping, for handing to the kernel or a loopback peer.
    pub fn area(&self) -> &Arc<MmapRegion> {
        &self.area
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    /// Take a TX frame from the free list.
    #[inline]
    pub fn alloc_tx(&mut self) -> Option<FrameIdx> {
        self.free.alloc()
    }

    /// Return the TX frame containing `addr` (an arena offset).
    #[inline]
    pub fn free_tx(&mut self, addr: u64) {
        self.free.free(FrameIdx::from_addr(addr, self.frame_size));
    }

    /// Hand every RX frame to the kernel through the Fill queue.
    pub fn donate_rx(&self, fill: &mut FillQueue) -> Result<()> {
        let first = fill
            .reserve(self.rx_frame_count)
            .ok_or(Error::InvalidConfig("fill ring smaller than the RX frame count"))?;
        for i in 0..self.rx_frame_count {
            let idx = FrameIdx(self.tx_frame_count + i);
            fill.write(first.wrapping_add(i), idx.addr(self.frame_size));
        }
        fill.submit(self.rx_frame_count);
        Ok(())
    }

    /// Bytes of one frame.
    ///
    /// # Safety
    /// The frame must be owned by userspace (not sitting in any ring), and no
    /// mutable view of it may be alive.
    #[inline]
    pub unsafe fn frame(&self, idx: FrameIdx) -> &[u8] {
        assert!(self.contains(idx));
        unsafe {
            std::slice::from_raw_parts(
                self.area.as_ptr().add(idx.addr(self.frame_size) as usize),
                self.frame_size as usize,
            )
        }
    }

    /// Mutable bytes of one frame.
    ///
    /// # Safety
    /// The frame must be owned by userspace, and the caller must hold the
    /// only view of it.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn frame_mut(&self, idx: FrameIdx) -> &mut [u8] {
        assert!(self.contains(idx));
        unsafe {
            std::slice::from_raw_parts_mut(
                self.area.as_ptr().add(idx.addr(self.frame_size) as usize),
                self.frame_size as usize,
            )
        }
    }
}

impl std::fmt::Debug for Umem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Umem")
            .field("id", &self.id)
            .field("frame_size", &self.frame_size)
            .field("rx_frame_count", &self.rx_frame_count)
            .field("tx_frame_count", &self.tx_frame_count)
            .field("tx_free", &self.free.len())
            .finish()
    }
}
