// Single-producer / single-consumer rings shared with the kernel.
//
// Every AF_XDP ring is a power-of-two array of descriptors plus two
// free-running u32 cursors. One side only ever advances `producer`, the other
// only `consumer`; the slot for cursor value `i` is `i & mask`. Each side
// keeps cached copies of both cursors and refreshes the peer's cursor with an
// acquire load only when the cache says it must; its own cursor is published
// with a release store once the slots are written (or read).

use std::marker::PhantomData;
use std::mem::size_of;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use xdp_net_sys::ffi;

use super::mmap::MmapRegion;
use crate::api::{Error, Result};

/// Cache line sized gap between the cursors of an anonymous ring.
const CURSOR_STRIDE: u64 = 64;

/// Memory of one ring: cursors, flags word and descriptor array.
pub struct RingMem {
    region: MmapRegion,
    offsets: ffi::xdp_ring_offset,
    size: u32,
}

impl RingMem {
    /// Map a kernel ring of `size` descriptors of `T` at page offset `pgoff`.
    pub fn kernel<T>(
        fd: BorrowedFd<'_>,
        offsets: ffi::xdp_ring_offset,
        pgoff: i64,
        size: u32,
    ) -> Result<Arc<Self>> {
        Self::check_size(size)?;
        let len = offsets.desc as usize + size as usize * size_of::<T>();
        let region = MmapRegion::shared(fd, len, pgoff)?;
        tracing::debug!(
            "mapped ring pgoff={:#x} size={} producer={} consumer={} flags={} desc={}",
            pgoff,
            size,
            offsets.producer,
            offsets.consumer,
            offsets.flags,
            offsets.desc
        );
        Ok(Arc::new(RingMem {
            region,
            offsets,
            size,
        }))
    }

    /// A ring with the kernel layout, backed by private memory. Both ends are
    /// driven from userspace.
    pub fn anonymous<T>(size: u32) -> Result<Arc<Self>> {
        Self::check_size(size)?;
        let offsets = ffi::xdp_ring_offset {
            producer: 0,
            consumer: CURSOR_STRIDE,
            flags: 2 * CURSOR_STRIDE,
            desc: 3 * CURSOR_STRIDE,
        };
        let len = offsets.desc as usize + size as usize * size_of::<T>();
        let region = MmapRegion::anonymous(len)?;
        Ok(Arc::new(RingMem {
            region,
            offsets,
            size,
        }))
    }

    fn check_size(size: u32) -> Result<()> {
        if size == 0 || !size.is_power_of_two() {
            return Err(Error::InvalidConfig("ring size must be a power of two"));
        }
        Ok(())
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    fn word(&self, offset: u64) -> NonNull<AtomicU32> {
        // mmap never returns null and the offsets lie inside the mapping.
        unsafe { NonNull::new_unchecked(self.region.as_ptr().add(offset as usize) as *mut AtomicU32) }
    }

    fn producer(&self) -> NonNull<AtomicU32> {
        self.word(self.offsets.producer)
    }

    fn consumer(&self) -> NonNull<AtomicU32> {
        self.word(self.offsets.consumer)
    }

    fn flags(&self) -> NonNull<AtomicU32> {
        self.word(self.offsets.flags)
    }

    fn descs<T>(&self) -> NonNull<T> {
        unsafe { NonNull::new_unchecked(self.region.as_ptr().add(self.offsets.desc as usize) as *mut T) }
    }

    /// Snapshot of the ring for diagnostics.
    pub fn info(&self) -> RingInfo {
        let producer = unsafe { self.producer().as_ref() }.load(Ordering::Relaxed);
        let consumer = unsafe { self.consumer().as_ref() }.load(Ordering::Relaxed);
        RingInfo {
            size: self.size,
            busy: producer.wrapping_sub(consumer),
            producer,
            consumer,
        }
    }

    /// Set flag bits, as the kernel does with `XDP_RING_NEED_WAKEUP`.
    pub fn set_flags(&self, bits: u32) {
        unsafe { self.flags().as_ref() }.fetch_or(bits, Ordering::Release);
    }

    pub fn clear_flags(&self, bits: u32) {
        unsafe { self.flags().as_ref() }.fetch_and(!bits, Ordering::Release);
    }
}

impl std::fmt::Debug for RingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingMem")
            .field("size", &self.size)
            .field("info", &self.info())
            .finish()
    }
}

/// Ring state as seen from outside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingInfo {
    /// Capacity in descriptors
    pub size: u32,
    /// Descriptors produced and not yet consumed
    pub busy: u32,
    pub producer: u32,
    pub consumer: u32,
}

impl std::fmt::Display for RingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "size {:4}, busy {:4} (prod {:4}, cons {:4})",
            self.size, self.busy, self.producer, self.consumer
        )
    }
}

/// Producer end of a ring.
pub struct ProdRing<T> {
    mem: Arc<RingMem>,
    producer: NonNull<AtomicU32>,
    consumer: NonNull<AtomicU32>,
    flags: NonNull<AtomicU32>,
    descs: NonNull<T>,
    mask: u32,
    size: u32,
    cached_prod: u32,
    cached_cons: u32,
    _marker: PhantomData<T>,
}

// Single producer: the handle may move between threads, never be shared.
unsafe impl<T: Send> Send for ProdRing<T> {}

impl<T: Copy> ProdRing<T> {
    pub fn new(mem: Arc<RingMem>) -> Self {
        let producer = mem.producer();
        let consumer = mem.consumer();
        let size = mem.size();
        let cached_prod = unsafe { producer.as_ref() }.load(Ordering::Relaxed);
        let cached_cons = unsafe { consumer.as_ref() }
            .load(Ordering::Acquire)
            .wrapping_add(size);
        Self {
            flags: mem.flags(),
            descs: mem.descs(),
            producer,
            consumer,
            mask: size - 1,
            size,
            cached_prod,
            cached_cons,
            _marker: PhantomData,
            mem,
        }
    }

    /// Number of slots that can be reserved, refreshing the consumer cursor
    /// if the cached view has fewer than `wanted`.
    #[inline]
    pub fn free(&mut self, wanted: u32) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if free >= wanted {
            return free;
        }
        self.cached_cons = unsafe { self.consumer.as_ref() }
            .load(Ordering::Acquire)
            .wrapping_add(self.size);
        self.cached_cons.wrapping_sub(self.cached_prod)
    }

    /// Reserve `n` consecutive slots, all or nothing. Returns the cursor of
    /// the first one.
    #[inline]
    pub fn reserve(&mut self, n: u32) -> Option<u32> {
        if self.free(n) < n {
            return None;
        }
        let idx = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(n);
        Some(idx)
    }

    /// Write a reserved slot.
    #[inline]
    pub fn write(&mut self, idx: u32, value: T) {
        unsafe { self.descs.as_ptr().add((idx & self.mask) as usize).write(value) }
    }

    /// Reserve one slot and write it. The entry becomes visible on the next
    /// `submit`.
    #[inline]
    pub fn push(&mut self, value: T) -> bool {
        match self.reserve(1) {
            Some(idx) => {
                self.write(idx, value);
                true
            }
            None => false,
        }
    }

    /// Publish `n` previously reserved slots to the consumer.
    #[inline]
    pub fn submit(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        let producer = unsafe { self.producer.as_ref() };
        let cur = producer.load(Ordering::Relaxed);
        producer.store(cur.wrapping_add(n), Ordering::Release);
    }

    /// Whether the kernel asked to be woken up for this ring.
    #[inline]
    pub fn needs_wakeup(&self) -> bool {
        unsafe { self.flags.as_ref() }.load(Ordering::Relaxed) & ffi::XDP_RING_NEED_WAKEUP != 0
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn info(&self) -> RingInfo {
        self.mem.info()
    }

    pub fn mem(&self) -> &Arc<RingMem> {
        &self.mem
    }
}

/// Consumer end of a ring.
pub struct ConsRing<T> {
    mem: Arc<RingMem>,
    producer: NonNull<AtomicU32>,
    consumer: NonNull<AtomicU32>,
    descs: NonNull<T>,
    mask: u32,
    size: u32,
    cached_prod: u32,
    cached_cons: u32,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for ConsRing<T> {}

impl<T: Copy> ConsRing<T> {
    pub fn new(mem: Arc<RingMem>) -> Self {
        let producer = mem.producer();
        let consumer = mem.consumer();
        let size = mem.size();
        let cached_prod = unsafe { producer.as_ref() }.load(Ordering::Acquire);
        let cached_cons = unsafe { consumer.as_ref() }.load(Ordering::Relaxed);
        Self {
            descs: mem.descs(),
            producer,
            consumer,
            mask: size - 1,
            size,
            cached_prod,
            cached_cons,
            _marker: PhantomData,
            mem,
        }
    }

    /// Number of entries ready to consume, refreshing the producer cursor
    /// when the cached view is exhausted.
    #[inline]
    pub fn available(&mut self) -> u32 {
        let entries = self.cached_prod.wrapping_sub(self.cached_cons);
        if entries != 0 {
            return entries;
        }
        self.cached_prod = unsafe { self.producer.as_ref() }.load(Ordering::Acquire);
        self.cached_prod.wrapping_sub(self.cached_cons)
    }

    /// Number of entries ready to consume, always re-reading the producer
    /// cursor.
    #[inline]
    pub fn refresh(&mut self) -> u32 {
        self.cached_prod = unsafe { self.producer.as_ref() }.load(Ordering::Acquire);
        self.cached_prod.wrapping_sub(self.cached_cons)
    }

    /// Claim up to `max` entries. Returns how many and the cursor of the
    /// first. Zero is a valid answer.
    #[inline]
    pub fn peek(&mut self, max: u32) -> (u32, u32) {
        let n = self.available().min(max);
        let idx = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(n);
        (n, idx)
    }

    /// Read a peeked slot.
    #[inline]
    pub fn read(&self, idx: u32) -> T {
        unsafe { self.descs.as_ptr().add((idx & self.mask) as usize).read() }
    }

    /// Hand `n` peeked slots back to the producer.
    #[inline]
    pub fn release(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        let consumer = unsafe { self.consumer.as_ref() };
        let cur = consumer.load(Ordering::Relaxed);
        consumer.store(cur.wrapping_add(n), Ordering::Release);
    }

    /// Peek, read and release up to `max` entries in one go.
    pub fn consume<F>(&mut self, max: u32, mut f: F) -> u32
    where
        F: FnMut(T),
    {
        let (n, idx) = self.peek(max);
        for i in 0..n {
            f(self.read(idx.wrapping_add(i)));
        }
        self.release(n);
        n
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn info(&self) -> RingInfo {
        self.mem.info()
    }

    pub fn mem(&self) -> &Arc<RingMem> {
        &self.mem
    }
}

/// Producer and consumer ends over the same anonymous memory.
pub fn anonymous_pair<T: Copy>(size: u32) -> Result<(ProdRing<T>, ConsRing<T>)> {
    let mem = RingMem::anonymous::<T>(size)?;
    Ok((ProdRing::new(mem.clone()), ConsRing::new(mem)))
}
