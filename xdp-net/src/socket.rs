//! The AF_XDP socket handle and its batch receive/send API.
//!
//! A typical server loop:
//!
//! ```ignore
//! let mut sock = XdpSocket::open("eth0", 0, 53, NoFilter, XdpConfig::default())?;
//! let mut rx: ArrayVec<Message, 32> = ArrayVec::new();
//! let mut tx: ArrayVec<Message, 32> = ArrayVec::new();
//! loop {
//!     sock.send_prepare()?;
//!     sock.receive(&mut rx)?;
//!     for msg in &rx {
//!         let mut out = sock.send_alloc(msg.flags, Some(msg))?;
//!         sock.write_payload(&mut out, sock.payload(msg));
//!         tx.push(out);
//!     }
//!     sock.send(tx.drain(..))?;
//!     sock.send_finish()?;
//!     sock.receive_finish(rx.drain(..))?;
//! }
//! ```

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use arrayvec::ArrayVec;
use xdp_net_sys::ffi;

use crate::api::xsk::iface::{Interface, XdpFilter};
use crate::api::xsk::mmap::MmapRegion;
use crate::api::xsk::queue::{PeerRings, RingsInfo, XdpDesc, XskRings};
use crate::api::xsk::ring::RingMem;
use crate::api::xsk::sock::{XskFd, classify_wakeup_error};
use crate::api::xsk::umem::{FrameIdx, Umem};
use crate::api::{Errno, Error, Result};
use crate::config::XdpConfig;
use crate::packet::hdr::XDP_PACKET_HEADROOM;
use crate::packet::{self, Message, MsgFlags, PayloadRef};

/// A zero-copy UDP/TCP packet socket bound to one interface queue.
///
/// All datapath calls take `&mut self`; a socket is driven by one thread at
/// a time. After [`close`](Self::close) every call fails with
/// `Error::InvalidState`.
pub struct XdpSocket {
    inner: Option<Active>,
}

// Field order is drop order: the kernel socket goes away before the rings
// and the arena it points into are unmapped.
struct Active {
    link: Link,
    rings: XskRings,
    umem: Umem,
    kernel_needs_wakeup: bool,
    need_wakeup_mode: bool,
    stats: XdpStats,
}

enum Link {
    Kernel(KernelLink),
    Loopback(Arc<LoopbackShared>),
}

struct KernelLink {
    iface: Interface,
    filter: Box<dyn XdpFilter>,
    xsk: XskFd,
}

impl Drop for KernelLink {
    fn drop(&mut self) {
        self.filter.stop(&self.iface);
    }
}

#[derive(Debug, Default)]
struct LoopbackShared {
    wakeups: AtomicU64,
    /// Errno the next wakeups fail with, 0 for none.
    fail_errno: AtomicI32,
}

/// Cumulative counters of one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpStats {
    pub rx_packets: u64,
    /// Frames dropped because they could not be parsed
    pub rx_malformed: u64,
    pub tx_packets: u64,
    /// Messages handed to `send` but not transmitted
    pub tx_skipped: u64,
    pub wakeups: u64,
    pub wakeups_busy: u64,
    /// Kernel counters, zero on a loopback socket
    pub kernel_rx_dropped: u64,
    pub kernel_rx_invalid_descs: u64,
    pub kernel_tx_invalid_descs: u64,
}

/// Frame accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdpInfo {
    /// RX frames in neither the Fill nor the RX ring: held by the
    /// application, in flight inside the kernel, or leaked.
    pub lost_rx: u32,
    /// TX frames in none of the free list, TX ring and Completion ring.
    pub lost_tx: u32,
    pub tx_free: u32,
    pub rings: RingsInfo,
}

impl fmt::Display for XdpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LOST RX frames: {:4}", self.lost_rx)?;
        writeln!(f, "LOST TX frames: {:4}", self.lost_tx)?;
        writeln!(f, "Free TX frames: {:4}", self.tx_free)?;
        writeln!(f, "Ring FQ: {}", self.rings.fill)?;
        writeln!(f, "Ring RX: {}", self.rings.rx)?;
        writeln!(f, "Ring TX: {}", self.rings.tx)?;
        writeln!(f, "Ring CQ: {}", self.rings.comp)
    }
}

impl XdpSocket {
    /// Create a socket on queue `queue` of interface `if_name` and hand it to
    /// `filter` to start steering traffic for `listen_port`.
    ///
    /// Needs CAP_NET_RAW (and CAP_IPC_LOCK or a high enough memlock limit for
    /// the arena). Anything created before a failing step is released again.
    pub fn open<F>(
        if_name: &str,
        queue: u32,
        listen_port: u16,
        filter: F,
        config: XdpConfig,
    ) -> Result<Self>
    where
        F: XdpFilter + 'static,
    {
        config.validate()?;
        let iface = Interface::resolve(if_name, queue)?;
        let umem = Umem::new(&config)?;
        let xsk = XskFd::new()?;
        xsk.register_umem(&umem)?;
        let mut rings = xsk.map_rings(&config)?;
        umem.donate_rx(&mut rings.fill)?;
        xsk.bind(&iface, config.bind_flags())?;

        let mut filter: Box<dyn XdpFilter> = Box::new(filter);
        filter
            .start(&iface, listen_port, xsk.as_fd())
            .map_err(Error::Filter)?;

        tracing::info!(
            "XDP socket open on {}, port {}, {} RX + {} TX frames of {} bytes, mode {:?}",
            iface,
            listen_port,
            config.rx_frame_count,
            config.tx_frame_count,
            config.frame_size,
            config.bind_mode
        );
        Ok(XdpSocket {
            inner: Some(Active {
                link: Link::Kernel(KernelLink { iface, filter, xsk }),
                rings,
                umem,
                kernel_needs_wakeup: false,
                need_wakeup_mode: config.need_wakeup,
                stats: XdpStats::default(),
            }),
        })
    }

    /// A socket without a kernel behind it. The returned peer plays the
    /// kernel's role on the other end of the four rings.
    pub fn loopback(config: XdpConfig) -> Result<(Self, LoopbackPeer)> {
        config.validate()?;
        let umem = Umem::new(&config)?;
        let (mut rings, peer_rings) = XskRings::anonymous(&config)?;
        umem.donate_rx(&mut rings.fill)?;
        let shared = Arc::new(LoopbackShared::default());

        let peer = LoopbackPeer {
            tx_ring: peer_rings.tx.mem().clone(),
            rings: peer_rings,
            area: umem.area().clone(),
            frame_size: umem.frame_size(),
            shared: shared.clone(),
        };
        tracing::debug!(
            "loopback XDP socket, {} RX + {} TX frames",
            config.rx_frame_count,
            config.tx_frame_count
        );
        let sock = XdpSocket {
            inner: Some(Active {
                link: Link::Loopback(shared),
                rings,
                umem,
                kernel_needs_wakeup: false,
                need_wakeup_mode: config.need_wakeup,
                stats: XdpStats::default(),
            }),
        };
        Ok((sock, peer))
    }

    /// Detach the filter, close the socket and release all memory. Messages
    /// still held by the caller become dead handles. Idempotent.
    pub fn close(&mut self) {
        if let Some(active) = self.inner.take() {
            match &active.link {
                Link::Kernel(k) => tracing::info!("closing XDP socket on {}", k.iface),
                Link::Loopback(_) => tracing::debug!("closing loopback XDP socket"),
            }
            drop(active);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    fn active(&self) -> Result<&Active> {
        self.inner.as_ref().ok_or(Error::InvalidState)
    }

    fn active_mut(&mut self) -> Result<&mut Active> {
        self.inner.as_mut().ok_or(Error::InvalidState)
    }

    /// Descriptor to poll for readability. `None` for a loopback socket.
    pub fn fd(&self) -> Result<Option<BorrowedFd<'_>>> {
        Ok(match &self.active()?.link {
            Link::Kernel(k) => Some(k.xsk.as_fd()),
            Link::Loopback(_) => None,
        })
    }

    /// Take up to `msgs.remaining_capacity()` received packets. Never blocks;
    /// zero is a normal result.
    ///
    /// The frames stay with the caller until they are passed to
    /// [`receive_finish`](Self::receive_finish).
    pub fn receive<const N: usize>(&mut self, msgs: &mut ArrayVec<Message, N>) -> Result<usize> {
        let active = self.active_mut()?;
        let (n, idx) = active.rings.rx.peek(msgs.remaining_capacity() as u32);
        if n == 0 {
            return Ok(0);
        }
        let mut got = 0;
        let mut recycled = 0;
        for i in 0..n {
            let desc = active.rings.rx.read(idx.wrapping_add(i));
            match active.rx_message(&desc) {
                Ok(msg) => {
                    msgs.push(msg);
                    got += 1;
                }
                Err(e) => {
                    active.stats.rx_malformed += 1;
                    let frame = FrameIdx::from_addr(desc.addr, active.umem.frame_size());
                    tracing::warn!(
                        "dropping frame {} (addr {:#x}, len {}): {}",
                        frame.0,
                        desc.addr,
                        desc.len,
                        e
                    );
                    if active.umem.contains(frame) && !active.umem.is_tx_frame(frame) {
                        if active.rings.fill.push(frame.addr(active.umem.frame_size())) {
                            recycled += 1;
                        } else {
                            tracing::warn!("fill ring full, frame {} lost", frame.0);
                        }
                    }
                }
            }
        }
        active.rings.rx.release(n);
        active.rings.fill.submit(recycled);
        active.stats.rx_packets += got as u64;
        tracing::trace!("received {} packets ({} dropped)", got, n - got);
        Ok(got as usize)
    }

    /// Give the frames of received messages back to the kernel for reuse.
    pub fn receive_finish<I>(&mut self, msgs: I) -> Result<()>
    where
        I: IntoIterator<Item = Message>,
    {
        let active = self.active_mut()?;
        let mut filled = 0;
        for msg in msgs {
            if active.return_frame(&msg) {
                filled += 1;
            }
        }
        active.rings.fill.submit(filled);
        Ok(())
    }

    /// Reclaim transmitted frames from the Completion ring. Returns how many
    /// frames went back to the free list.
    pub fn send_prepare(&mut self) -> Result<u32> {
        let active = self.active_mut()?;
        let umem = &mut active.umem;
        let n = active.rings.comp.consume(u32::MAX, |addr| umem.free_tx(addr));
        if n > 0 {
            tracing::trace!("reclaimed {} TX frames", n);
        }
        Ok(n)
    }

    /// Allocate a message for sending.
    ///
    /// The payload starts out at full capacity; write it with
    /// [`payload_mut`](Self::payload_mut) and trim it with
    /// [`Message::set_payload_len`], or use
    /// [`write_payload`](Self::write_payload). With `reply_to`, the addresses
    /// are those of the received message swapped, and TCP numbers continue
    /// its stream.
    ///
    /// Fails with `Error::NoFrame` when every TX frame is in flight; call
    /// [`send_prepare`](Self::send_prepare) and retry.
    pub fn send_alloc(&mut self, flags: MsgFlags, reply_to: Option<&Message>) -> Result<Message> {
        let active = self.active_mut()?;
        let frame = active.umem.alloc_tx().ok_or(Error::NoFrame)?;
        let offset = packet::payload_offset(flags);
        let cap = (active.umem.frame_size() as usize - offset).min(u16::MAX as usize) as u16;
        let mut msg = Message::new(
            flags,
            PayloadRef {
                owner: active.umem.id(),
                frame,
                offset: offset as u16,
                len: cap,
                cap,
            },
        );
        packet::encode::prepare(&mut msg, reply_to);
        Ok(msg)
    }

    /// Encode and queue messages for transmission. Returns how many were
    /// queued.
    ///
    /// Empty UDP messages, and empty TCP segments carrying none of
    /// SYN/ACK/FIN, are dropped silently. Messages whose headers cannot be
    /// written (flags changed after allocation, address family mismatch) are
    /// dropped with a warning. Either way the frame returns to the pool.
    pub fn send<I>(&mut self, msgs: I) -> Result<u32>
    where
        I: IntoIterator<Item = Message>,
    {
        let active = self.active_mut()?;
        let frame_size = active.umem.frame_size();
        let mut sent = 0;
        let mut filled = 0;
        for msg in msgs {
            if !active.owns(&msg) {
                continue;
            }
            let frame = msg.frame();
            if !active.umem.is_tx_frame(frame) {
                // A received message; its frame belongs to the Fill ring.
                tracing::warn!("frame {} is not a TX frame, not sending", frame.0);
                if active.return_frame(&msg) {
                    filled += 1;
                }
                active.stats.tx_skipped += 1;
                continue;
            }
            if !should_send(&msg) {
                active.umem.free_tx(frame.addr(frame_size));
                active.stats.tx_skipped += 1;
                continue;
            }
            // The frame is a TX frame owned by this message.
            let bytes = unsafe { active.umem.frame_mut(frame) };
            let len = match packet::encode(bytes, &msg) {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!("cannot send {:?} message: {}", msg.flags, e);
                    active.umem.free_tx(frame.addr(frame_size));
                    active.stats.tx_skipped += 1;
                    continue;
                }
            };
            let desc = XdpDesc {
                addr: frame.addr(frame_size),
                len: len as u32,
                options: 0,
            };
            if active.rings.tx.push(desc) {
                sent += 1;
            } else {
                tracing::warn!("TX ring full, frame {} dropped", frame.0);
                active.umem.free_tx(desc.addr);
                active.stats.tx_skipped += 1;
            }
        }
        active.rings.fill.submit(filled);
        active.rings.tx.submit(sent);
        if sent > 0 {
            active.kernel_needs_wakeup = true;
        }
        active.stats.tx_packets += sent as u64;
        tracing::trace!("queued {} packets", sent);
        Ok(sent)
    }

    /// Kick the kernel if anything was queued since the last successful kick.
    ///
    /// `Error::Busy` means the kernel is congested; the kick stays pending and
    /// the call should be repeated later.
    pub fn send_finish(&mut self) -> Result<()> {
        let active = self.active_mut()?;
        if !active.kernel_needs_wakeup {
            return Ok(());
        }
        if active.need_wakeup_mode && !active.rings.tx.needs_wakeup() {
            active.kernel_needs_wakeup = false;
            return Ok(());
        }
        let ret = match &active.link {
            Link::Kernel(k) => k.xsk.wakeup(),
            Link::Loopback(shared) => shared.wakeup(),
        };
        match ret {
            Ok(()) => {
                active.kernel_needs_wakeup = false;
                active.stats.wakeups += 1;
                Ok(())
            }
            Err(Error::Busy) => {
                active.stats.wakeups_busy += 1;
                Err(Error::Busy)
            }
            Err(e) => {
                tracing::warn!("TX wakeup failed: {}", e);
                active.kernel_needs_wakeup = false;
                Err(e)
            }
        }
    }

    /// Payload bytes of a message. Empty once the socket is closed, or if
    /// the message belongs to another socket.
    pub fn payload<'a>(&'a self, msg: &'a Message) -> &'a [u8] {
        let Some(active) = self.inner.as_ref().filter(|a| a.owns(msg)) else {
            return &[];
        };
        // The message is the only handle to its frame.
        let frame = unsafe { active.umem.frame(msg.frame()) };
        &frame[msg.payload.range()]
    }

    /// Mutable payload bytes of a message. Empty once the socket is closed,
    /// or if the message belongs to another socket.
    pub fn payload_mut<'a>(&'a self, msg: &'a mut Message) -> &'a mut [u8] {
        let Some(active) = self.inner.as_ref().filter(|a| a.owns(msg)) else {
            return &mut [];
        };
        // Exclusive through `&mut Message`.
        let frame = unsafe { active.umem.frame_mut(msg.frame()) };
        &mut frame[msg.payload.range()]
    }

    /// Copy `data` into the payload and set the length. Returns false if it
    /// does not fit, the socket is closed or the message is not its own.
    pub fn write_payload(&self, msg: &mut Message, data: &[u8]) -> bool {
        let owned = self.inner.as_ref().is_some_and(|a| a.owns(msg));
        if !owned || !msg.set_payload_len(data.len()) {
            return false;
        }
        self.payload_mut(msg).copy_from_slice(data);
        true
    }

    /// Frame accounting and ring state.
    pub fn info(&self) -> Result<XdpInfo> {
        let active = self.active()?;
        let rings = active.rings.info();
        let tx_free = active.umem.free_list().len();
        Ok(XdpInfo {
            lost_rx: active
                .umem
                .rx_frame_count()
                .saturating_sub(rings.fill.busy + rings.rx.busy),
            lost_tx: active
                .umem
                .tx_frame_count()
                .saturating_sub(rings.comp.busy + rings.tx.busy + tx_free),
            tx_free,
            rings,
        })
    }

    /// Counters, including the kernel's drop statistics for a real socket.
    pub fn stats(&self) -> Result<XdpStats> {
        let active = self.active()?;
        let mut stats = active.stats;
        if let Link::Kernel(k) = &active.link {
            let kernel: ffi::xdp_statistics = k.xsk.statistics()?;
            stats.kernel_rx_dropped = kernel.rx_dropped;
            stats.kernel_rx_invalid_descs = kernel.rx_invalid_descs;
            stats.kernel_tx_invalid_descs = kernel.tx_invalid_descs;
        }
        Ok(stats)
    }
}

impl Drop for XdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for XdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(active) => f
                .debug_struct("XdpSocket")
                .field("umem", &active.umem)
                .field("pending_wakeup", &active.kernel_needs_wakeup)
                .finish(),
            None => f.write_str("XdpSocket(closed)"),
        }
    }
}

impl Active {
    /// Turn an RX descriptor into a message. The frame is owned by userspace
    /// from here on.
    fn rx_message(&self, desc: &XdpDesc) -> Result<Message> {
        let frame_size = self.umem.frame_size();
        let frame = FrameIdx::from_addr(desc.addr, frame_size);
        let start = (desc.addr % frame_size as u64) as usize;
        let end = start + desc.len as usize;
        if !self.umem.contains(frame) || self.umem.is_tx_frame(frame) || end > frame_size as usize {
            return Err(Error::Malformed);
        }
        let bytes = unsafe { self.umem.frame(frame) };
        let d = packet::decode(&bytes[start..end])?;
        Ok(Message {
            flags: d.flags,
            eth_from: d.eth_from,
            eth_to: d.eth_to,
            ip_from: d.ip_from,
            ip_to: d.ip_to,
            seqno: d.seqno,
            ackno: d.ackno,
            payload: PayloadRef {
                owner: self.umem.id(),
                frame,
                offset: (start + d.payload_offset) as u16,
                len: d.payload_len as u16,
                cap: d.payload_len as u16,
            },
        })
    }

    /// Put a message's frame back where it came from. Returns true if a Fill
    /// ring entry was written (and needs submitting).
    fn return_frame(&mut self, msg: &Message) -> bool {
        if !self.owns(msg) {
            return false;
        }
        let frame = msg.frame();
        let addr = frame.addr(self.umem.frame_size());
        if self.umem.is_tx_frame(frame) {
            self.umem.free_tx(addr);
            return false;
        }
        if !self.rings.fill.push(addr) {
            tracing::warn!("fill ring full, frame {} lost", frame.0);
            return false;
        }
        true
    }

    fn owns(&self, msg: &Message) -> bool {
        if msg.payload.owner != self.umem.id() {
            tracing::warn!("ignoring message of another socket");
            return false;
        }
        true
    }
}

impl LoopbackShared {
    fn wakeup(&self) -> Result<()> {
        match self.fail_errno.load(Ordering::Relaxed) {
            0 => {
                self.wakeups.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            errno => Err(classify_wakeup_error(Errno::from_raw(errno))),
        }
    }
}

fn should_send(msg: &Message) -> bool {
    if msg.flags.contains(MsgFlags::TCP)
        && msg
            .flags
            .intersects(MsgFlags::SYN | MsgFlags::ACK | MsgFlags::FIN)
    {
        return true;
    }
    msg.payload_len() > 0
}

/// The kernel side of a loopback socket.
///
/// Takes frames from the Fill ring to deliver packets into, and completes
/// whatever the socket queues for transmission.
pub struct LoopbackPeer {
    rings: PeerRings,
    tx_ring: Arc<RingMem>,
    area: Arc<MmapRegion>,
    frame_size: u32,
    shared: Arc<LoopbackShared>,
}

impl LoopbackPeer {
    /// Deliver one received frame. Returns false if the socket has no free
    /// RX frame in the Fill ring or `pkt` does not fit a frame.
    pub fn inject(&mut self, pkt: &[u8]) -> bool {
        if XDP_PACKET_HEADROOM + pkt.len() > self.frame_size as usize {
            return false;
        }
        let (n, idx) = self.rings.fill.peek(1);
        if n == 0 {
            return false;
        }
        let base = self.rings.fill.read(idx);
        self.rings.fill.release(n);

        let addr = base + XDP_PACKET_HEADROOM as u64;
        // The frame came off the Fill ring, so it is ours to write.
        unsafe {
            std::ptr::copy_nonoverlapping(
                pkt.as_ptr(),
                self.area.as_ptr().add(addr as usize),
                pkt.len(),
            );
        }
        let pushed = self.rings.rx.push(XdpDesc {
            addr,
            len: pkt.len() as u32,
            options: 0,
        });
        debug_assert!(pushed, "RX ring is larger than the RX frame count");
        self.rings.rx.submit(1);
        true
    }

    /// Transmit up to `max` queued frames: pass each to `f` and complete it.
    /// Returns the number transmitted.
    pub fn transmit<F>(&mut self, max: u32, mut f: F) -> u32
    where
        F: FnMut(&[u8]),
    {
        let (n, idx) = self.rings.tx.peek(max);
        for i in 0..n {
            let desc = self.rings.tx.read(idx.wrapping_add(i));
            let end = desc.addr as usize + desc.len as usize;
            if end <= self.area.len() {
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        self.area.as_ptr().add(desc.addr as usize),
                        desc.len as usize,
                    )
                };
                f(bytes);
            } else {
                tracing::warn!("TX descriptor {:#x}+{} outside the arena", desc.addr, desc.len);
            }
            let pushed = self.rings.comp.push(desc.addr);
            debug_assert!(pushed, "completion ring is larger than the TX frame count");
        }
        self.rings.tx.release(n);
        self.rings.comp.submit(n);
        n
    }

    /// Frames the socket has handed over for receiving into.
    pub fn fill_available(&mut self) -> u32 {
        self.rings.fill.refresh()
    }

    /// Frames queued for transmission and not yet transmitted.
    pub fn tx_pending(&mut self) -> u32 {
        self.rings.tx.refresh()
    }

    /// Successful wakeups so far.
    pub fn wakeups(&self) -> u64 {
        self.shared.wakeups.load(Ordering::Relaxed)
    }

    /// Make wakeups fail with `errno` until reset with `None`.
    pub fn fail_wakeups(&self, errno: Option<Errno>) {
        let raw = errno.map_or(0, |e| e as i32);
        self.shared.fail_errno.store(raw, Ordering::Relaxed);
    }

    /// Set or clear the TX ring's need-wakeup flag.
    pub fn set_need_wakeup(&self, on: bool) {
        if on {
            self.tx_ring.set_flags(ffi::XDP_RING_NEED_WAKEUP);
        } else {
            self.tx_ring.clear_flags(ffi::XDP_RING_NEED_WAKEUP);
        }
    }
}

impl fmt::Debug for LoopbackPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackPeer")
            .field("frame_size", &self.frame_size)
            .field("wakeups", &self.wakeups())
            .finish()
    }
}
