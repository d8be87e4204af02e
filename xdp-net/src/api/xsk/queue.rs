// The four AF_XDP queues of one socket.
//
//   Fill:       userspace -> kernel, empty RX frame addresses
//   RX:         kernel -> userspace, received packet descriptors
//   TX:         userspace -> kernel, packet descriptors to transmit
//   Completion: kernel -> userspace, addresses of transmitted frames

use std::os::fd::BorrowedFd;
use std::sync::Arc;

use xdp_net_sys::ffi;

use super::ring::{ConsRing, ProdRing, RingInfo, RingMem};
use crate::api::Result;
use crate::config::XdpConfig;

/// Packet descriptor on the RX and TX rings.
pub type XdpDesc = ffi::xdp_desc;

pub type FillQueue = ProdRing<u64>;
pub type CompQueue = ConsRing<u64>;
pub type RxQueue = ConsRing<XdpDesc>;
pub type TxQueue = ProdRing<XdpDesc>;

/// Userspace ends of all rings of one socket.
pub struct XskRings {
    pub fill: FillQueue,
    pub comp: CompQueue,
    pub rx: RxQueue,
    pub tx: TxQueue,
}

/// The opposite ends, for driving a socket without a kernel.
pub struct PeerRings {
    pub fill: ConsRing<u64>,
    pub comp: ProdRing<u64>,
    pub rx: ProdRing<XdpDesc>,
    pub tx: ConsRing<XdpDesc>,
}

impl XskRings {
    /// Map the rings of a kernel socket whose sizes were already set via
    /// `setsockopt`.
    pub fn map_kernel(
        fd: BorrowedFd<'_>,
        off: &ffi::xdp_mmap_offsets,
        config: &XdpConfig,
    ) -> Result<Self> {
        let fill = RingMem::kernel::<u64>(fd, off.fr, ffi::XDP_UMEM_PGOFF_FILL_RING, config.rx_ring_len)?;
        let comp = RingMem::kernel::<u64>(
            fd,
            off.cr,
            ffi::XDP_UMEM_PGOFF_COMPLETION_RING,
            config.tx_ring_len,
        )?;
        let rx = RingMem::kernel::<XdpDesc>(fd, off.rx, ffi::XDP_PGOFF_RX_RING, config.rx_ring_len)?;
        let tx = RingMem::kernel::<XdpDesc>(fd, off.tx, ffi::XDP_PGOFF_TX_RING, config.tx_ring_len)?;
        Ok(Self {
            fill: ProdRing::new(fill),
            comp: ConsRing::new(comp),
            rx: ConsRing::new(rx),
            tx: ProdRing::new(tx),
        })
    }

    /// Rings in private memory, together with the ends the kernel would own.
    pub fn anonymous(config: &XdpConfig) -> Result<(Self, PeerRings)> {
        let fill: Arc<RingMem> = RingMem::anonymous::<u64>(config.rx_ring_len)?;
        let comp = RingMem::anonymous::<u64>(config.tx_ring_len)?;
        let rx = RingMem::anonymous::<XdpDesc>(config.rx_ring_len)?;
        let tx = RingMem::anonymous::<XdpDesc>(config.tx_ring_len)?;
        let peer = PeerRings {
            fill: ConsRing::new(fill.clone()),
            comp: ProdRing::new(comp.clone()),
            rx: ProdRing::new(rx.clone()),
            tx: ConsRing::new(tx.clone()),
        };
        let ours = Self {
            fill: ProdRing::new(fill),
            comp: ConsRing::new(comp),
            rx: ConsRing::new(rx),
            tx: ProdRing::new(tx),
        };
        Ok((ours, peer))
    }

    pub fn info(&self) -> RingsInfo {
        RingsInfo {
            fill: self.fill.info(),
            rx: self.rx.info(),
            tx: self.tx.info(),
            comp: self.comp.info(),
        }
    }
}

/// Diagnostic snapshot of all four rings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingsInfo {
    pub fill: RingInfo,
    pub rx: RingInfo,
    pub tx: RingInfo,
    pub comp: RingInfo,
}
