// AF_XDP socket syscalls
//
// Setup order matters: the UMEM is registered and all four rings are sized
// before their offsets are queried and mapped, and bind comes last.

use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use xdp_net_sys::ffi;

use super::iface::Interface;
use super::queue::XskRings;
use super::umem::Umem;
use crate::api::error::check_success;
use crate::api::{Errno, Error, Result};
use crate::config::XdpConfig;

/// Errors from a TX kick that only mean "try again later".
const TRANSIENT_WAKEUP_ERRORS: [Errno; 4] =
    [Errno::ENOBUFS, Errno::EAGAIN, Errno::EBUSY, Errno::ENETDOWN];

/// An AF_XDP socket descriptor. Closing it detaches the socket from the
/// interface queue; the ring mappings stay valid until unmapped.
#[derive(Debug)]
pub struct XskFd {
    fd: OwnedFd,
}

impl XskFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::socket(ffi::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            let e = Errno::last();
            tracing::warn!("AF_XDP socket creation failed: {}", e);
            return Err(Error::Io(e));
        }
        Ok(XskFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn setsockopt<T>(&self, opt: libc::c_int, val: &T) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                ffi::SOL_XDP,
                opt,
                val as *const T as *const libc::c_void,
                size_of::<T>() as libc::socklen_t,
            )
        };
        check_success(ret)
    }

    /// Register the frame arena. Failure is reported as `OutOfMemory`, which is
    /// what the kernel's ENOMEM/ENOBUFS on locked-memory limits amounts to.
    pub fn register_umem(&self, umem: &Umem) -> Result<()> {
        let reg = ffi::xdp_umem_reg {
            addr: umem.area().as_ptr() as u64,
            len: umem.area().len() as u64,
            chunk_size: umem.frame_size(),
            headroom: 0,
            flags: 0,
            tx_metadata_len: 0,
        };
        self.setsockopt(ffi::XDP_UMEM_REG, &reg).map_err(|e| {
            tracing::warn!("UMEM registration failed: {}", e);
            Error::OutOfMemory
        })
    }

    /// Size all four rings.
    pub fn set_ring_sizes(&self, config: &XdpConfig) -> Result<()> {
        self.setsockopt(ffi::XDP_UMEM_FILL_RING, &config.rx_ring_len)?;
        self.setsockopt(ffi::XDP_UMEM_COMPLETION_RING, &config.tx_ring_len)?;
        self.setsockopt(ffi::XDP_RX_RING, &config.rx_ring_len)?;
        self.setsockopt(ffi::XDP_TX_RING, &config.tx_ring_len)?;
        Ok(())
    }

    /// Query ring offsets. Kernels before 5.4 report the shorter layout
    /// without a flags field.
    pub fn mmap_offsets(&self) -> Result<ffi::xdp_mmap_offsets> {
        let mut off = ffi::xdp_mmap_offsets::default();
        let mut len = size_of::<ffi::xdp_mmap_offsets>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                ffi::SOL_XDP,
                ffi::XDP_MMAP_OFFSETS,
                &mut off as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        check_success(ret)?;
        if len as usize == size_of::<ffi::xdp_mmap_offsets>() {
            return Ok(off);
        }
        if len as usize == size_of::<ffi::xdp_mmap_offsets_v1>() {
            // The kernel wrote the v1 layout into the front of `off`.
            let v1: ffi::xdp_mmap_offsets_v1 =
                unsafe { std::ptr::read(&off as *const _ as *const ffi::xdp_mmap_offsets_v1) };
            tracing::debug!("kernel reports v1 ring offsets");
            return Ok(v1.upgrade());
        }
        Err(Error::Io(Errno::EINVAL))
    }

    /// Size, query and map the rings.
    pub fn map_rings(&self, config: &XdpConfig) -> Result<XskRings> {
        self.set_ring_sizes(config)?;
        let off = self.mmap_offsets()?;
        XskRings::map_kernel(self.fd.as_fd(), &off, config)
    }

    pub fn bind(&self, iface: &Interface, flags: u16) -> Result<()> {
        let addr = ffi::sockaddr_xdp {
            sxdp_family: ffi::AF_XDP as u16,
            sxdp_flags: flags,
            sxdp_ifindex: iface.index,
            sxdp_queue_id: iface.queue,
            sxdp_shared_umem_fd: 0,
        };
        let ret = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                size_of::<ffi::sockaddr_xdp>() as libc::socklen_t,
            )
        };
        check_success(ret).inspect_err(|e| {
            tracing::warn!("bind to {} with flags {:#x} failed: {}", iface, flags, e);
        })
    }

    /// Kernel drop counters.
    pub fn statistics(&self) -> Result<ffi::xdp_statistics> {
        let mut stats = ffi::xdp_statistics::default();
        let mut len = size_of::<ffi::xdp_statistics>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                ffi::SOL_XDP,
                ffi::XDP_STATISTICS,
                &mut stats as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        check_success(ret)?;
        Ok(stats)
    }

    /// Kick the kernel to process the TX ring.
    pub fn wakeup(&self) -> Result<()> {
        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                std::ptr::null(),
                0,
            )
        };
        if ret >= 0 {
            return Ok(());
        }
        Err(classify_wakeup_error(Errno::last()))
    }
}

impl AsFd for XskFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Map a failed TX kick to `Busy` (retry) or `Io` (give up).
pub fn classify_wakeup_error(e: Errno) -> Error {
    if TRANSIENT_WAKEUP_ERRORS.contains(&e) {
        Error::Busy
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_error_classes() {
        for e in TRANSIENT_WAKEUP_ERRORS {
            assert!(matches!(classify_wakeup_error(e), Error::Busy));
        }
        assert!(matches!(
            classify_wakeup_error(Errno::ENXIO),
            Error::Io(Errno::ENXIO)
        ));
    }
}
