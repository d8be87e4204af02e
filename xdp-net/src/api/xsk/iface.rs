// Interface resolution and the kernel filter seam.

use std::os::fd::BorrowedFd;

use crate::api::{BoxError, Error, Result};

/// A resolved network interface queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub queue: u32,
}

impl Interface {
    /// Look up `name` and pair it with a device queue.
    pub fn resolve(name: &str, queue: u32) -> Result<Self> {
        let index = nix::net::if_::if_nametoindex(name).map_err(|e| {
            tracing::warn!("interface {} not found: {}", name, e);
            Error::Interface(e)
        })?;
        Ok(Interface {
            name: name.to_string(),
            index,
            queue,
        })
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (index {}) queue {}", self.name, self.index, self.queue)
    }
}

/// Attaches and detaches the kernel program that steers matching packets of
/// an interface queue into an AF_XDP socket.
///
/// Loading the program and filling its socket map is left to the
/// implementation; the socket only tells it when to start and stop.
pub trait XdpFilter: Send {
    /// Redirect traffic for `listen_port` on `iface` to the socket `xsk`.
    fn start(
        &mut self,
        iface: &Interface,
        listen_port: u16,
        xsk: BorrowedFd<'_>,
    ) -> std::result::Result<(), BoxError>;

    /// Stop redirecting. Called once, before the socket is closed.
    fn stop(&mut self, iface: &Interface);
}

/// For deployments where the program is attached by an outside tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFilter;

impl XdpFilter for NoFilter {
    fn start(
        &mut self,
        iface: &Interface,
        listen_port: u16,
        _xsk: BorrowedFd<'_>,
    ) -> std::result::Result<(), BoxError> {
        tracing::debug!(
            "no filter attached for {} port {}, expecting an external loader",
            iface,
            listen_port
        );
        Ok(())
    }

    fn stop(&mut self, _iface: &Interface) {}
}

impl<F: XdpFilter + ?Sized> XdpFilter for Box<F> {
    fn start(
        &mut self,
        iface: &Interface,
        listen_port: u16,
        xsk: BorrowedFd<'_>,
    ) -> std::result::Result<(), BoxError> {
        (**self).start(iface, listen_port, xsk)
    }

    fn stop(&mut self, iface: &Interface) {
        (**self).stop(iface)
    }
}
