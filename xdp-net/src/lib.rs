//! Zero-copy UDP/TCP packet I/O over Linux AF_XDP sockets.
//!
//! [`XdpSocket`] owns a frame arena shared with the kernel and the four
//! AF_XDP rings. Packets are received and sent in batches of [`Message`]s,
//! whose payloads stay in the arena; the crate writes and parses the
//! Ethernet, IP and UDP/TCP headers around them.

pub mod api;
pub mod config;
pub mod packet;
pub mod socket;

pub use api::xsk::iface::{Interface, NoFilter, XdpFilter};
pub use api::{BoxError, Error, Result};
pub use arrayvec::ArrayVec;
pub use config::{BindMode, XdpConfig};
pub use packet::{Message, MsgFlags, Proto, payload_offset};
pub use socket::{LoopbackPeer, XdpInfo, XdpSocket, XdpStats};
