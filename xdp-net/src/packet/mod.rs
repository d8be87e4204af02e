//! Packet codec.
//!
//! Received frames are parsed into [`Message`] header fields plus a payload
//! range; outgoing messages get Ethernet, IPv4/IPv6 and UDP/TCP headers
//! written in front of the payload already placed in the frame. No VLAN
//! tags, IP options, fragments or TCP options are produced.

pub mod decode;
pub mod encode;
pub mod hdr;
mod msg;

pub use decode::{Decoded, decode};
pub use encode::encode;
pub(crate) use msg::PayloadRef;
pub use msg::{Message, MsgFlags, Proto, payload_offset};
