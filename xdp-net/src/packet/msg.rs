use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ops::{BitAnd, BitOr, BitOrAssign};

use smoltcp::wire::EthernetAddress;

use super::hdr;
use crate::api::xsk::umem::FrameIdx;

/// Per-message flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MsgFlags(u8);

impl MsgFlags {
    pub const EMPTY: MsgFlags = MsgFlags(0);
    /// IPv6 instead of IPv4.
    pub const IPV6: MsgFlags = MsgFlags(1 << 0);
    /// TCP instead of UDP.
    pub const TCP: MsgFlags = MsgFlags(1 << 1);
    pub const SYN: MsgFlags = MsgFlags(1 << 2);
    pub const ACK: MsgFlags = MsgFlags(1 << 3);
    pub const FIN: MsgFlags = MsgFlags(1 << 4);

    const NAMES: [(MsgFlags, &'static str); 5] = [
        (Self::IPV6, "IPV6"),
        (Self::TCP, "TCP"),
        (Self::SYN, "SYN"),
        (Self::ACK, "ACK"),
        (Self::FIN, "FIN"),
    ];

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: MsgFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn insert(&mut self, other: MsgFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn set(&mut self, other: MsgFlags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for MsgFlags {
    type Output = MsgFlags;
    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MsgFlags {
    fn bitor_assign(&mut self, rhs: MsgFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MsgFlags {
    type Output = MsgFlags;
    fn bitand(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for MsgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("MsgFlags(EMPTY)");
        }
        f.write_str("MsgFlags(")?;
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str(")")
    }
}

/// Network and transport protocol pair of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Ipv4Udp,
    Ipv4Tcp,
    Ipv6Udp,
    Ipv6Tcp,
}

impl Proto {
    pub fn from_flags(flags: MsgFlags) -> Self {
        match (flags.contains(MsgFlags::IPV6), flags.contains(MsgFlags::TCP)) {
            (false, false) => Proto::Ipv4Udp,
            (false, true) => Proto::Ipv4Tcp,
            (true, false) => Proto::Ipv6Udp,
            (true, true) => Proto::Ipv6Tcp,
        }
    }

    #[inline]
    pub fn is_ipv6(self) -> bool {
        matches!(self, Proto::Ipv6Udp | Proto::Ipv6Tcp)
    }

    #[inline]
    pub fn is_tcp(self) -> bool {
        matches!(self, Proto::Ipv4Tcp | Proto::Ipv6Tcp)
    }

    fn ip_header_len(self) -> usize {
        if self.is_ipv6() {
            hdr::IPV6_HDR_LEN
        } else {
            hdr::IPV4_HDR_LEN
        }
    }

    fn l4_header_len(self) -> usize {
        if self.is_tcp() {
            hdr::TCP_HDR_LEN
        } else {
            hdr::UDP_HDR_LEN
        }
    }

    /// Bytes of headers in front of the payload of an outgoing frame.
    pub fn payload_offset(self) -> usize {
        hdr::ETH_HDR_LEN + self.ip_header_len() + self.l4_header_len()
    }
}

/// Offset of the payload from the frame start, for headers written by this
/// crate (no IP or TCP options).
pub fn payload_offset(flags: MsgFlags) -> usize {
    Proto::from_flags(flags).payload_offset()
}

/// Where a message's payload lives inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PayloadRef {
    /// Arena the frame belongs to
    pub owner: u32,
    pub frame: FrameIdx,
    /// From the start of the frame
    pub offset: u16,
    pub len: u16,
    /// Largest `len` that still fits the frame
    pub cap: u16,
}

impl PayloadRef {
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.len as usize
    }
}

/// One packet, received or about to be sent.
///
/// The header fields are plain values; the payload stays in the frame arena
/// and is reached through [`XdpSocket::payload`](crate::XdpSocket::payload).
/// A message is the only handle to its frame, hence not `Clone`.
#[derive(Debug)]
pub struct Message {
    pub flags: MsgFlags,
    pub eth_from: EthernetAddress,
    pub eth_to: EthernetAddress,
    pub ip_from: SocketAddr,
    pub ip_to: SocketAddr,
    /// TCP sequence number
    pub seqno: u32,
    /// TCP acknowledgement number
    pub ackno: u32,
    pub(crate) payload: PayloadRef,
}

impl Message {
    pub(crate) fn new(flags: MsgFlags, payload: PayloadRef) -> Self {
        let any = if flags.contains(MsgFlags::IPV6) {
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
        } else {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        };
        Message {
            flags,
            eth_from: EthernetAddress([0; 6]),
            eth_to: EthernetAddress([0; 6]),
            ip_from: any,
            ip_to: any,
            seqno: 0,
            ackno: 0,
            payload,
        }
    }

    #[inline]
    pub fn proto(&self) -> Proto {
        Proto::from_flags(self.flags)
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len as usize
    }

    /// Largest payload this message's frame can carry.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.payload.cap as usize
    }

    /// Shrink or grow the payload within its capacity. Returns false, leaving
    /// the length unchanged, if `len` does not fit.
    pub fn set_payload_len(&mut self, len: usize) -> bool {
        if len > self.payload.cap as usize {
            return false;
        }
        self.payload.len = len as u16;
        true
    }

    /// Frame holding this message.
    #[inline]
    pub fn frame(&self) -> FrameIdx {
        self.payload.frame
    }

    /// Offset of the payload from the start of the frame.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.payload.offset as usize
    }

    /// Whether the socket addresses agree with the IPV6 flag.
    pub(crate) fn family_matches(&self) -> bool {
        let v6 = self.flags.contains(MsgFlags::IPV6);
        self.ip_from.is_ipv6() == v6 && self.ip_to.is_ipv6() == v6
    }
}
