// Header sizes and fixed field values of the frames this crate writes.

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const UDP_HDR_LEN: usize = 8;
/// No options.
pub const TCP_HDR_LEN: usize = 20;

/// TTL / hop limit of outgoing packets.
pub const DEFAULT_TTL: u8 = 64;

/// Headroom the kernel may put in front of a received packet.
pub const XDP_PACKET_HEADROOM: usize = 256;
