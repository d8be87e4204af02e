// Parse received frames into header fields and a payload range.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, Ipv6Packet,
    TcpPacket, UdpPacket,
};

use super::hdr;
use super::msg::MsgFlags;
use crate::api::{Error, Result};

/// Header fields of one received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub flags: MsgFlags,
    pub eth_from: EthernetAddress,
    pub eth_to: EthernetAddress,
    pub ip_from: SocketAddr,
    pub ip_to: SocketAddr,
    pub seqno: u32,
    pub ackno: u32,
    /// From the start of the packet
    pub payload_offset: usize,
    pub payload_len: usize,
}

enum Net {
    V4(std::net::Ipv4Addr, std::net::Ipv4Addr),
    V6(std::net::Ipv6Addr, std::net::Ipv6Addr),
}

/// Parse an Ethernet frame carrying UDP or TCP over IPv4 or IPv6.
///
/// The kernel filter only lets such frames through, so anything else is
/// `Error::Malformed`. Checksums are not verified.
pub fn decode(pkt: &[u8]) -> Result<Decoded> {
    let eth = EthernetFrame::new_checked(pkt).map_err(|_| Error::Malformed)?;
    let mut flags = MsgFlags::EMPTY;

    let (net, proto, l4, ip_hdr_len) = match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(eth.payload()).map_err(|_| Error::Malformed)?;
            if ip.version() != 4 || ip.more_frags() || ip.frag_offset() != 0 {
                return Err(Error::Malformed);
            }
            let hdr_len = ip.header_len() as usize;
            if hdr_len < hdr::IPV4_HDR_LEN {
                return Err(Error::Malformed);
            }
            (
                Net::V4(ip.src_addr(), ip.dst_addr()),
                ip.next_header(),
                &eth.payload()[hdr_len..ip.total_len() as usize],
                hdr_len,
            )
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(eth.payload()).map_err(|_| Error::Malformed)?;
            if ip.version() != 6 {
                return Err(Error::Malformed);
            }
            flags |= MsgFlags::IPV6;
            let end = hdr::IPV6_HDR_LEN + ip.payload_len() as usize;
            (
                Net::V6(ip.src_addr(), ip.dst_addr()),
                ip.next_header(),
                &eth.payload()[hdr::IPV6_HDR_LEN..end],
                hdr::IPV6_HDR_LEN,
            )
        }
        _ => return Err(Error::Malformed),
    };

    let (sport, dport, l4_hdr_len, seqno, ackno) = match proto {
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(l4).map_err(|_| Error::Malformed)?;
            if udp.len() as usize != l4.len() {
                return Err(Error::Malformed);
            }
            (udp.src_port(), udp.dst_port(), hdr::UDP_HDR_LEN, 0, 0)
        }
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(l4).map_err(|_| Error::Malformed)?;
            flags |= MsgFlags::TCP;
            flags.set(MsgFlags::SYN, tcp.syn());
            flags.set(MsgFlags::ACK, tcp.ack());
            flags.set(MsgFlags::FIN, tcp.fin());
            (
                tcp.src_port(),
                tcp.dst_port(),
                tcp.header_len() as usize,
                tcp.seq_number().0 as u32,
                tcp.ack_number().0 as u32,
            )
        }
        _ => return Err(Error::Malformed),
    };

    let (ip_from, ip_to) = match net {
        Net::V4(src, dst) => (
            SocketAddr::V4(SocketAddrV4::new(src, sport)),
            SocketAddr::V4(SocketAddrV4::new(dst, dport)),
        ),
        // Flow label and scope are not carried.
        Net::V6(src, dst) => (
            SocketAddr::V6(SocketAddrV6::new(src, sport, 0, 0)),
            SocketAddr::V6(SocketAddrV6::new(dst, dport, 0, 0)),
        ),
    };

    Ok(Decoded {
        flags,
        eth_from: eth.src_addr(),
        eth_to: eth.dst_addr(),
        ip_from,
        ip_to,
        seqno,
        ackno,
        payload_offset: hdr::ETH_HDR_LEN + ip_hdr_len + l4_hdr_len,
        payload_len: l4.len() - l4_hdr_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal IPv4/UDP frame: 10.0.0.1:5353 -> 10.0.0.2:53, payload "abc".
    fn udp4_frame() -> Vec<u8> {
        let mut f = vec![
            // eth: dst, src, type
            0x02, 0, 0, 0, 0, 0x02, 0x02, 0, 0, 0, 0, 0x01, 0x08, 0x00,
            // ipv4
            0x45, 0, 0, 31, 0, 0, 0x40, 0, 64, 17, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2,
            // udp
            0x14, 0xe9, 0, 53, 0, 11, 0, 0,
        ];
        f.extend_from_slice(b"abc");
        f
    }

    #[test]
    fn test_decode_udp4() {
        let d = decode(&udp4_frame()).unwrap();
        assert_eq!(d.flags, MsgFlags::EMPTY);
        assert_eq!(d.eth_from, EthernetAddress([2, 0, 0, 0, 0, 1]));
        assert_eq!(d.eth_to, EthernetAddress([2, 0, 0, 0, 0, 2]));
        assert_eq!(d.ip_from, "10.0.0.1:5353".parse().unwrap());
        assert_eq!(d.ip_to, "10.0.0.2:53".parse().unwrap());
        assert_eq!(d.payload_offset, 42);
        assert_eq!(d.payload_len, 3);
    }

    #[test]
    fn test_trailing_ethernet_padding_ignored() {
        let mut f = udp4_frame();
        f.resize(60, 0);
        let d = decode(&f).unwrap();
        assert_eq!(d.payload_len, 3);
    }

    #[test]
    fn test_unknown_ethertype() {
        let mut f = udp4_frame();
        f[12] = 0x08;
        f[13] = 0x06; // ARP
        assert!(matches!(decode(&f), Err(Error::Malformed)));
    }

    #[test]
    fn test_unknown_protocol() {
        let mut f = udp4_frame();
        f[23] = 1; // ICMP
        assert!(matches!(decode(&f), Err(Error::Malformed)));
    }

    #[test]
    fn test_fragment_rejected() {
        let mut f = udp4_frame();
        f[20] = 0x20; // MF
        assert!(matches!(decode(&f), Err(Error::Malformed)));
    }

    #[test]
    fn test_truncated() {
        let f = udp4_frame();
        assert!(matches!(decode(&f[..40]), Err(Error::Malformed)));
        assert!(matches!(decode(&f[..10]), Err(Error::Malformed)));
    }

    #[test]
    fn test_udp_length_mismatch() {
        let mut f = udp4_frame();
        f[39] = 10;
        assert!(matches!(decode(&f), Err(Error::Malformed)));
    }
}
