// Fill in outgoing messages and write their headers into the frame.

use std::net::SocketAddr;

use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket,
    TcpSeqNumber, UdpPacket,
};

use super::hdr;
use super::msg::{Message, MsgFlags};
use crate::api::{Error, Result};

/// Initialise the addressing and TCP numbers of a freshly allocated message.
///
/// With `reply_to`, link and socket addresses are the swapped addresses of
/// the received message and a TCP reply acknowledges everything the peer
/// sent: its payload, plus one for a SYN.
pub(crate) fn prepare(msg: &mut Message, reply_to: Option<&Message>) {
    let tcp = msg.flags.contains(MsgFlags::TCP);
    match reply_to {
        Some(peer) => {
            msg.eth_from = peer.eth_to;
            msg.eth_to = peer.eth_from;
            msg.ip_from = peer.ip_to;
            msg.ip_to = peer.ip_from;
            if tcp {
                let mut ackno = peer.seqno.wrapping_add(peer.payload_len() as u32);
                if peer.flags.contains(MsgFlags::SYN) {
                    ackno = ackno.wrapping_add(1);
                }
                msg.ackno = ackno;
                msg.seqno = match peer.ackno {
                    0 => rand::random(),
                    n => n,
                };
            }
        }
        None => {
            if tcp {
                msg.ackno = 0;
                msg.seqno = rand::random();
            }
        }
    }
}

/// Write Ethernet, IP and UDP/TCP headers in front of the payload already
/// sitting in `frame`, and fill in the checksums. Returns the frame length.
///
/// `frame` is the whole frame; its length is the advertised TCP window
/// bound. Fails with `Error::Malformed` if the payload is not where the
/// flags put it or the addresses do not match the IP version.
pub fn encode(frame: &mut [u8], msg: &Message) -> Result<usize> {
    let proto = msg.proto();
    let off = proto.payload_offset();
    let total = off + msg.payload_len();
    if msg.payload_offset() != off || total > frame.len() || !msg.family_matches() {
        return Err(Error::Malformed);
    }
    let window = (frame.len() - off).min(u16::MAX as usize) as u16;
    let ip_end = if proto.is_ipv6() {
        hdr::ETH_HDR_LEN + hdr::IPV6_HDR_LEN
    } else {
        hdr::ETH_HDR_LEN + hdr::IPV4_HDR_LEN
    };
    let l4_len = total - ip_end;
    let next_header = if proto.is_tcp() {
        IpProtocol::Tcp
    } else {
        IpProtocol::Udp
    };

    let mut eth = EthernetFrame::new_unchecked(&mut frame[..total]);
    eth.set_src_addr(msg.eth_from);
    eth.set_dst_addr(msg.eth_to);

    let (src, dst) = match (msg.ip_from, msg.ip_to) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            eth.set_ethertype(EthernetProtocol::Ipv4);
            let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
            ip.set_version(4);
            ip.set_header_len(hdr::IPV4_HDR_LEN as u8);
            ip.set_dscp(0);
            ip.set_ecn(0);
            ip.set_total_len((hdr::IPV4_HDR_LEN + l4_len) as u16);
            ip.set_ident(0);
            ip.clear_flags();
            ip.set_frag_offset(0);
            ip.set_hop_limit(hdr::DEFAULT_TTL);
            ip.set_next_header(next_header);
            ip.set_src_addr(*src.ip());
            ip.set_dst_addr(*dst.ip());
            ip.fill_checksum();
            (IpAddress::Ipv4(*src.ip()), IpAddress::Ipv4(*dst.ip()))
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            eth.set_ethertype(EthernetProtocol::Ipv6);
            let mut ip = Ipv6Packet::new_unchecked(eth.payload_mut());
            ip.set_version(6);
            ip.set_traffic_class(0);
            ip.set_flow_label(0);
            ip.set_payload_len(l4_len as u16);
            ip.set_next_header(next_header);
            ip.set_hop_limit(hdr::DEFAULT_TTL);
            ip.set_src_addr(*src.ip());
            ip.set_dst_addr(*dst.ip());
            (IpAddress::Ipv6(*src.ip()), IpAddress::Ipv6(*dst.ip()))
        }
        _ => return Err(Error::Malformed),
    };

    let segment = &mut frame[ip_end..total];
    let (sport, dport) = (msg.ip_from.port(), msg.ip_to.port());
    if proto.is_tcp() {
        let mut tcp = TcpPacket::new_unchecked(segment);
        tcp.set_src_port(sport);
        tcp.set_dst_port(dport);
        tcp.set_seq_number(TcpSeqNumber(msg.seqno as i32));
        tcp.set_ack_number(TcpSeqNumber(msg.ackno as i32));
        tcp.clear_flags();
        tcp.set_header_len(hdr::TCP_HDR_LEN as u8);
        tcp.set_syn(msg.flags.contains(MsgFlags::SYN));
        tcp.set_ack(msg.flags.contains(MsgFlags::ACK));
        tcp.set_fin(msg.flags.contains(MsgFlags::FIN));
        tcp.set_psh(msg.payload_len() > 0);
        tcp.set_window_len(window);
        tcp.set_urgent_at(0);
        tcp.fill_checksum(&src, &dst);
    } else {
        let mut udp = UdpPacket::new_unchecked(segment);
        udp.set_src_port(sport);
        udp.set_dst_port(dport);
        udp.set_len(l4_len as u16);
        // Optional over IPv4 and left out there. A computed zero goes out as
        // all ones.
        if proto.is_ipv6() {
            udp.fill_checksum(&src, &dst);
        } else {
            udp.set_checksum(0);
        }
    }

    Ok(total)
}
