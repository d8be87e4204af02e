//! Reference frames built and checked with `smoltcp::wire`.
//!
//! Tests inject these into a loopback socket and parse what it transmits.
//! [`internet_sum`] is a plain RFC 1071 sum for checking checksum fields
//! without going through `smoltcp`.

use std::net::SocketAddr;

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet,
    Ipv6Packet, TcpPacket, TcpSeqNumber, UdpPacket,
};

pub const CLIENT_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const SERVER_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

/// Link and socket addresses of one direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub eth_src: EthernetAddress,
    pub eth_dst: EthernetAddress,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl Flow {
    /// Client to server, IPv4.
    pub fn v4() -> Self {
        Flow {
            eth_src: CLIENT_MAC,
            eth_dst: SERVER_MAC,
            src: "192.168.1.10:40000".parse().unwrap(),
            dst: "192.168.1.1:53".parse().unwrap(),
        }
    }

    /// Client to server, IPv6.
    pub fn v6() -> Self {
        Flow {
            eth_src: CLIENT_MAC,
            eth_dst: SERVER_MAC,
            src: "[fd00::10]:40000".parse().unwrap(),
            dst: "[fd00::1]:53".parse().unwrap(),
        }
    }

    pub fn reversed(&self) -> Self {
        Flow {
            eth_src: self.eth_dst,
            eth_dst: self.eth_src,
            src: self.dst,
            dst: self.src,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.src.is_ipv6()
    }
}

/// TCP control bits of a reference segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpCtl {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub psh: bool,
}

impl TcpCtl {
    pub const SYN: TcpCtl = TcpCtl {
        syn: true,
        ack: false,
        fin: false,
        psh: false,
    };
    pub const ACK: TcpCtl = TcpCtl {
        syn: false,
        ack: true,
        fin: false,
        psh: false,
    };
}

fn ip_addr(addr: &SocketAddr) -> IpAddress {
    IpAddress::from(addr.ip())
}

/// Write Ethernet and IP headers for an L4 segment of `l4_len` bytes.
/// Returns the frame and the offset of the segment.
fn ip_frame(flow: &Flow, proto: IpProtocol, l4_len: usize) -> (Vec<u8>, usize) {
    let ip_len = if flow.is_ipv6() { 40 } else { 20 };
    let l4_off = 14 + ip_len;
    let mut buf = vec![0u8; l4_off + l4_len];

    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth.set_src_addr(flow.eth_src);
    eth.set_dst_addr(flow.eth_dst);
    match (flow.src, flow.dst) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            eth.set_ethertype(EthernetProtocol::Ipv4);
            let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
            ip.set_version(4);
            ip.set_header_len(20);
            ip.set_total_len((20 + l4_len) as u16);
            ip.set_ident(0x1234);
            ip.clear_flags();
            ip.set_dont_frag(true);
            ip.set_hop_limit(64);
            ip.set_next_header(proto);
            ip.set_src_addr(*src.ip());
            ip.set_dst_addr(*dst.ip());
            ip.fill_checksum();
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            eth.set_ethertype(EthernetProtocol::Ipv6);
            let mut ip = Ipv6Packet::new_unchecked(eth.payload_mut());
            ip.set_version(6);
            ip.set_traffic_class(0);
            ip.set_flow_label(0x12345);
            ip.set_payload_len(l4_len as u16);
            ip.set_next_header(proto);
            ip.set_hop_limit(64);
            ip.set_src_addr(*src.ip());
            ip.set_dst_addr(*dst.ip());
        }
        _ => panic!("mixed address families"),
    }
    (buf, l4_off)
}

/// A UDP datagram with a valid checksum.
pub fn udp_frame(flow: &Flow, payload: &[u8]) -> Vec<u8> {
    let (mut buf, off) = ip_frame(flow, IpProtocol::Udp, 8 + payload.len());
    let mut udp = UdpPacket::new_unchecked(&mut buf[off..]);
    udp.set_src_port(flow.src.port());
    udp.set_dst_port(flow.dst.port());
    udp.set_len((8 + payload.len()) as u16);
    udp.payload_mut().copy_from_slice(payload);
    udp.fill_checksum(&ip_addr(&flow.src), &ip_addr(&flow.dst));
    buf
}

/// A TCP segment without options and with a valid checksum.
pub fn tcp_frame(flow: &Flow, seq: u32, ack: u32, ctl: TcpCtl, payload: &[u8]) -> Vec<u8> {
    let (mut buf, off) = ip_frame(flow, IpProtocol::Tcp, 20 + payload.len());
    let mut tcp = TcpPacket::new_unchecked(&mut buf[off..]);
    tcp.set_src_port(flow.src.port());
    tcp.set_dst_port(flow.dst.port());
    tcp.set_seq_number(TcpSeqNumber(seq as i32));
    tcp.set_ack_number(TcpSeqNumber(ack as i32));
    tcp.clear_flags();
    tcp.set_header_len(20);
    tcp.set_syn(ctl.syn);
    tcp.set_ack(ctl.ack);
    tcp.set_fin(ctl.fin);
    tcp.set_psh(ctl.psh);
    tcp.set_window_len(65535);
    tcp.payload_mut().copy_from_slice(payload);
    tcp.fill_checksum(&ip_addr(&flow.src), &ip_addr(&flow.dst));
    buf
}

/// RFC 1071 ones'-complement sum of the concatenated `parts`, folded to 16
/// bits and not complemented. A region whose checksum field is correct sums
/// to 0xFFFF.
pub fn internet_sum(parts: &[&[u8]]) -> u16 {
    let mut sum = 0u64;
    let mut bytes = parts.iter().flat_map(|p| p.iter().copied());
    while let Some(hi) = bytes.next() {
        let lo = bytes.next().unwrap_or(0);
        sum += u16::from_be_bytes([hi, lo]) as u64;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// A transmitted frame, parsed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub flow: Flow,
    pub tcp: Option<TcpInfo>,
    pub payload: Vec<u8>,
    /// IPv4 header checksum verified (true for IPv6)
    pub ip_checksum_ok: bool,
    /// Transport checksum field as sent
    pub l4_checksum: u16,
    /// Transport checksum verified against the pseudo-header
    pub l4_checksum_ok: bool,
    pub ttl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub seq: u32,
    pub ack: u32,
    pub ctl: TcpCtl,
    pub window: u16,
    pub header_len: u8,
}

/// Parse an Ethernet/IP/UDP-or-TCP frame, panicking on anything else.
pub fn parse(frame: &[u8]) -> Parsed {
    let eth = EthernetFrame::new_checked(frame).expect("ethernet");
    let (src_ip, dst_ip, proto, l4, ip_checksum_ok, ttl) = match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(eth.payload()).expect("ipv4");
            (
                IpAddress::Ipv4(ip.src_addr()),
                IpAddress::Ipv4(ip.dst_addr()),
                ip.next_header(),
                ip.payload().to_vec(),
                ip.verify_checksum(),
                ip.hop_limit(),
            )
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(eth.payload()).expect("ipv6");
            (
                IpAddress::Ipv6(ip.src_addr()),
                IpAddress::Ipv6(ip.dst_addr()),
                ip.next_header(),
                ip.payload().to_vec(),
                true,
                ip.hop_limit(),
            )
        }
        other => panic!("unexpected ethertype {other}"),
    };

    let sock = |ip: IpAddress, port: u16| -> SocketAddr {
        match ip {
            IpAddress::Ipv4(a) => SocketAddr::new(a.into(), port),
            IpAddress::Ipv6(a) => SocketAddr::new(a.into(), port),
        }
    };

    match proto {
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(&l4[..]).expect("udp");
            Parsed {
                flow: Flow {
                    eth_src: eth.src_addr(),
                    eth_dst: eth.dst_addr(),
                    src: sock(src_ip, udp.src_port()),
                    dst: sock(dst_ip, udp.dst_port()),
                },
                tcp: None,
                payload: udp.payload().to_vec(),
                ip_checksum_ok,
                l4_checksum: udp.checksum(),
                l4_checksum_ok: udp.verify_checksum(&src_ip, &dst_ip),
                ttl,
            }
        }
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(&l4[..]).expect("tcp");
            Parsed {
                flow: Flow {
                    eth_src: eth.src_addr(),
                    eth_dst: eth.dst_addr(),
                    src: sock(src_ip, tcp.src_port()),
                    dst: sock(dst_ip, tcp.dst_port()),
                },
                tcp: Some(TcpInfo {
                    seq: tcp.seq_number().0 as u32,
                    ack: tcp.ack_number().0 as u32,
                    ctl: TcpCtl {
                        syn: tcp.syn(),
                        ack: tcp.ack(),
                        fin: tcp.fin(),
                        psh: tcp.psh(),
                    },
                    window: tcp.window_len(),
                    header_len: tcp.header_len(),
                }),
                payload: tcp.payload().to_vec(),
                ip_checksum_ok,
                l4_checksum: tcp.checksum(),
                l4_checksum_ok: tcp.verify_checksum(&src_ip, &dst_ip),
                ttl,
            }
        }
        other => panic!("unexpected protocol {other}"),
    }
}
