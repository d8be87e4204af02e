// TCP segments through a loopback socket: decode, reply numbering, and
// checksums verified by smoltcp.

use xdp_net::{ArrayVec, LoopbackPeer, Message, MsgFlags, XdpSocket};
use xdp_net_test::frames::{self, Flow, Parsed, TcpCtl};
use xdp_net_test::util::{init_tracing, test_config};

fn receive_one(sock: &mut XdpSocket) -> Message {
    let mut rx: ArrayVec<Message, 4> = ArrayVec::new();
    assert_eq!(sock.receive(&mut rx).unwrap(), 1);
    rx.pop().unwrap()
}

fn transmit_one(sock: &mut XdpSocket, peer: &mut LoopbackPeer) -> Parsed {
    sock.send_finish().unwrap();
    let mut wire = Vec::new();
    assert_eq!(peer.transmit(16, |f| wire = f.to_vec()), 1);
    sock.send_prepare().unwrap();
    frames::parse(&wire)
}

#[test]
fn test_receive_tcp_fields() {
    init_tracing();
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let flow = Flow::v4();
    let ctl = TcpCtl {
        ack: true,
        psh: true,
        ..Default::default()
    };
    assert!(peer.inject(&frames::tcp_frame(&flow, 1000, 2000, ctl, b"data")));

    let msg = receive_one(&mut sock);
    assert_eq!(msg.flags, MsgFlags::TCP | MsgFlags::ACK);
    assert_eq!(msg.seqno, 1000);
    assert_eq!(msg.ackno, 2000);
    assert_eq!(msg.ip_from, flow.src);
    assert_eq!(msg.ip_to, flow.dst);
    assert_eq!(sock.payload(&msg), b"data");
    sock.receive_finish([msg]).unwrap();
}

#[test]
fn test_syn_reply_acknowledges_syn() {
    init_tracing();
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    for flow in [Flow::v4(), Flow::v6()] {
        let syn = frames::tcp_frame(&flow, 0x1000, 0, TcpCtl::SYN, b"");
        assert!(peer.inject(&syn));
        let msg = receive_one(&mut sock);
        assert!(msg.flags.contains(MsgFlags::TCP | MsgFlags::SYN));
        assert_eq!(msg.flags.contains(MsgFlags::IPV6), flow.is_ipv6());

        let flags = (msg.flags & MsgFlags::IPV6) | MsgFlags::TCP | MsgFlags::SYN | MsgFlags::ACK;
        let mut out = sock.send_alloc(flags, Some(&msg)).unwrap();
        assert_eq!(out.ackno, 0x1001);
        assert!(out.set_payload_len(0));
        assert_eq!(sock.send([out]).unwrap(), 1);
        sock.receive_finish([msg]).unwrap();

        let parsed = transmit_one(&mut sock, &mut peer);
        assert_eq!(parsed.flow, flow.reversed());
        let tcp = parsed.tcp.unwrap();
        assert_eq!(tcp.ack, 0x1001);
        assert!(tcp.ctl.syn && tcp.ctl.ack && !tcp.ctl.fin && !tcp.ctl.psh);
        assert_eq!(tcp.header_len, 20);
        assert!(parsed.payload.is_empty());
        assert!(parsed.ip_checksum_ok);
        assert!(parsed.l4_checksum_ok);
        assert_eq!(parsed.ttl, 64);
    }
}

#[test]
fn test_syn_with_data_acknowledges_both() {
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let flow = Flow::v4();
    assert!(peer.inject(&frames::tcp_frame(&flow, 500, 0, TcpCtl::SYN, b"early")));
    let msg = receive_one(&mut sock);
    let out = sock
        .send_alloc(MsgFlags::TCP | MsgFlags::SYN | MsgFlags::ACK, Some(&msg))
        .unwrap();
    assert_eq!(out.ackno, 500 + 5 + 1);
    sock.receive_finish([msg]).unwrap();
    sock.send([out]).unwrap();
}

#[test]
fn test_sequence_numbers_wrap() {
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let flow = Flow::v6();
    assert!(peer.inject(&frames::tcp_frame(
        &flow,
        u32::MAX - 1,
        77,
        TcpCtl::ACK,
        b"four"
    )));
    let msg = receive_one(&mut sock);
    let out = sock
        .send_alloc(MsgFlags::IPV6 | MsgFlags::TCP | MsgFlags::ACK, Some(&msg))
        .unwrap();
    assert_eq!(out.ackno, 2);
    assert_eq!(out.seqno, 77);
    sock.receive_finish([msg]).unwrap();
    sock.send([out]).unwrap();
}

#[test]
fn test_data_reply_numbers_and_checksums() {
    init_tracing();
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    for flow in [Flow::v4(), Flow::v6()] {
        let request = b"odd-length query!";
        assert!(peer.inject(&frames::tcp_frame(&flow, 9000, 4242, TcpCtl::ACK, request)));
        let msg = receive_one(&mut sock);

        let flags = (msg.flags & MsgFlags::IPV6) | MsgFlags::TCP | MsgFlags::ACK;
        let mut out = sock.send_alloc(flags, Some(&msg)).unwrap();
        assert!(sock.write_payload(&mut out, b"the answer"));
        assert_eq!(sock.send([out]).unwrap(), 1);
        sock.receive_finish([msg]).unwrap();

        let parsed = transmit_one(&mut sock, &mut peer);
        assert_eq!(parsed.flow, flow.reversed());
        assert_eq!(parsed.payload, b"the answer");
        let tcp = parsed.tcp.unwrap();
        assert_eq!(tcp.seq, 4242);
        assert_eq!(tcp.ack, 9000 + request.len() as u32);
        assert!(tcp.ctl.ack && tcp.ctl.psh && !tcp.ctl.syn);
        let offset = if flow.is_ipv6() { 74 } else { 54 };
        assert_eq!(tcp.window, (2048 - offset) as u16);
        assert!(parsed.ip_checksum_ok);
        assert!(parsed.l4_checksum_ok, "{:?}", flow);
    }
}

#[test]
fn test_peer_without_ack_gets_some_sequence_number() {
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let flow = Flow::v4();
    assert!(peer.inject(&frames::tcp_frame(&flow, 1, 0, TcpCtl::SYN, b"")));
    let msg = receive_one(&mut sock);
    assert_eq!(msg.ackno, 0);
    let out = sock
        .send_alloc(MsgFlags::TCP | MsgFlags::SYN | MsgFlags::ACK, Some(&msg))
        .unwrap();
    // Random, so only the acknowledgement is fixed.
    assert_eq!(out.ackno, 2);
    sock.receive_finish([msg]).unwrap();
    sock.send([out]).unwrap();
}

#[test]
fn test_empty_tcp_without_control_bits_is_skipped() {
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let mut bare = sock.send_alloc(MsgFlags::TCP, None).unwrap();
    bare.ip_to = "192.168.1.10:40000".parse().unwrap();
    assert!(bare.set_payload_len(0));
    let mut ack = sock.send_alloc(MsgFlags::TCP | MsgFlags::ACK, None).unwrap();
    ack.ip_to = "192.168.1.10:40000".parse().unwrap();
    assert!(ack.set_payload_len(0));
    assert_eq!(ack.ackno, 0);

    assert_eq!(sock.send([bare, ack]).unwrap(), 1);
    assert_eq!(peer.tx_pending(), 1);
    let parsed = transmit_one(&mut sock, &mut peer);
    let tcp = parsed.tcp.unwrap();
    assert!(tcp.ctl.ack && !tcp.ctl.psh);
    assert!(parsed.payload.is_empty());
    assert!(parsed.l4_checksum_ok);
    assert_eq!(sock.info().unwrap().tx_free, 64);
}

#[test]
fn test_truncated_tcp_is_malformed() {
    init_tracing();
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let mut frame = frames::tcp_frame(&Flow::v4(), 1, 1, TcpCtl::ACK, b"");
    frame.truncate(14 + 20 + 12);
    assert!(peer.inject(&frame));
    let mut rx: ArrayVec<Message, 4> = ArrayVec::new();
    assert_eq!(sock.receive(&mut rx).unwrap(), 0);
    assert_eq!(sock.stats().unwrap().rx_malformed, 1);
    assert_eq!(peer.fill_available(), 64);
}
