use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use xdp_net::{LoopbackPeer, Message, MsgFlags, XdpConfig, XdpSocket};
use xdp_net_test::echo_server::{
    EchoServer, EchoServerConfig, EchoServerStats, WaitMode, reply_flags,
};
use xdp_net_test::frames::{self, Flow, Parsed, TcpCtl};
use xdp_net_test::util::{init_tracing, test_config};

fn transmit_all(peer: &mut LoopbackPeer) -> Vec<Parsed> {
    let mut out = Vec::new();
    peer.transmit(u32::MAX, |f| out.push(frames::parse(f)));
    out
}

#[test]
fn test_echo_udp_both_families() {
    init_tracing();
    let (sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let mut server = EchoServer::new(sock);

    assert!(peer.inject(&frames::udp_frame(&Flow::v4(), b"one")));
    assert!(peer.inject(&frames::udp_frame(&Flow::v6(), b"two!")));
    assert_eq!(server.poll_once().unwrap(), 2);
    assert_eq!(peer.wakeups(), 1);

    let out = transmit_all(&mut peer);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].flow, Flow::v4().reversed());
    assert_eq!(out[0].payload, b"one");
    assert_eq!(out[1].flow, Flow::v6().reversed());
    assert_eq!(out[1].payload, b"two!");
    assert!(out[1].l4_checksum_ok && out[1].l4_checksum != 0);

    // Received frames went back to the Fill ring, sent ones come back on
    // the next round.
    assert_eq!(peer.fill_available(), 64);
    assert_eq!(server.poll_once().unwrap(), 0);
    let info = server.socket().info().unwrap();
    assert_eq!(info.tx_free, 64);
    assert_eq!(
        server.stats(),
        EchoServerStats {
            received: 2,
            replied: 2,
            no_frame: 0,
            busy: 0
        }
    );
}

#[test]
fn test_echo_tcp_handshake_data_and_close() {
    init_tracing();
    let (sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let mut server = EchoServer::new(sock);
    let flow = Flow::v4();

    assert!(peer.inject(&frames::tcp_frame(&flow, 100, 0, TcpCtl::SYN, b"")));
    server.poll_once().unwrap();
    let syn_ack = transmit_all(&mut peer).remove(0);
    let tcp = syn_ack.tcp.unwrap();
    assert!(tcp.ctl.syn && tcp.ctl.ack);
    assert_eq!(tcp.ack, 101);
    let server_isn = tcp.seq;

    let ctl = TcpCtl {
        ack: true,
        psh: true,
        ..Default::default()
    };
    let data = frames::tcp_frame(&flow, 101, server_isn.wrapping_add(1), ctl, b"query");
    assert!(peer.inject(&data));
    server.poll_once().unwrap();
    let echo = transmit_all(&mut peer).remove(0);
    let tcp = echo.tcp.unwrap();
    assert_eq!(echo.payload, b"query");
    assert_eq!(tcp.ack, 106);
    assert_eq!(tcp.seq, server_isn.wrapping_add(1));
    assert!(tcp.ctl.psh && tcp.ctl.ack);
    assert!(echo.l4_checksum_ok);

    let fin = TcpCtl {
        fin: true,
        ack: true,
        ..Default::default()
    };
    assert!(peer.inject(&frames::tcp_frame(&flow, 106, 7, fin, b"")));
    server.poll_once().unwrap();
    let fin_ack = transmit_all(&mut peer).remove(0);
    let tcp = fin_ack.tcp.unwrap();
    assert!(tcp.ctl.fin && tcp.ctl.ack);
    assert_eq!(tcp.seq, 7);
    assert!(fin_ack.payload.is_empty());

    // A bare ACK gets no answer.
    assert!(peer.inject(&frames::tcp_frame(&flow, 107, 8, TcpCtl::ACK, b"")));
    assert_eq!(server.poll_once().unwrap(), 1);
    assert!(transmit_all(&mut peer).is_empty());
}

#[test]
fn test_reply_flags() {
    let (mut sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let cases: [(Vec<u8>, Option<MsgFlags>); 4] = [
        (frames::udp_frame(&Flow::v6(), b"x"), Some(MsgFlags::IPV6)),
        (frames::udp_frame(&Flow::v4(), b""), None),
        (
            frames::tcp_frame(&Flow::v6(), 1, 0, TcpCtl::SYN, b""),
            Some(MsgFlags::IPV6 | MsgFlags::TCP | MsgFlags::SYN | MsgFlags::ACK),
        ),
        (
            frames::tcp_frame(&Flow::v4(), 1, 1, TcpCtl::ACK, b"d"),
            Some(MsgFlags::TCP | MsgFlags::ACK),
        ),
    ];
    for (frame, expected) in cases {
        assert!(peer.inject(&frame));
        let mut rx: xdp_net::ArrayVec<Message, 1> = xdp_net::ArrayVec::new();
        assert_eq!(sock.receive(&mut rx).unwrap(), 1);
        assert_eq!(reply_flags(&rx[0]), expected);
        sock.receive_finish(rx.drain(..)).unwrap();
    }
}

#[test]
fn test_out_of_tx_frames_is_counted() {
    init_tracing();
    let config = XdpConfig::new().frame_counts(30, 2);
    let (sock, mut peer) = XdpSocket::loopback(config).unwrap();
    let mut server = EchoServer::new(sock);
    for i in 0..5u8 {
        assert!(peer.inject(&frames::udp_frame(&Flow::v4(), &[i])));
    }
    assert_eq!(server.poll_once().unwrap(), 5);
    let stats = server.stats();
    assert_eq!(stats.replied, 2);
    assert_eq!(stats.no_frame, 3);
    let out = transmit_all(&mut peer);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].payload, vec![0u8]);
    assert_eq!(out[1].payload, vec![1u8]);
}

#[test]
fn test_busy_wakeup_is_counted() {
    let (sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let mut server = EchoServer::new(sock);
    peer.fail_wakeups(Some(nix::errno::Errno::EAGAIN));
    assert!(peer.inject(&frames::udp_frame(&Flow::v4(), b"a")));
    server.poll_once().unwrap();
    assert_eq!(server.stats().busy, 1);
    assert_eq!(peer.wakeups(), 0);

    peer.fail_wakeups(None);
    server.poll_once().unwrap();
    assert_eq!(peer.wakeups(), 1);
    assert_eq!(transmit_all(&mut peer).len(), 1);
}

#[test]
fn test_failed_round_does_not_reply_twice() {
    init_tracing();
    let (sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let mut server = EchoServer::new(sock);
    peer.fail_wakeups(Some(nix::errno::Errno::ENXIO));
    assert!(peer.inject(&frames::udp_frame(&Flow::v4(), b"once")));
    assert!(server.poll_once().is_err());
    assert_eq!(peer.fill_available(), 64);

    peer.fail_wakeups(None);
    assert_eq!(server.poll_once().unwrap(), 0);
    let out = transmit_all(&mut peer);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].payload, b"once");
    assert_eq!(server.stats().replied, 1);
}

fn serve_in_thread(asynchronous: bool) {
    init_tracing();
    let (sock, mut peer) = XdpSocket::loopback(test_config()).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let server_stop = stop.clone();
    let handle = thread::spawn(move || {
        let mut server = EchoServer::new(sock);
        let config = EchoServerConfig {
            status_interval: Duration::from_millis(50),
            wait: WaitMode::Poll(Duration::from_millis(1)),
        };
        let result = if asynchronous {
            server.run_async(&config, &server_stop)
        } else {
            server.run(&config, &server_stop)
        };
        result.unwrap();
        server.stats()
    });

    let mut echoed = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    for i in 0..20u8 {
        while !peer.inject(&frames::udp_frame(&Flow::v4(), &[i, i])) {
            assert!(Instant::now() < deadline, "socket never returned RX frames");
            thread::yield_now();
        }
    }
    while echoed.len() < 20 && Instant::now() < deadline {
        peer.transmit(u32::MAX, |f| echoed.push(frames::parse(f).payload));
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Release);
    let stats = handle.join().unwrap();

    assert_eq!(echoed.len(), 20);
    for (i, payload) in echoed.iter().enumerate() {
        assert_eq!(payload, &vec![i as u8, i as u8]);
    }
    assert_eq!(stats.received, 20);
    assert_eq!(stats.replied, 20);
}

#[test]
fn test_run_on_thread() {
    serve_in_thread(false);
}

#[test]
fn test_run_async_on_thread() {
    serve_in_thread(true);
}
