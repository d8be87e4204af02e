//! UDP/TCP echo server loop
//!
//! Echoes every UDP datagram back to its sender. TCP gets just enough
//! handling to exercise the reply path: SYN is answered with SYN-ACK, data
//! is acknowledged and echoed in the same segment, FIN is acknowledged with
//! FIN-ACK. There is no retransmission or connection state.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use tracing::{debug, info, warn};
use xdp_net::{Error, Message, MsgFlags, XdpSocket};

/// Messages handled per receive call.
pub const BATCH_SIZE: usize = 32;

/// How the loop waits for traffic when a batch came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Spin, yielding the thread between rounds
    Busy,
    /// poll(2) on the socket descriptor with the given timeout
    Poll(Duration),
}

/// Configuration for the echo server
#[derive(Debug, Clone)]
pub struct EchoServerConfig {
    /// How often to log a status line
    pub status_interval: Duration,
    pub wait: WaitMode,
}

impl Default for EchoServerConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(10),
            wait: WaitMode::Poll(Duration::from_millis(100)),
        }
    }
}

/// Statistics from the echo server run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EchoServerStats {
    pub received: u64,
    /// Replies queued for transmission
    pub replied: u64,
    /// Replies not sent because no TX frame was free
    pub no_frame: u64,
    /// Wakeups deferred because the kernel was busy
    pub busy: u64,
}

/// Flags of the reply to `msg`, if it gets one.
pub fn reply_flags(msg: &Message) -> Option<MsgFlags> {
    let ipv6 = msg.flags & MsgFlags::IPV6;
    if !msg.flags.contains(MsgFlags::TCP) {
        return (msg.payload_len() > 0).then_some(ipv6);
    }
    let tcp = ipv6 | MsgFlags::TCP;
    if msg.flags.contains(MsgFlags::SYN) && !msg.flags.contains(MsgFlags::ACK) {
        return Some(tcp | MsgFlags::SYN | MsgFlags::ACK);
    }
    if msg.flags.contains(MsgFlags::FIN) {
        return Some(tcp | MsgFlags::FIN | MsgFlags::ACK);
    }
    (msg.payload_len() > 0).then_some(tcp | MsgFlags::ACK)
}

pub struct EchoServer {
    sock: XdpSocket,
    rx: ArrayVec<Message, BATCH_SIZE>,
    tx: ArrayVec<Message, BATCH_SIZE>,
    stats: EchoServerStats,
}

impl EchoServer {
    pub fn new(sock: XdpSocket) -> Self {
        Self {
            sock,
            rx: ArrayVec::new(),
            tx: ArrayVec::new(),
            stats: EchoServerStats::default(),
        }
    }

    pub fn socket(&self) -> &XdpSocket {
        &self.sock
    }

    pub fn stats(&self) -> EchoServerStats {
        self.stats
    }

    /// One receive / reply / send round. Returns the number of messages
    /// received.
    ///
    /// Every frame taken in the round is handed back before it returns, on
    /// error too.
    pub fn poll_once(&mut self) -> xdp_net::Result<usize> {
        self.sock.send_prepare()?;
        let n = self.sock.receive(&mut self.rx)?;
        self.stats.received += n as u64;

        if let Err(e) = self.build_replies() {
            self.sock
                .receive_finish(self.tx.drain(..).chain(self.rx.drain(..)))?;
            return Err(e);
        }
        let sent = self.sock.send(self.tx.drain(..));
        self.sock.receive_finish(self.rx.drain(..))?;
        self.stats.replied += sent? as u64;

        match self.sock.send_finish() {
            Ok(()) => {}
            Err(Error::Busy) => self.stats.busy += 1,
            Err(e) => return Err(e),
        }
        Ok(n)
    }

    fn build_replies(&mut self) -> xdp_net::Result<()> {
        for msg in self.rx.iter() {
            let Some(flags) = reply_flags(msg) else {
                continue;
            };
            let mut out = match self.sock.send_alloc(flags, Some(msg)) {
                Ok(out) => out,
                Err(Error::NoFrame) => {
                    self.stats.no_frame += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let echoed = if flags.intersects(MsgFlags::SYN | MsgFlags::FIN) {
                &[][..]
            } else {
                self.sock.payload(msg)
            };
            if !self.sock.write_payload(&mut out, echoed) {
                warn!("payload of {} bytes does not fit a reply", echoed.len());
                out.set_payload_len(0);
            }
            self.tx.push(out);
        }
        Ok(())
    }

    fn wait(&self, mode: WaitMode) -> xdp_net::Result<()> {
        match (mode, self.sock.fd()?) {
            (WaitMode::Poll(timeout), Some(fd)) => {
                use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
                let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
                let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(ms)) {
                    Ok(_) | Err(nix::errno::Errno::EINTR) => Ok(()),
                    Err(e) => Err(Error::Io(e)),
                }
            }
            _ => {
                std::thread::yield_now();
                Ok(())
            }
        }
    }

    /// Serve until `stop` is set.
    pub fn run(&mut self, config: &EchoServerConfig, stop: &AtomicBool) -> xdp_net::Result<()> {
        let mut last_status = Instant::now();
        while !stop.load(Ordering::Acquire) {
            if self.poll_once()? == 0 {
                self.wait(config.wait)?;
            }
            if last_status.elapsed() >= config.status_interval {
                self.log_status();
                last_status = Instant::now();
            }
        }
        self.log_status();
        Ok(())
    }

    /// Serve on a tokio current-thread runtime, waking on socket readiness.
    /// Loopback sockets have no descriptor and fall back to a timer.
    pub fn run_async(&mut self, config: &EchoServerConfig, stop: &AtomicBool) -> xdp_net::Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(io_error)?;
        let raw_fd = self.sock.fd()?.map(|fd| fd.as_raw_fd());
        let tick = match config.wait {
            WaitMode::Poll(t) => t,
            WaitMode::Busy => Duration::from_millis(1),
        };
        rt.block_on(async {
            use tokio::io::Interest;
            use tokio::io::unix::AsyncFd;

            let afd = match raw_fd {
                Some(fd) => Some(AsyncFd::with_interest(fd, Interest::READABLE).map_err(io_error)?),
                None => None,
            };
            let mut last_status = Instant::now();
            while !stop.load(Ordering::Acquire) {
                if self.poll_once()? == 0 {
                    match &afd {
                        Some(afd) => {
                            if let Ok(Ok(mut guard)) =
                                tokio::time::timeout(tick, afd.readable()).await
                            {
                                guard.clear_ready();
                            }
                        }
                        None => tokio::time::sleep(tick).await,
                    }
                }
                if last_status.elapsed() >= config.status_interval {
                    self.log_status();
                    last_status = Instant::now();
                }
            }
            self.log_status();
            Ok(())
        })
    }

    fn log_status(&self) {
        info!(
            received = self.stats.received,
            replied = self.stats.replied,
            no_frame = self.stats.no_frame,
            busy = self.stats.busy,
            "echo server status"
        );
        if let Ok(info) = self.sock.info() {
            debug!("socket state:\n{}", info);
        }
    }
}

fn io_error(e: std::io::Error) -> Error {
    let errno = e.raw_os_error().unwrap_or(nix::errno::Errno::EIO as i32);
    Error::Io(nix::errno::Errno::from_raw(errno))
}
