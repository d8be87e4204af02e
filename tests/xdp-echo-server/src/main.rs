//! XDP Echo Server
//!
//! Echoes UDP datagrams (and answers TCP segments) received on one queue of
//! an interface through an AF_XDP socket.
//!
//! Traffic reaches the socket only when an XDP program redirects it there;
//! this binary attaches none, so load one separately (for example with
//! `xdp-loader`) or run against a queue that already has one.
//!
//! # Usage
//!
//! ```bash
//! # Copy mode on queue 0 of eth1, poll(2) between batches (requires sudo)
//! sudo -E xdp-echo-server --interface eth1 --bind-mode copy
//!
//! # Zero-copy, busy polling, need-wakeup
//! sudo -E xdp-echo-server -i eth1 --bind-mode zero-copy --wait busy --need-wakeup
//!
//! # Tokio readiness instead of poll(2)
//! sudo -E xdp-echo-server -i eth1 --wait async
//! ```

use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use xdp_net::{BindMode, NoFilter, XdpConfig, XdpSocket};
use xdp_net_test::echo_server::{EchoServer, EchoServerConfig, WaitMode};
use xdp_net_test::util::stop_on_ctrl_c;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BindModeArg {
    /// Zero-copy if the driver supports it
    Auto,
    /// Copy mode, works with any driver
    Copy,
    /// Zero-copy or fail
    ZeroCopy,
}

impl From<BindModeArg> for BindMode {
    fn from(arg: BindModeArg) -> Self {
        match arg {
            BindModeArg::Auto => BindMode::Auto,
            BindModeArg::Copy => BindMode::Copy,
            BindModeArg::ZeroCopy => BindMode::ZeroCopy,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WaitArg {
    /// Spin between batches
    Busy,
    /// poll(2) on the socket
    Poll,
    /// Tokio current-thread runtime, socket readiness
    Async,
}

#[derive(Parser, Debug)]
#[command(name = "xdp-echo-server")]
#[command(about = "UDP/TCP echo server on an AF_XDP socket")]
struct Args {
    /// Network interface
    #[arg(short, long, default_value = "eth1")]
    interface: String,

    /// Device queue to bind to
    #[arg(short, long, default_value = "0")]
    queue: u32,

    /// Port the XDP program redirects
    #[arg(short, long, default_value = "53")]
    port: u16,

    /// Frame size in bytes (2048 or 4096)
    #[arg(long, default_value = "2048")]
    frame_size: u32,

    /// Frames for receiving
    #[arg(long, default_value = "4096")]
    rx_frames: u32,

    /// Frames for sending
    #[arg(long, default_value = "4096")]
    tx_frames: u32,

    #[arg(long, value_enum, default_value = "auto")]
    bind_mode: BindModeArg,

    /// Only kick the kernel when it asks for it
    #[arg(long)]
    need_wakeup: bool,

    /// How to wait when no packets are pending
    #[arg(short, long, value_enum, default_value = "poll")]
    wait: WaitArg,

    /// Poll timeout in milliseconds
    #[arg(long, default_value = "100")]
    poll_ms: u64,

    /// Seconds between status lines
    #[arg(long, default_value = "10")]
    status_secs: u64,
}

fn main() {
    // Initialize tracing - respects RUST_LOG, defaults to info if not set
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let args = Args::parse();
    info!(
        interface = %args.interface,
        queue = args.queue,
        port = args.port,
        bind_mode = ?args.bind_mode,
        wait = ?args.wait,
        "Starting XDP echo server"
    );

    let config = XdpConfig::new()
        .frame_size(args.frame_size)
        .frame_counts(args.rx_frames, args.tx_frames)
        .bind_mode(args.bind_mode.into())
        .need_wakeup(args.need_wakeup);

    let sock = match XdpSocket::open(&args.interface, args.queue, args.port, NoFilter, config) {
        Ok(sock) => sock,
        Err(e) => {
            error!("cannot open XDP socket on {}: {}", args.interface, e);
            std::process::exit(1);
        }
    };

    let stop = stop_on_ctrl_c();
    let poll = Duration::from_millis(args.poll_ms);
    let server_config = EchoServerConfig {
        status_interval: Duration::from_secs(args.status_secs),
        wait: match args.wait {
            WaitArg::Busy => WaitMode::Busy,
            WaitArg::Poll | WaitArg::Async => WaitMode::Poll(poll),
        },
    };

    let mut server = EchoServer::new(sock);
    let result = match args.wait {
        WaitArg::Async => server.run_async(&server_config, &stop),
        _ => server.run(&server_config, &stop),
    };
    if let Err(e) = result {
        error!("echo server stopped: {}", e);
        std::process::exit(1);
    }

    let stats = server.stats();
    info!(
        received = stats.received,
        replied = stats.replied,
        no_frame = stats.no_frame,
        "Server shutdown complete"
    );
}
