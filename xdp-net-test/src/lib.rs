pub mod echo_server;
pub mod frames;

pub mod util {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tracing_subscriber::EnvFilter;

    /// Small socket used by the loopback tests: 64 RX and 64 TX frames.
    pub fn test_config() -> xdp_net::XdpConfig {
        xdp_net::XdpConfig::new().frame_counts(64, 64)
    }

    /// Install a test-friendly subscriber. Respects RUST_LOG, defaults to
    /// `warn`; repeated calls are no-ops.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// A flag that turns true on Ctrl+C or SIGTERM.
    pub fn stop_on_ctrl_c() -> Arc<AtomicBool> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            stop_clone.store(true, Ordering::Release);
        }) {
            tracing::warn!("cannot install Ctrl+C handler: {}", e);
        }
        stop
    }
}
