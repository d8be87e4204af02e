//! Socket configuration.
//!
//! Frame size, frame counts and ring lengths are fixed for the lifetime of a
//! socket. They are checked once by [`XdpConfig::validate`]; the datapath then
//! relies on the checked relations (most importantly: every ring is strictly
//! larger than the number of frames that can ever sit in it, so a ring is
//! never observably full).

use xdp_net_sys::ffi;

use crate::api::{Error, Result};

/// Default frame size. Drivers accept 2048 or 4096.
pub const DEFAULT_FRAME_SIZE: u32 = 2048;

/// Default number of frames designated for RX, and for TX.
pub const DEFAULT_FRAME_COUNT: u32 = 4096;

/// Upper bound on TX frames, and so on the length of the TX free list.
pub const MAX_TX_FRAME_COUNT: u32 = 1 << 16;

/// How the socket binds to the device queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindMode {
    /// Let the kernel pick zero-copy if the driver supports it.
    #[default]
    Auto,
    /// Force copy mode (works with any driver, including generic XDP).
    Copy,
    /// Force zero-copy mode; bind fails if the driver cannot do it.
    ZeroCopy,
}

impl BindMode {
    /// `sockaddr_xdp.sxdp_flags` for this mode.
    pub fn bind_flags(self) -> u16 {
        match self {
            BindMode::Auto => 0,
            BindMode::Copy => ffi::XDP_COPY,
            BindMode::ZeroCopy => ffi::XDP_ZEROCOPY,
        }
    }
}

/// Configuration for an `XdpSocket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdpConfig {
    /// Size of one frame in bytes (2048 or 4096)
    pub frame_size: u32,
    /// Frames donated to the kernel for receiving
    pub rx_frame_count: u32,
    /// Frames reserved for transmitting
    pub tx_frame_count: u32,
    /// Length of the Fill and RX rings
    pub rx_ring_len: u32,
    /// Length of the TX and Completion rings
    pub tx_ring_len: u32,
    /// Copy / zero-copy selection
    pub bind_mode: BindMode,
    /// Bind with `XDP_USE_NEED_WAKEUP` and only kick the kernel when its TX
    /// ring asks for it (kernel 5.4+).
    pub need_wakeup: bool,
}

impl Default for XdpConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            rx_frame_count: DEFAULT_FRAME_COUNT,
            tx_frame_count: DEFAULT_FRAME_COUNT,
            rx_ring_len: DEFAULT_FRAME_COUNT * 2,
            tx_ring_len: DEFAULT_FRAME_COUNT * 2,
            bind_mode: BindMode::Auto,
            need_wakeup: false,
        }
    }
}

impl XdpConfig {
    /// Create a new XdpConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame size (2048 or 4096).
    pub fn frame_size(mut self, size: u32) -> Self {
        self.frame_size = size;
        self
    }

    /// Set the RX and TX frame counts. Ring lengths follow as the smallest
    /// power of two larger than the respective count; override them
    /// afterwards if needed.
    pub fn frame_counts(mut self, rx: u32, tx: u32) -> Self {
        self.rx_frame_count = rx;
        self.tx_frame_count = tx;
        self.rx_ring_len = ring_len_for(rx);
        self.tx_ring_len = ring_len_for(tx);
        self
    }

    /// Set the Fill/RX ring length.
    pub fn rx_ring_len(mut self, len: u32) -> Self {
        self.rx_ring_len = len;
        self
    }

    /// Set the TX/Completion ring length.
    pub fn tx_ring_len(mut self, len: u32) -> Self {
        self.tx_ring_len = len;
        self
    }

    /// Set the bind mode.
    pub fn bind_mode(mut self, mode: BindMode) -> Self {
        self.bind_mode = mode;
        self
    }

    /// Enable or disable need-wakeup mode.
    pub fn need_wakeup(mut self, enable: bool) -> Self {
        self.need_wakeup = enable;
        self
    }

    /// `sockaddr_xdp.sxdp_flags` for this configuration.
    pub fn bind_flags(&self) -> u16 {
        let mut flags = self.bind_mode.bind_flags();
        if self.need_wakeup {
            flags |= ffi::XDP_USE_NEED_WAKEUP;
        }
        flags
    }

    /// Total number of frames in the arena.
    pub fn frame_count(&self) -> u32 {
        self.rx_frame_count + self.tx_frame_count
    }

    /// Size of the frame arena in bytes.
    pub fn arena_len(&self) -> usize {
        self.frame_size as usize * self.frame_count() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_size != 2048 && self.frame_size != 4096 {
            return Err(Error::InvalidConfig("frame size must be 2048 or 4096"));
        }
        if self.rx_frame_count == 0 || self.tx_frame_count == 0 {
            return Err(Error::InvalidConfig("frame counts must be non-zero"));
        }
        if self.tx_frame_count > MAX_TX_FRAME_COUNT {
            return Err(Error::InvalidConfig("at most 65536 TX frames"));
        }
        let total = self
            .rx_frame_count
            .checked_add(self.tx_frame_count)
            .ok_or(Error::InvalidConfig("frame count overflow"))?;
        if !total.is_power_of_two() {
            return Err(Error::InvalidConfig("total frame count must be a power of two"));
        }
        if (total as u64) * (self.frame_size as u64) > u32::MAX as u64 {
            return Err(Error::InvalidConfig("frame arena larger than 4 GiB"));
        }
        if !self.rx_ring_len.is_power_of_two() || self.rx_ring_len <= self.rx_frame_count {
            return Err(Error::InvalidConfig(
                "RX ring length must be a power of two larger than the RX frame count",
            ));
        }
        if !self.tx_ring_len.is_power_of_two() || self.tx_ring_len <= self.tx_frame_count {
            return Err(Error::InvalidConfig(
                "TX ring length must be a power of two larger than the TX frame count",
            ));
        }
        Ok(())
    }
}

/// Zero if no such length fits a u32; `validate` rejects that.
fn ring_len_for(frames: u32) -> u32 {
    frames
        .checked_add(1)
        .and_then(u32::checked_next_power_of_two)
        .unwrap_or(0)
}
