//! Raw AF_XDP kernel interface.
//!
//! Mirrors `<linux/if_xdp.h>`. Only what the `xdp-net` datapath uses is
//! declared here; everything is plain `#[repr(C)]` data and constants.

pub mod ffi;
