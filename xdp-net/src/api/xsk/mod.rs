// AF_XDP socket building blocks
// See: /usr/include/linux/if_xdp.h and Documentation/networking/af_xdp.rst

pub mod iface;
pub mod mmap;
pub mod queue;
pub mod ring;
pub mod sock;
pub mod umem;
