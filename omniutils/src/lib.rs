//! Small network utilities shared by the OmniCast crates.
//!
//! The main entry points are [`guess_local_ip`], which picks the local
//! address used for outbound traffic, and [`local_ipv4_addrs`], which
//! lists the non-loopback IPv4 addresses of the machine (used to join
//! multicast groups on every interface).

mod ip_utils;

pub use ip_utils::{guess_local_ip, local_ipv4_addrs};
