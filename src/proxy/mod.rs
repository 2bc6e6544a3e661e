//! Relay sessions and the client-side front ends that feed them.
//!
//! The relay loop is shared by both roles: on the relay node the plaintext
//! side is the target connection, on the client it is the local application.

pub mod forward;
pub mod relay;
pub mod socks5;

pub use forward::run_port_forward;
pub use relay::{NoOpMetrics, RelayEnd, RelayMetrics, RelayOptions, RelayStats, Session};
pub use socks5::{handle_socks5_client, run_socks5_proxy};
