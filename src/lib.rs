//! # shroud
//!
//! An encrypted TCP tunnel. A local application's byte stream is carried to
//! a relay node, which opens the real connection to the destination, so the
//! destination sees the relay's address and the path between client and
//! relay sees only authenticated ciphertext.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐  SOCKS5 / forward  ┌──────────────┐   tokens   ┌─────────────┐  TCP  ┌────────┐
//! │ application │ ─────────────────▶ │ TunnelClient │ ═════════▶ │ RelayServer │ ────▶ │ target │
//! └─────────────┘     plaintext      └──────────────┘            └─────────────┘       └────────┘
//! ```
//!
//! - [`crypto`]: key derivation, tokens (AES-128-CBC + HMAC-SHA256), [`crypto::CipherContext`]
//! - [`protocol`]: key frame, token delimiting, target declaration, handshake roles
//! - [`proxy`]: the relay loop shared by both roles, SOCKS5 and port-forward front ends
//! - [`client`]: opening tunnels, relay locations
//! - [`server`]: the relay node (feature `server`)
//!
//! Every tunneled connection gets its own transport connection and its own
//! handshake. There is no multiplexing, forward secrecy or endpoint
//! authentication.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod proxy;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, ErrorKind, Result};

/// Default relay node port.
pub const DEFAULT_RELAY_PORT: u16 = client::DEFAULT_RELAY_PORT;

/// Default local SOCKS5 port.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Default timeout for handshake operations (milliseconds)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
