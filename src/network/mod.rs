//! Network Module Implementation
//!
//! This module provides the wire-level half of the protocol: frame encoding,
//! the transport (plain TCP or TLS), and the `Connection` that owns one link.
//!
//! # Components
//!
//! - `FrameCodec`: 4-byte little-endian length prefix followed by UTF-8 text
//! - `Message`: decoded payload, either application data or a control token
//! - `Transport`: the active I/O path, raw socket or secure session
//! - `ServerCredential` / `ClientTrust`: certificate material for the handshake
//! - `Connection`: framed send/receive, activity tracking and ordered teardown

pub use connection::{Connection, ConnectionState};
pub use frame::{decode_length, read_exact_or_reset, FrameCodec, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use message::{Message, DISCONNECT_TOKEN, ECHO_PREFIX, HEARTBEAT_TOKEN};
pub use tls::{ClientTrust, ServerCredential};
pub use transport::Transport;
mod connection;
mod frame;
mod message;
mod tls;
mod transport;
