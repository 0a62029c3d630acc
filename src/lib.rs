// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # mqload - High-concurrency MQTT load-generation engine
//!
//! A pure Rust transport engine for driving very large numbers of simulated
//! MQTT publisher/subscriber connections against a broker. The engine owns
//! the per-connection state machine spanning TCP connect, TLS handshake,
//! WebSocket upgrade and the MQTT protocol handshake, plus the binary
//! MQTT/WebSocket wire codec used to build and parse frames.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                      Application / load driver                      |
//! |     acquire_tx() -> codec encode -> submit_io_job(transport, buf)   |
//! +---------------------------------------------------------------------+
//! |                              Engine                                 |
//! |  +---------------+   +------------------+   +------------------+   |
//! |  | Listener x N  |   | Processor x M    |   | Timer thread     |   |
//! |  | one mio::Poll |-->| double-buffered  |<--| reconnect/linger |   |
//! |  | per thread    |   | job queues,      |   | ping, stuck scan |   |
//! |  | readiness ->  |   | state machine,   |   +------------------+   |
//! |  | Job           |   | codec, pools     |                          |
//! |  +---------------+   +------------------+                          |
//! +---------------------------------------------------------------------+
//! |   Transport (per connection): socket/TLS session, phase + modifier  |
//! |   flags, pending-send FIFO, receive reassembly, msg-id table        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqload::{ClientConfig, Engine, EngineConfig, QoS};
//!
//! fn main() -> mqload::Result<()> {
//!     let engine = Engine::start(EngineConfig::default())?;
//!
//!     let client = ClientConfig::new("pub-0000", "127.0.0.1:1883".parse().unwrap());
//!     let transport = engine.add_client(client)?;
//!
//!     // ... wait for the connection to reach the PubSub state, then:
//!     let mut buf = engine.acquire_tx(&transport, 256)?;
//!     let msg_id = transport.alloc_msg_id()?;
//!     mqload::codec::packet::publish(
//!         &mut buf,
//!         &mqload::codec::packet::PublishMessage::new("bench/t0", b"hello")
//!             .qos(QoS::AtLeastOnce)
//!             .msg_id(msg_id),
//!         transport.frame_opts(),
//!     )?;
//!     engine.submit_io_job(&transport, buf)?;
//!
//!     engine.shutdown(std::time::Duration::from_secs(5));
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io;

/// Pooled byte buffers with read/write cursors.
pub mod buffer;
/// MQTT v3.1/v3.1.1/v5 and WebSocket wire codec.
pub mod codec;
/// Engine, client and TLS configuration.
pub mod config;
/// Engine-wide counters and snapshots.
pub mod metrics;
/// Reconnect backoff policy and scheduling.
pub mod reconnect;
/// Per-client MQTT protocol state and inbound dispatch.
pub mod session;
/// Timer service (one-shot, repeating, cancel).
pub mod timer;
/// Connection transport, state machine and I/O threads.
pub mod transport;

pub use buffer::{BufferPool, ByteBuf};
pub use codec::packet::{MqttVersion, QoS};
pub use config::{ClientConfig, EngineConfig, ReconnectPolicy, TlsSettings};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use session::ProtocolState;
pub use transport::engine::Engine;
pub use transport::{Phase, Transport};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error type.
///
/// Transient would-block conditions are never surfaced through this type;
/// they are encoded as connection state modifiers and retried on the next
/// readiness event.
#[derive(Debug)]
pub enum Error {
    /// Underlying socket error.
    Io(io::Error),
    /// A received frame violates the wire format. All malformed
    /// remaining-length, property and header conditions map here.
    MalformedPacket(&'static str),
    /// An encoder would have written past the allocated buffer capacity.
    /// This is an internal programming error, not a peer error.
    BufferOverflow,
    /// The buffer pool is exhausted after bounded retries.
    PoolExhausted,
    /// Operation attempted in a connection state that does not allow it.
    InvalidState(&'static str),
    /// Configuration rejected by validation.
    Config(&'static str),
    /// TLS trust-store verification failed. Fatal for the whole run:
    /// continuing would produce meaningless measurements.
    TlsTrust(String),
    /// Any other TLS-level failure (per-connection recoverable).
    Tls(rustls::Error),
    /// MQTT protocol violation (unexpected packet, bad ack id, ...).
    Protocol(&'static str),
}

impl Error {
    /// Whether this error must terminate the entire run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TlsTrust(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::MalformedPacket(what) => write!(f, "malformed packet: {}", what),
            Error::BufferOverflow => write!(f, "internal error: write past buffer capacity"),
            Error::PoolExhausted => write!(f, "buffer pool exhausted"),
            Error::InvalidState(what) => write!(f, "invalid connection state: {}", what),
            Error::Config(what) => write!(f, "invalid configuration: {}", what),
            Error::TlsTrust(what) => write!(f, "TLS trust verification failed: {}", what),
            Error::Tls(e) => write!(f, "TLS error: {}", e),
            Error::Protocol(what) => write!(f, "protocol error: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        match e {
            rustls::Error::InvalidCertificate(reason) => {
                Error::TlsTrust(format!("{:?}", reason))
            }
            other => Error::Tls(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::MalformedPacket("bad varint");
        assert_eq!(e.to_string(), "malformed packet: bad varint");

        let e = Error::Config("num_processors must be > 0");
        assert!(e.to_string().contains("configuration"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::TlsTrust("UnknownIssuer".into()).is_fatal());
        assert!(!Error::PoolExhausted.is_fatal());
        assert!(!Error::Io(io::Error::other("x")).is_fatal());
    }

    #[test]
    fn test_tls_error_conversion() {
        let e: Error = rustls::Error::InvalidCertificate(
            rustls::CertificateError::UnknownIssuer,
        )
        .into();
        assert!(e.is_fatal());

        let e: Error = rustls::Error::HandshakeNotComplete.into();
        assert!(!e.is_fatal());
    }
}
