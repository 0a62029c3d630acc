// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine, client and TLS configuration.
//!
//! [`EngineConfig`] sizes the shared machinery (threads, pools, pacing);
//! [`ClientConfig`] describes one simulated client. Both validate before
//! use and return `&'static str` reasons on rejection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::packet::{MqttVersion, Subscription, WillMessage};
use crate::Result;

// ============================================================================
// Engine configuration
// ============================================================================

/// Engine-wide configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    // === Threads ===
    /// Number of I/O listener threads (one epoll instance each).
    pub num_listeners: usize,

    /// Number of I/O processor threads.
    pub num_processors: usize,

    // === Buffer pools (per processor thread) ===
    /// TX pool size classes as `(buffer_size, buffer_count)`.
    pub tx_pool_classes: Vec<(usize, usize)>,

    /// RX buffer size.
    pub rx_buffer_size: usize,

    /// RX buffers per processor.
    pub rx_pool_buffers: usize,

    /// Per-connection send accumulation buffer; pending messages are
    /// batched into it before each socket write.
    pub send_buffer_size: usize,

    // === Sockets ===
    /// SO_SNDBUF (0 = OS default).
    pub socket_send_buffer: usize,

    /// SO_RCVBUF (0 = OS default).
    pub socket_recv_buffer: usize,

    /// TCP_NODELAY on every connection.
    pub nodelay: bool,

    /// SO_KEEPALIVE on every connection.
    pub keepalive: bool,

    // === Pacing ===
    /// Sleep between processor iterations. `None` yields instead, which
    /// minimizes added latency at the cost of spinning.
    pub batching_delay: Option<Duration>,

    /// Interval of the stuck-connection scan.
    pub scan_interval: Duration,

    // === Limits ===
    /// Largest inbound MQTT packet accepted.
    pub max_packet_size: usize,

    // === TLS ===
    /// Shared TLS material for secure clients. One rustls client config is
    /// instantiated per processor thread from these settings.
    pub tls: Option<TlsSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_listeners: 1,
            num_processors: 3,

            tx_pool_classes: vec![(256, 1024), (1024, 512), (4096, 256), (16384, 64)],
            rx_buffer_size: 16 * 1024,
            rx_pool_buffers: 256,
            send_buffer_size: 16 * 1024,

            socket_send_buffer: 0,
            socket_recv_buffer: 0,
            nodelay: true,
            keepalive: true,

            batching_delay: None,
            scan_interval: Duration::from_secs(5),

            max_packet_size: 16 * 1024 * 1024,

            tls: None,
        }
    }
}

impl EngineConfig {
    /// Builder: thread counts.
    pub fn with_threads(mut self, listeners: usize, processors: usize) -> Self {
        self.num_listeners = listeners;
        self.num_processors = processors;
        self
    }

    /// Builder: TLS settings.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Builder: processor pacing delay.
    pub fn with_batching_delay(mut self, delay: Duration) -> Self {
        self.batching_delay = Some(delay);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.num_listeners == 0 {
            return Err("num_listeners must be > 0");
        }
        if self.num_processors == 0 {
            return Err("num_processors must be > 0");
        }
        if self.tx_pool_classes.is_empty() {
            return Err("tx_pool_classes must not be empty");
        }
        if self
            .tx_pool_classes
            .iter()
            .any(|&(size, count)| size == 0 || count == 0)
        {
            return Err("tx pool classes must have non-zero size and count");
        }
        if !self
            .tx_pool_classes
            .windows(2)
            .all(|w| w[0].0 < w[1].0)
        {
            return Err("tx pool classes must be sorted by ascending size");
        }
        if self.rx_buffer_size == 0 || self.rx_pool_buffers == 0 {
            return Err("rx pool must have non-zero size and count");
        }
        if self.send_buffer_size == 0 {
            return Err("send_buffer_size must be > 0");
        }
        if self.max_packet_size == 0 {
            return Err("max_packet_size must be > 0");
        }
        if self.scan_interval.is_zero() {
            return Err("scan_interval must be > 0");
        }
        Ok(())
    }
}

// ============================================================================
// Reconnect policy
// ============================================================================

/// Reconnect/backoff behavior for one client.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub enabled: bool,

    /// First retry delay.
    pub initial_delay: Duration,

    /// Delay growth: `factor > 1` multiplies the delay, `0 < factor < 1`
    /// adds `delay * factor`, `0` keeps it constant.
    pub factor: f64,

    /// Hard `connect()` failures before the failure log is suppressed for
    /// this client.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_attempts: 100,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

// ============================================================================
// Client configuration
// ============================================================================

/// Configuration of one simulated MQTT client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// MQTT client identifier.
    pub client_id: String,

    /// Broker address.
    pub server_addr: SocketAddr,

    /// Host name used for the TLS SNI and the WebSocket `Host:` header.
    /// Falls back to the address when unset.
    pub server_name: Option<String>,

    /// Fixed source address/port to bind; `None` lets the OS pick an
    /// ephemeral port.
    pub source: Option<SocketAddr>,

    pub version: MqttVersion,
    pub clean_start: bool,
    pub keepalive_secs: u16,

    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<WillMessage>,

    /// Topics subscribed after the MQTT connect completes.
    pub subscriptions: Vec<Subscription>,

    /// User properties added to the v5 CONNECT.
    pub user_properties: Vec<(String, String)>,

    /// Wrap the MQTT stream in WebSocket framing.
    pub websocket: bool,

    /// Use TLS (requires [`EngineConfig::tls`]).
    pub secure: bool,

    pub reconnect: ReconnectPolicy,

    /// How long the connection may sit in a handshake or disconnect phase
    /// before the periodic scan force-reschedules it. Zero disables the
    /// check for this client.
    pub connection_timeout: Duration,

    /// Delay between a removal request and the graceful DISCONNECT.
    pub linger: Option<Duration>,

    /// Message-id window for QoS > 0 publishes.
    pub max_inflight: u16,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>, server_addr: SocketAddr) -> Self {
        Self {
            client_id: client_id.into(),
            server_addr,
            server_name: None,
            source: None,
            version: MqttVersion::default(),
            clean_start: true,
            keepalive_secs: 60,
            username: None,
            password: None,
            will: None,
            subscriptions: Vec::new(),
            user_properties: Vec::new(),
            websocket: false,
            secure: false,
            reconnect: ReconnectPolicy::default(),
            connection_timeout: Duration::from_secs(120),
            linger: None,
            max_inflight: 256,
        }
    }

    /// Builder: MQTT protocol version.
    pub fn with_version(mut self, version: MqttVersion) -> Self {
        self.version = version;
        self
    }

    /// Builder: username/password credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: &[u8]) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.to_vec());
        self
    }

    /// Builder: add a subscription.
    pub fn with_subscription(mut self, sub: Subscription) -> Self {
        self.subscriptions.push(sub);
        self
    }

    /// Builder: enable WebSocket framing.
    pub fn with_websocket(mut self) -> Self {
        self.websocket = true;
        self
    }

    /// Builder: enable TLS.
    pub fn with_tls(mut self, server_name: impl Into<String>) -> Self {
        self.secure = true;
        self.server_name = Some(server_name.into());
        self
    }

    /// Builder: reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Host string for SNI and the WebSocket upgrade.
    pub fn host(&self) -> String {
        self.server_name
            .clone()
            .unwrap_or_else(|| self.server_addr.to_string())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.client_id.is_empty() {
            return Err("client_id must not be empty");
        }
        if self.client_id.len() > u16::MAX as usize {
            return Err("client_id too long");
        }
        if self.max_inflight == 0 {
            return Err("max_inflight must be > 0");
        }
        if self.reconnect.factor < 0.0 {
            return Err("reconnect factor must be >= 0");
        }
        if self.reconnect.enabled && self.reconnect.initial_delay.is_zero() {
            return Err("reconnect initial_delay must be > 0");
        }
        if self
            .subscriptions
            .iter()
            .any(|s| s.topic.is_empty() || s.topic.len() > u16::MAX as usize)
        {
            return Err("subscription topic has invalid length");
        }
        if let Some(will) = &self.will {
            if will.topic.is_empty() {
                return Err("will topic must not be empty");
            }
        }
        Ok(())
    }
}

// ============================================================================
// TLS settings
// ============================================================================

/// TLS client material, turned into a `rustls::ClientConfig` at engine
/// start (one instance per processor thread to avoid cross-thread lock
/// contention inside the TLS library).
#[derive(Clone, Default)]
pub struct TlsSettings {
    /// Additional trust anchors in PEM form.
    pub root_certs_pem: Option<Vec<u8>>,

    /// Include the bundled webpki roots.
    pub use_default_roots: bool,

    /// Client certificate chain (PEM) for mutual TLS.
    pub client_cert_pem: Option<Vec<u8>>,

    /// Client private key (PEM) for mutual TLS.
    pub client_key_pem: Option<Vec<u8>>,

    /// ALPN protocols to offer.
    pub alpn: Vec<Vec<u8>>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("root_certs_pem", &self.root_certs_pem.as_ref().map(|v| v.len()))
            .field("use_default_roots", &self.use_default_roots)
            .field("client_cert", &self.client_cert_pem.is_some())
            .field("alpn", &self.alpn.len())
            .finish()
    }
}

impl TlsSettings {
    /// Settings trusting the bundled default roots.
    pub fn default_roots() -> Self {
        Self {
            use_default_roots: true,
            ..Default::default()
        }
    }

    /// Builder: add PEM trust anchors.
    pub fn with_root_certs_pem(mut self, pem: Vec<u8>) -> Self {
        self.root_certs_pem = Some(pem);
        self
    }

    /// Builder: client certificate and key for mutual TLS.
    pub fn with_client_auth(mut self, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        self.client_cert_pem = Some(cert_pem);
        self.client_key_pem = Some(key_pem);
        self
    }

    /// Build a rustls client configuration from these settings.
    pub fn build_client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        use rustls::pki_types::{CertificateDer, PrivateKeyDer};

        let mut roots = rustls::RootCertStore::empty();
        if self.use_default_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        if let Some(pem) = &self.root_certs_pem {
            let mut reader = &pem[..];
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(crate::Error::Io)?;
                roots
                    .add(cert)
                    .map_err(|_| crate::Error::Config("invalid root certificate"))?;
            }
        }
        if roots.is_empty() {
            return Err(crate::Error::Config(
                "TLS requires root certificates or use_default_roots",
            ));
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let mut config = match (&self.client_cert_pem, &self.client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let mut reader = &cert_pem[..];
                let certs: std::io::Result<Vec<CertificateDer<'static>>> =
                    rustls_pemfile::certs(&mut reader).collect();
                let certs = certs.map_err(crate::Error::Io)?;

                let mut key_reader = &key_pem[..];
                let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
                    .map_err(crate::Error::Io)?
                    .ok_or(crate::Error::Config("no private key in PEM data"))?;

                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(crate::Error::Tls)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(crate::Error::Config(
                    "client cert and key must be provided together",
                ))
            }
        };

        config.alpn_protocols = self.alpn.clone();
        Ok(Arc::new(config))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::QoS;

    fn addr() -> SocketAddr {
        "127.0.0.1:1883".parse().unwrap()
    }

    #[test]
    fn test_engine_defaults_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_listeners, 1);
        assert_eq!(config.num_processors, 3);
        assert!(config.nodelay);
    }

    #[test]
    fn test_engine_validation_errors() {
        let config = EngineConfig {
            num_processors: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            tx_pool_classes: vec![(1024, 8), (256, 8)],
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            "tx pool classes must be sorted by ascending size"
        );

        let config = EngineConfig {
            send_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_defaults_valid() {
        let config = ClientConfig::new("cid", addr());
        assert!(config.validate().is_ok());
        assert_eq!(config.version, MqttVersion::V311);
        assert!(config.clean_start);
        assert!(config.reconnect.enabled);
    }

    #[test]
    fn test_client_builders() {
        let config = ClientConfig::new("cid", addr())
            .with_version(MqttVersion::V5)
            .with_credentials("user", b"secret")
            .with_subscription(Subscription::new("a/+/b", QoS::AtLeastOnce))
            .with_websocket()
            .with_tls("broker.example.com")
            .with_reconnect(ReconnectPolicy::disabled());

        assert_eq!(config.version, MqttVersion::V5);
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.subscriptions.len(), 1);
        assert!(config.websocket);
        assert!(config.secure);
        assert!(!config.reconnect.enabled);
        assert_eq!(config.host(), "broker.example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_validation_errors() {
        let config = ClientConfig::new("", addr());
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("cid", addr());
        config.max_inflight = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("cid", addr());
        config.reconnect.factor = -1.0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("cid", addr());
        config.subscriptions.push(Subscription::new("", QoS::AtMostOnce));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_host_falls_back_to_addr() {
        let config = ClientConfig::new("cid", addr());
        assert_eq!(config.host(), "127.0.0.1:1883");
    }

    #[test]
    fn test_tls_default_roots_builds() {
        let settings = TlsSettings::default_roots();
        assert!(settings.build_client_config().is_ok());
    }

    #[test]
    fn test_tls_no_roots_rejected() {
        let settings = TlsSettings::default();
        assert!(matches!(
            settings.build_client_config(),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_tls_cert_without_key_rejected() {
        let settings = TlsSettings {
            use_default_roots: true,
            client_cert_pem: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
            ..Default::default()
        };
        assert!(matches!(
            settings.build_client_config(),
            Err(crate::Error::Config(_))
        ));
    }
}
