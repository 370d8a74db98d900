use std::{
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use thiserror::Error;

use crate::websocket::compression::PerMessageCompressionNegotiator;

/// WebSocket protocol versions this implementation speaks.
pub const SUPPORTED_VERSIONS: [u32; 2] = [8, 13];

/// The default Flash socket policy file.
pub const DEFAULT_FLASH_SOCKET_POLICY: &str = "<cross-domain-policy>\n     <allow-access-from domain=\"*\" to-ports=\"*\" />\n</cross-domain-policy>\0";

/// Error for invalid WebSocket options.
#[derive(Debug, Error)]
#[error("invalid websocket options: {0}")]
pub struct InvalidOptions(String);

/// Options shared by WebSocket servers and clients.
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Validate UTF-8 of incoming text messages.
    pub utf8_validate_incoming: bool,
    /// Unmask incoming masked frames.
    pub apply_mask: bool,
    /// Maximum payload of a single incoming frame. Zero means unlimited.
    pub max_frame_payload_size: usize,
    /// Maximum payload of a reassembled incoming message. Zero means unlimited.
    pub max_message_payload_size: usize,
    /// Fragment outgoing messages into frames of at most this size. Zero means no fragmentation.
    pub auto_fragment_size: usize,
    /// Drop the TCP connection immediately when failing it, rather than closing cleanly.
    pub fail_by_drop: bool,
    /// Echo the peer's close code and reason when replying to a close.
    pub echo_close_code_reason: bool,
    pub open_handshake_timeout: Option<Duration>,
    pub close_handshake_timeout: Option<Duration>,
    pub tcp_no_delay: bool,
    /// Send a ping after this long without hearing a pong.
    pub auto_ping_interval: Option<Duration>,
    /// Drop the connection if a ping is not answered in time.
    pub auto_ping_timeout: Option<Duration>,
    /// Size of the random ping payload.
    pub auto_ping_size: usize,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            utf8_validate_incoming: true,
            apply_mask: true,
            max_frame_payload_size: 0,
            max_message_payload_size: 0,
            auto_fragment_size: 0,
            fail_by_drop: true,
            echo_close_code_reason: false,
            open_handshake_timeout: Some(Duration::from_secs(5)),
            close_handshake_timeout: Some(Duration::from_secs(1)),
            tcp_no_delay: true,
            auto_ping_interval: None,
            auto_ping_timeout: None,
            auto_ping_size: 4,
        }
    }
}

impl ProtocolOptions {
    pub fn validate(&self) -> Result<()> {
        if !(4..=125).contains(&self.auto_ping_size) {
            return Err(InvalidOptions(format!(
                "auto_ping_size must be in [4, 125], was {}",
                self.auto_ping_size
            ))
            .into());
        }
        for (name, timeout) in [
            ("open_handshake_timeout", self.open_handshake_timeout),
            ("close_handshake_timeout", self.close_handshake_timeout),
            ("auto_ping_interval", self.auto_ping_interval),
            ("auto_ping_timeout", self.auto_ping_timeout),
        ] {
            if timeout.is_some_and(|timeout| timeout.is_zero()) {
                return Err(InvalidOptions(format!("{name} must be positive")).into());
            }
        }
        Ok(())
    }
}

/// Options for accepting WebSocket connections.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub protocol: ProtocolOptions,
    /// Accepted protocol versions.
    pub versions: Vec<u32>,
    /// Serve a status page for plain HTTP requests.
    pub web_status: bool,
    pub require_masked_client_frames: bool,
    pub mask_server_frames: bool,
    /// Compression extensions the server is willing to accept, in order of preference.
    pub per_message_compression: Vec<Arc<dyn PerMessageCompressionNegotiator>>,
    /// Origin patterns, where `*` matches anything.
    pub allowed_origins: Vec<String>,
    pub allow_null_origin: bool,
    /// Maximum number of concurrent connections. Zero means unlimited.
    pub max_connections: usize,
    /// Number of trusted proxies in front of the server that set `X-Forwarded-For`.
    pub trust_x_forwarded_for: usize,
    pub serve_flash_socket_policy: bool,
    pub flash_socket_policy: String,
    /// Value of the `Server` header.
    pub server: String,
    /// Extra headers on every handshake response.
    pub headers: Vec<(String, String)>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolOptions::default(),
            versions: SUPPORTED_VERSIONS.to_vec(),
            web_status: true,
            require_masked_client_frames: true,
            mask_server_frames: false,
            per_message_compression: Vec::new(),
            allowed_origins: Vec::from_iter(["*".to_owned()]),
            allow_null_origin: false,
            max_connections: 0,
            trust_x_forwarded_for: 0,
            serve_flash_socket_policy: false,
            flash_socket_policy: DEFAULT_FLASH_SOCKET_POLICY.to_owned(),
            server: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")).to_owned(),
            headers: Vec::new(),
        }
    }
}

impl ServerOptions {
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        if self.versions.is_empty() {
            return Err(InvalidOptions("at least one version must be supported".to_owned()).into());
        }
        if let Some(version) = self
            .versions
            .iter()
            .find(|version| !SUPPORTED_VERSIONS.contains(version))
        {
            return Err(InvalidOptions(format!("unsupported version {version}")).into());
        }
        Ok(())
    }
}

/// Options for opening WebSocket connections.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub protocol: ProtocolOptions,
    /// Protocol version to request.
    pub version: u32,
    pub accept_masked_server_frames: bool,
    pub mask_client_frames: bool,
    /// How long to wait for the server to drop the connection after the closing handshake.
    pub server_connection_drop_timeout: Option<Duration>,
    /// Compression extensions to offer, in order of preference.
    pub per_message_compression_offers: Vec<Arc<dyn PerMessageCompressionNegotiator>>,
    pub origin: Option<String>,
    /// Subprotocols to request, in order of preference.
    pub protocols: Vec<String>,
    /// Extra headers on the handshake request.
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
    /// HTTP proxy to tunnel through with `CONNECT`.
    pub proxy: Option<(String, u16)>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolOptions::default(),
            version: 13,
            accept_masked_server_frames: false,
            mask_client_frames: true,
            server_connection_drop_timeout: Some(Duration::from_secs(1)),
            per_message_compression_offers: Vec::new(),
            origin: None,
            protocols: Vec::new(),
            headers: Vec::new(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")).to_owned(),
            proxy: None,
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(InvalidOptions(format!("unsupported version {}", self.version)).into());
        }
        if self
            .server_connection_drop_timeout
            .is_some_and(|timeout| timeout.is_zero())
        {
            return Err(
                InvalidOptions("server_connection_drop_timeout must be positive".to_owned()).into(),
            );
        }
        Ok(())
    }
}
