//! Configuration types for the room client

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default signaling server host
pub const DEFAULT_SERVER_HOST: &str = "v3demo.mediasoup.org";

/// Default signaling server port
pub const DEFAULT_SERVER_PORT: u16 = 4443;

/// Default request timeout (matches protoo's 1500ms * 15 base)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 22_500;

/// Room options, consumed as an immutable value by [`crate::RoomClient`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomOptions {
    /// Signaling server host name
    pub server_host: String,

    /// Signaling server port
    pub server_port: u16,

    /// Room identifier (random if empty)
    pub room_id: String,

    /// Local peer identifier (random if empty)
    pub peer_id: String,

    /// Display name announced on join (random if empty)
    pub display_name: String,

    /// Ask the server for TCP-only ICE candidates
    pub force_tcp: bool,

    /// Create a send transport and produce mic/cam
    pub produce: bool,

    /// Create a receive transport and accept consumers
    pub consume: bool,

    /// Forced video codec, passed to the server in the signaling URL
    pub video_codec: Option<VideoCodec>,

    /// Device descriptor sent in the join request
    pub device: DeviceInfo,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// What to do when the signaling connection drops
    pub reconnect: ReconnectPolicy,
}

/// Forced video codec preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    /// H.264
    #[serde(rename = "h264")]
    H264,
    /// VP9
    #[serde(rename = "vp9")]
    VP9,
}

impl VideoCodec {
    /// Query parameter telling the server to force this codec
    fn query_param(self) -> &'static str {
        match self {
            VideoCodec::H264 => "forceH264",
            VideoCodec::VP9 => "forceVP9",
        }
    }

    /// Mime type of the codec
    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP9 => "video/VP9",
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(VideoCodec::H264),
            "vp9" => Ok(VideoCodec::VP9),
            other => Err(Error::invalid_config(format!(
                "unknown video codec '{}', expected h264 or vp9",
                other
            ))),
        }
    }
}

/// Device descriptor announced to the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Short device flag
    pub flag: String,
    /// Human readable device name
    pub name: String,
    /// Client version
    pub version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            flag: "rust".to_string(),
            name: "sfu-room-client".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Reconnect behaviour after a connect failure or an unexpected disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Never reconnect; the caller must call `join()` again
    Manual,
    /// Reconnect with exponential backoff
    Automatic {
        /// Attempts before giving up and closing the session
        max_attempts: u32,
        /// Delay before the first retry
        min_delay_ms: u64,
        /// Upper bound on the delay
        max_delay_ms: u64,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Automatic {
            max_attempts: 10,
            min_delay_ms: 1000,
            max_delay_ms: 8000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` when the
    /// policy gives up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Manual => None,
            ReconnectPolicy::Automatic {
                max_attempts,
                min_delay_ms,
                max_delay_ms,
            } => {
                if attempt == 0 || attempt > max_attempts {
                    return None;
                }
                let factor = 1u64 << (attempt - 1).min(16);
                let delay = min_delay_ms.saturating_mul(factor).min(max_delay_ms);
                Some(Duration::from_millis(delay))
            }
        }
    }

    /// Whether the channel reconnects on its own
    pub fn is_automatic(&self) -> bool {
        matches!(self, ReconnectPolicy::Automatic { .. })
    }
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            room_id: String::new(),
            peer_id: String::new(),
            display_name: String::new(),
            force_tcp: false,
            produce: true,
            consume: true,
            video_codec: None,
            device: DeviceInfo::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl RoomOptions {
    /// Create options for the given room and peer
    pub fn new(room_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            peer_id: peer_id.into(),
            ..Default::default()
        }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the signaling server
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_host = host.into();
        self.server_port = port;
        self
    }

    /// Enable or disable producing and consuming
    pub fn with_media(mut self, produce: bool, consume: bool) -> Self {
        self.produce = produce;
        self.consume = consume;
        self
    }

    /// Force a video codec
    pub fn with_video_codec(mut self, codec: Option<VideoCodec>) -> Self {
        self.video_codec = codec;
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Request timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Fill empty room id, peer id and display name with random 8-char ids
    pub fn with_generated_ids(mut self) -> Self {
        if self.room_id.is_empty() {
            self.room_id = random_id();
        }
        if self.peer_id.is_empty() {
            self.peer_id = random_id();
        }
        if self.display_name.is_empty() {
            self.display_name = random_id();
        }
        self
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `server_host` is empty or `server_port` is 0
    /// - `room_id` or `peer_id` is empty
    /// - `request_timeout_ms` is 0
    /// - an automatic reconnect policy has no attempts or an inverted delay range
    pub fn validate(&self) -> Result<()> {
        if self.server_host.trim().is_empty() {
            return Err(Error::invalid_config("server_host must not be empty"));
        }

        if self.server_port == 0 {
            return Err(Error::invalid_config("server_port must not be 0"));
        }

        if self.room_id.is_empty() || self.peer_id.is_empty() {
            return Err(Error::invalid_config(
                "room_id and peer_id must not be empty",
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::invalid_config("request_timeout_ms must be > 0"));
        }

        if let ReconnectPolicy::Automatic {
            max_attempts,
            min_delay_ms,
            max_delay_ms,
        } = self.reconnect
        {
            if max_attempts == 0 {
                return Err(Error::invalid_config(
                    "automatic reconnect needs max_attempts > 0",
                ));
            }
            if min_delay_ms > max_delay_ms {
                return Err(Error::invalid_config(format!(
                    "reconnect min_delay_ms ({}) exceeds max_delay_ms ({})",
                    min_delay_ms, max_delay_ms
                )));
            }
        }

        Ok(())
    }

    /// Signaling WebSocket URL for this room and peer
    pub fn signaling_url(&self) -> Result<Url> {
        let base = format!("wss://{}:{}/", self.server_host, self.server_port);
        let mut url = Url::parse(&base)
            .map_err(|e| Error::invalid_config(format!("bad signaling url {}: {}", base, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("roomId", &self.room_id);
            query.append_pair("peerId", &self.peer_id);
            if let Some(codec) = self.video_codec {
                query.append_pair(codec.query_param(), "true");
            }
        }
        Ok(url)
    }

    /// Link other participants can open to join the same room
    pub fn invitation_link(&self) -> Result<Url> {
        let base = format!("https://{}/", self.server_host);
        let mut url = Url::parse(&base)
            .map_err(|e| Error::invalid_config(format!("bad invitation url {}: {}", base, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("roomId", &self.room_id);
            if let Some(codec) = self.video_codec {
                query.append_pair(codec.query_param(), "true");
            }
        }
        Ok(url)
    }

    /// Load options from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Load options from `ROOM_*` environment variables
    ///
    /// Recognized variables: `ROOM_SERVER_HOST`, `ROOM_SERVER_PORT`, `ROOM_ID`,
    /// `ROOM_PEER_ID`, `ROOM_DISPLAY_NAME`, `ROOM_FORCE_TCP`, `ROOM_PRODUCE`,
    /// `ROOM_CONSUME`, `ROOM_VIDEO_CODEC`, `ROOM_REQUEST_TIMEOUT_MS`,
    /// `ROOM_RECONNECT` (`manual` or `automatic`).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load options through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(host) = lookup("ROOM_SERVER_HOST") {
            options.server_host = host;
        }
        if let Some(port) = lookup("ROOM_SERVER_PORT") {
            options.server_port = parse_value("ROOM_SERVER_PORT", &port)?;
        }
        if let Some(room_id) = lookup("ROOM_ID") {
            options.room_id = room_id;
        }
        if let Some(peer_id) = lookup("ROOM_PEER_ID") {
            options.peer_id = peer_id;
        }
        if let Some(name) = lookup("ROOM_DISPLAY_NAME") {
            options.display_name = name;
        }
        if let Some(flag) = lookup("ROOM_FORCE_TCP") {
            options.force_tcp = parse_bool("ROOM_FORCE_TCP", &flag)?;
        }
        if let Some(flag) = lookup("ROOM_PRODUCE") {
            options.produce = parse_bool("ROOM_PRODUCE", &flag)?;
        }
        if let Some(flag) = lookup("ROOM_CONSUME") {
            options.consume = parse_bool("ROOM_CONSUME", &flag)?;
        }
        if let Some(codec) = lookup("ROOM_VIDEO_CODEC") {
            options.video_codec = if codec.is_empty() {
                None
            } else {
                Some(codec.parse()?)
            };
        }
        if let Some(timeout) = lookup("ROOM_REQUEST_TIMEOUT_MS") {
            options.request_timeout_ms = parse_value("ROOM_REQUEST_TIMEOUT_MS", &timeout)?;
        }
        if let Some(mode) = lookup("ROOM_RECONNECT") {
            options.reconnect = match mode.to_ascii_lowercase().as_str() {
                "manual" => ReconnectPolicy::Manual,
                "automatic" => ReconnectPolicy::default(),
                other => {
                    return Err(Error::invalid_config(format!(
                        "ROOM_RECONNECT must be manual or automatic, got {}",
                        other
                    )))
                }
            };
        }

        Ok(options)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::invalid_config(format!(
            "{} must be a boolean, got {}",
            key, value
        ))),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_config(format!("{} has invalid value {}", key, value)))
}

fn random_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
