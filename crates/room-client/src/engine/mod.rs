//! Media engine boundary
//!
//! The room client never touches ICE, DTLS, SRTP or codecs itself. It drives
//! an implementation of [`MediaEngine`] and reacts to the transport callbacks
//! the engine fires through [`TransportListener`] and
//! [`SendTransportListener`].
//!
//! Engine calls are synchronous and made from the room worker thread.
//! Listener callbacks may be invoked from any thread.

pub mod passive;

pub use passive::PassiveEngine;

use crate::capture::MediaTrack;
use crate::signaling::protocol::TransportInfo;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Media kind of a producer, consumer or track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio
    Audio,
    /// Video
    Video,
    /// Data channel
    Data,
}

impl MediaKind {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Data => "data",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            "data" => Ok(MediaKind::Data),
            other => Err(Error::protocol(format!("unknown media kind '{}'", other))),
        }
    }
}

/// Direction of a WebRTC transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportDirection {
    /// Carries local producers to the SFU
    Send,
    /// Carries remote media from the SFU
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// Connection state of a WebRTC transport, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, not connecting yet
    New,
    /// ICE/DTLS negotiation in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Negotiation failed
    Failed,
    /// Closed locally
    Closed,
}

impl TransportState {
    /// Parse an engine state string (`"new"`, `"checking"`, `"connected"`, ...)
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "new" => Some(TransportState::New),
            "checking" | "connecting" => Some(TransportState::Connecting),
            "connected" | "completed" => Some(TransportState::Connected),
            "disconnected" => Some(TransportState::Disconnected),
            "failed" => Some(TransportState::Failed),
            "closed" => Some(TransportState::Closed),
            _ => None,
        }
    }
}

/// Options passed to [`SendTransport::produce`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProduceOptions {
    /// Preferred codec mime type (e.g. `video/H264`), engine default if `None`
    pub codec: Option<String>,
    /// Codec specific options
    pub codec_options: Option<Value>,
    /// Application data echoed to the server in `produce`
    pub app_data: Value,
}

/// Payload of a server `newConsumer` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    /// Peer owning the remote producer
    pub peer_id: String,
    /// Remote producer id
    pub producer_id: String,
    /// Server-assigned consumer id
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// RTP parameters of the consumer
    pub rtp_parameters: Value,
    /// Consumer type (`simple`, `simulcast`, `svc`)
    #[serde(default, rename = "type")]
    pub consumer_type: Option<String>,
    /// Application data
    #[serde(default)]
    pub app_data: Value,
    /// Whether the remote producer is currently paused
    #[serde(default)]
    pub producer_paused: bool,
}

/// Callbacks every transport fires
pub trait TransportListener: Send + Sync {
    /// Local DTLS parameters are ready and must reach the server.
    /// Must return without waiting for the network.
    fn on_connect(&self, transport_id: &str, dtls_parameters: Value);

    /// Informational connection state change
    fn on_connection_state_change(&self, transport_id: &str, state: TransportState);
}

/// Callbacks of a send transport
pub trait SendTransportListener: TransportListener {
    /// The engine needs a server-assigned producer id before it activates a
    /// producer. Blocks the calling thread until the id is known.
    fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String>;
}

/// Local outbound media registration
pub trait Producer: Send + Sync {
    /// Server-assigned id
    fn id(&self) -> &str;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Whether sending is paused
    fn is_paused(&self) -> bool;
    /// Pause sending
    fn pause(&self);
    /// Resume sending
    fn resume(&self);
    /// Release engine resources
    fn close(&self);
}

/// Local representation of a remote stream
pub trait Consumer: Send + Sync {
    /// Server-assigned id
    fn id(&self) -> &str;
    /// Remote producer id
    fn producer_id(&self) -> &str;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Whether receiving is paused locally
    fn is_paused(&self) -> bool;
    /// Pause locally
    fn pause(&self);
    /// Resume locally
    fn resume(&self);
    /// Release engine resources
    fn close(&self);
}

/// Operations shared by both transport directions
pub trait Transport: Send + Sync {
    /// Server transport id
    fn id(&self) -> &str;
    /// Apply fresh ICE parameters after `restartIce`
    fn restart_ice(&self, ice_parameters: &Value) -> Result<()>;
    /// Close the transport and everything produced/consumed on it
    fn close(&self);
}

/// Transport carrying local producers
pub trait SendTransport: Transport {
    /// Produce `track`. Fires [`SendTransportListener::on_produce`] on the
    /// calling thread before returning.
    fn produce(&self, track: Arc<dyn MediaTrack>, options: ProduceOptions)
        -> Result<Box<dyn Producer>>;
}

/// Transport carrying remote media
pub trait RecvTransport: Transport {
    /// Create a consumer for a server `newConsumer` request
    fn consume(&self, info: &ConsumerInfo) -> Result<Arc<dyn Consumer>>;
}

/// Opaque WebRTC media engine (the "device")
pub trait MediaEngine: Send + Sync {
    /// Load the router RTP capabilities and return the local ones
    fn load(&self, router_rtp_capabilities: &Value) -> Result<Value>;

    /// Whether [`load`](Self::load) succeeded
    fn is_loaded(&self) -> bool;

    /// Local RTP capabilities, once loaded
    fn rtp_capabilities(&self) -> Option<Value>;

    /// Local SCTP capabilities, `None` without data channel support
    fn sctp_capabilities(&self) -> Option<Value> {
        None
    }

    /// Whether media of `kind` can be sent to the loaded router
    fn can_produce(&self, kind: MediaKind) -> bool;

    /// Build the local send transport
    fn create_send_transport(
        &self,
        listener: Arc<dyn SendTransportListener>,
        info: &TransportInfo,
    ) -> Result<Box<dyn SendTransport>>;

    /// Build the local receive transport
    fn create_recv_transport(
        &self,
        listener: Arc<dyn TransportListener>,
        info: &TransportInfo,
    ) -> Result<Box<dyn RecvTransport>>;

    /// Release the device
    fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!("audio".parse::<MediaKind>().unwrap(), MediaKind::Audio);
        assert_eq!(MediaKind::Video.to_string(), "video");
        assert!("screen".parse::<MediaKind>().is_err());
    }

    #[test]
    fn test_transport_state_parse() {
        assert_eq!(TransportState::parse("checking"), Some(TransportState::Connecting));
        assert_eq!(TransportState::parse("completed"), Some(TransportState::Connected));
        assert_eq!(TransportState::parse("bogus"), None);
    }

    #[test]
    fn test_consumer_info_from_new_consumer_payload() {
        let info: ConsumerInfo = serde_json::from_value(json!({
            "peerId": "p2",
            "producerId": "prod-9",
            "id": "c1",
            "kind": "video",
            "rtpParameters": {"codecs": []},
            "type": "simulcast",
            "appData": {},
            "producerPaused": true
        }))
        .unwrap();
        assert_eq!(info.peer_id, "p2");
        assert_eq!(info.kind, MediaKind::Video);
        assert_eq!(info.consumer_type.as_deref(), Some("simulcast"));
        assert!(info.producer_paused);
    }
}
