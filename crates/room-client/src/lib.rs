//! Client session for multi-party rooms behind a WebRTC SFU
//!
//! This crate drives one participant through the lifecycle of a room: it
//! connects to the signaling server over protoo-style JSON frames, joins,
//! negotiates send and receive transports, publishes microphone and camera
//! producers, accepts server-initiated consumers and mirrors everything into
//! an observable [`RoomStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  RoomClient (handle, enqueue-only API)                   │
//! │  ↓ commands                                              │
//! │  room-worker thread (single writer)                      │
//! │  ├─ session phase + epoch                                │
//! │  ├─ MediaEngine: send/recv transports, producers         │
//! │  ├─ NotificationRouter: peers, consumers, scores         │
//! │  └─ RoomStore (snapshots + broadcast events)             │
//! │  ↕ ChannelEvent                                          │
//! │  room-signaling runtime                                  │
//! │  └─ SignalingChannel (pending requests, reconnects)      │
//! │     └─ Connector (WebSocket "protoo" / in-memory)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use sfu_room_client::{ReconnectPolicy, RoomOptions};
//!
//! let options = RoomOptions::new("room1", "alice")
//!     .with_display_name("Alice")
//!     .with_server("sfu.example.com", 4443)
//!     .with_reconnect(ReconnectPolicy::Manual);
//!
//! assert!(options.validate().is_ok());
//! assert!(options
//!     .signaling_url()
//!     .unwrap()
//!     .as_str()
//!     .starts_with("wss://sfu.example.com:4443/?roomId=room1&peerId=alice"));
//! ```
//!
//! ## Observing a room
//!
//! ```no_run
//! use std::sync::Arc;
//! use sfu_room_client::{NullCapture, PassiveEngine, RoomClient, RoomOptions};
//!
//! # fn example() -> sfu_room_client::Result<()> {
//! let options = RoomOptions::new("room1", "observer").with_media(false, false);
//! let client = RoomClient::new(
//!     options,
//!     Arc::new(PassiveEngine::new()),
//!     Arc::new(NullCapture),
//! )?;
//!
//! let mut events = client.subscribe();
//! client.join();
//! // ... consume `events`, inspect `client.snapshot()` ...
//! client.close();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod capture;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod router;
pub mod signaling;
pub mod store;

pub use capture::{LocalTrack, MediaCaptureProvider, MediaTrack, NullCapture};
pub use client::RoomClient;
pub use config::{DeviceInfo, ReconnectPolicy, RoomOptions, VideoCodec};
pub use engine::{
    Consumer, ConsumerInfo, MediaEngine, MediaKind, PassiveEngine, ProduceOptions, Producer,
    RecvTransport, SendTransport, SendTransportListener, Transport, TransportDirection,
    TransportListener, TransportState,
};
pub use error::{Error, ErrorCode, Result};
pub use store::{
    ConnectionState, ConsumerState, MeInfo, Notify, NotifyLevel, PeerState, ProducerState,
    RoomEvent, RoomInfo, RoomSnapshot, RoomStore,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
