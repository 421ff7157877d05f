//! Signaling protocol and channel for talking to the SFU
//!
//! This module implements:
//! - protoo-compatible JSON framing (requests, responses, notifications)
//! - A persistent channel with request/response correlation and reconnects
//! - WebSocket and in-memory connectors

pub mod channel;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelState, Responder, ServerRequest, SignalingChannel,
};
pub use protocol::{Message, Notification, Request, RequestId, Response};
pub use transport::{Connector, FrameTransport, MemoryConnection, MemoryConnector, MemoryListener};
pub use websocket::WebSocketConnector;
