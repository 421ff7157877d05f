//! Signaling wire protocol (protoo-compatible JSON frames)
//!
//! Every frame is one of three kinds, told apart by a boolean marker field:
//!
//! ```text
//! {"request":true,"id":1,"method":"join","data":{...}}
//! {"response":true,"id":1,"ok":true,"data":{...}}
//! {"response":true,"id":1,"ok":false,"errorCode":500,"errorReason":"..."}
//! {"notification":true,"method":"newPeer","data":{...}}
//! ```
//!
//! Frames are decoded once into [`Message`] and routed by variant.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id of a request
pub type RequestId = u64;

/// Signaling method names
pub mod methods {
    /// Ask the router for its RTP capabilities
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    /// Join the room
    pub const JOIN: &str = "join";
    /// Create a server-side WebRTC transport
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    /// Send local DTLS parameters for a transport
    pub const CONNECT_WEBRTC_TRANSPORT: &str = "connectWebRtcTransport";
    /// Register a producer on the send transport
    pub const PRODUCE: &str = "produce";
    /// Close a server-side producer
    pub const CLOSE_PRODUCER: &str = "closeProducer";
    /// Pause a server-side producer
    pub const PAUSE_PRODUCER: &str = "pauseProducer";
    /// Resume a server-side producer
    pub const RESUME_PRODUCER: &str = "resumeProducer";
    /// Change the local display name
    pub const CHANGE_DISPLAY_NAME: &str = "changeDisplayName";
    /// Restart ICE on a transport
    pub const RESTART_ICE: &str = "restartIce";

    /// Server request: a new consumer is available
    pub const NEW_CONSUMER: &str = "newConsumer";
    /// Server request: a new data consumer is available
    pub const NEW_DATA_CONSUMER: &str = "newDataConsumer";

    /// Notification: producer score update
    pub const PRODUCER_SCORE: &str = "producerScore";
    /// Notification: a peer joined
    pub const NEW_PEER: &str = "newPeer";
    /// Notification: a peer left
    pub const PEER_CLOSED: &str = "peerClosed";
    /// Notification: a peer changed its display name
    pub const PEER_DISPLAY_NAME_CHANGED: &str = "peerDisplayNameChanged";
    /// Notification: a consumer was closed server-side
    pub const CONSUMER_CLOSED: &str = "consumerClosed";
    /// Notification: the producer behind a consumer was paused
    pub const CONSUMER_PAUSED: &str = "consumerPaused";
    /// Notification: the producer behind a consumer was resumed
    pub const CONSUMER_RESUMED: &str = "consumerResumed";
    /// Notification: consumer spatial/temporal layers changed
    pub const CONSUMER_LAYERS_CHANGED: &str = "consumerLayersChanged";
    /// Notification: consumer score update
    pub const CONSUMER_SCORE: &str = "consumerScore";
    /// Notification: a data consumer was closed
    pub const DATA_CONSUMER_CLOSED: &str = "dataConsumerClosed";
    /// Notification: active speaker changed
    pub const ACTIVE_SPEAKER: &str = "activeSpeaker";
    /// Notification: downlink bandwidth estimation
    pub const DOWNLINK_BWE: &str = "downlinkBwe";
}

/// A decoded signaling frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request expecting a correlated response
    Request(Request),
    /// Response to an earlier request
    Response(Response),
    /// Fire-and-forget notification
    Notification(Notification),
}

/// Request frame
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Request payload
    pub data: Value,
}

/// Response frame
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id of the request being answered
    pub id: RequestId,
    /// Payload on success, error details otherwise
    pub result: std::result::Result<Value, ErrorBody>,
}

/// Error details of a failed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    /// Numeric error code
    pub code: i64,
    /// Human readable reason
    pub reason: String,
}

/// Notification frame
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name
    pub method: String,
    /// Notification payload
    pub data: Value,
}

/// Flat on-the-wire shape shared by all frame kinds
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default, skip_serializing_if = "is_false")]
    request: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    response: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    notification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Message {
    /// Build a request frame
    pub fn request(id: RequestId, method: impl Into<String>, data: Value) -> Self {
        Message::Request(Request {
            id,
            method: method.into(),
            data,
        })
    }

    /// Build a success response frame
    pub fn success(id: RequestId, data: Value) -> Self {
        Message::Response(Response {
            id,
            result: Ok(data),
        })
    }

    /// Build an error response frame
    pub fn error(id: RequestId, code: i64, reason: impl Into<String>) -> Self {
        Message::Response(Response {
            id,
            result: Err(ErrorBody {
                code,
                reason: reason.into(),
            }),
        })
    }

    /// Build a notification frame
    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            data,
        })
    }

    /// Decode a text frame
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;

        if raw.request {
            let id = raw
                .id
                .ok_or_else(|| Error::protocol("request without id"))?;
            let method = raw
                .method
                .ok_or_else(|| Error::protocol("request without method"))?;
            return Ok(Message::Request(Request {
                id,
                method,
                data: raw.data.unwrap_or_else(empty_object),
            }));
        }

        if raw.response {
            let id = raw
                .id
                .ok_or_else(|| Error::protocol("response without id"))?;
            let result = if raw.ok.unwrap_or(false) {
                Ok(raw.data.unwrap_or_else(empty_object))
            } else {
                Err(ErrorBody {
                    code: raw.error_code.unwrap_or(500),
                    reason: raw.error_reason.unwrap_or_default(),
                })
            };
            return Ok(Message::Response(Response { id, result }));
        }

        if raw.notification {
            let method = raw
                .method
                .ok_or_else(|| Error::protocol("notification without method"))?;
            return Ok(Message::Notification(Notification {
                method,
                data: raw.data.unwrap_or_else(empty_object),
            }));
        }

        Err(Error::protocol(
            "frame is neither request, response nor notification",
        ))
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> Result<String> {
        let raw = match self {
            Message::Request(req) => RawMessage {
                request: true,
                id: Some(req.id),
                method: Some(req.method.clone()),
                data: Some(req.data.clone()),
                ..Default::default()
            },
            Message::Response(res) => match &res.result {
                Ok(data) => RawMessage {
                    response: true,
                    id: Some(res.id),
                    ok: Some(true),
                    data: Some(data.clone()),
                    ..Default::default()
                },
                Err(err) => RawMessage {
                    response: true,
                    id: Some(res.id),
                    ok: Some(false),
                    error_code: Some(err.code),
                    error_reason: Some(err.reason.clone()),
                    ..Default::default()
                },
            },
            Message::Notification(n) => RawMessage {
                notification: true,
                method: Some(n.method.clone()),
                data: Some(n.data.clone()),
                ..Default::default()
            },
        };

        Ok(serde_json::to_string(&raw)?)
    }

    /// Kind of frame, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
        }
    }
}

/// `join` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Local display name
    pub display_name: String,
    /// Device descriptor
    pub device: Value,
    /// Local RTP capabilities from the loaded device
    pub rtp_capabilities: Value,
    /// Local SCTP capabilities (null while data channels are unsupported)
    pub sctp_capabilities: Value,
}

/// `join` response payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Peers already in the room
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

/// Remote peer description, as found in `join` responses and `newPeer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Device descriptor
    #[serde(default)]
    pub device: Option<Value>,
}

/// `createWebRtcTransport` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    /// Only TCP ICE candidates
    pub force_tcp: bool,
    /// Transport is used for sending
    pub producing: bool,
    /// Transport is used for receiving
    pub consuming: bool,
    /// Local SCTP capabilities
    pub sctp_capabilities: Value,
}

/// `createWebRtcTransport` response: server-side transport parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    /// Server transport id
    pub id: String,
    /// ICE parameters
    pub ice_parameters: Value,
    /// ICE candidates
    pub ice_candidates: Value,
    /// DTLS parameters
    pub dtls_parameters: Value,
    /// SCTP parameters, when data channels are negotiated
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

/// `connectWebRtcTransport` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    /// Server transport id
    pub transport_id: String,
    /// Local DTLS parameters
    pub dtls_parameters: Value,
}

/// `produce` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    /// Server transport id
    pub transport_id: String,
    /// Media kind
    pub kind: String,
    /// RTP parameters chosen by the engine
    pub rtp_parameters: Value,
    /// Application data
    pub app_data: Value,
}

/// `produce` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceResponse {
    /// Server-assigned producer id
    pub id: String,
}

/// Payload of `closeProducer`, `pauseProducer` and `resumeProducer`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerIdRequest {
    /// Producer id
    pub producer_id: String,
}

/// `changeDisplayName` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDisplayNameRequest {
    /// New display name
    pub display_name: String,
}

/// `restartIce` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartIceRequest {
    /// Server transport id
    pub transport_id: String,
}

/// `restartIce` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartIceResponse {
    /// Fresh ICE parameters
    pub ice_parameters: Value,
}

/// Serialize a payload struct into a JSON value
pub fn to_data<T: Serialize>(payload: &T) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

/// Deserialize a JSON payload into a typed struct
pub fn from_data<T: serde::de::DeserializeOwned>(method: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| Error::protocol(format!("invalid '{}' payload: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parsing() {
        let text = r#"{"request":true,"id":42,"method":"newConsumer","data":{"id":"c1"}}"#;
        match Message::from_json(text).unwrap() {
            Message::Request(req) => {
                assert_eq!(req.id, 42);
                assert_eq!(req.method, "newConsumer");
                assert_eq!(req.data["id"], "c1");
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_error_response_parsing() {
        let text = r#"{"response":true,"id":7,"ok":false,"errorCode":403,"errorReason":"denied"}"#;
        let msg = Message::from_json(text).unwrap();
        assert_eq!(
            msg,
            Message::Response(Response {
                id: 7,
                result: Err(ErrorBody {
                    code: 403,
                    reason: "denied".to_string()
                })
            })
        );
    }

    #[test]
    fn test_success_response_without_data() {
        let text = r#"{"response":true,"id":3,"ok":true}"#;
        match Message::from_json(text).unwrap() {
            Message::Response(res) => assert_eq!(res.result, Ok(json!({}))),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_notification_encoding() {
        let msg = Message::notification("peerClosed", json!({"peerId": "p2"}));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"notification": true, "method": "peerClosed", "data": {"peerId": "p2"}})
        );
    }

    #[test]
    fn test_error_response_encoding() {
        let msg = Message::error(9, 404, "unknown method");
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"response": true, "id": 9, "ok": false, "errorCode": 404, "errorReason": "unknown method"})
        );
    }

    #[test]
    fn test_unclassified_frame_is_protocol_error() {
        let err = Message::from_json(r#"{"id":1,"method":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_request_without_id_is_protocol_error() {
        let err = Message::from_json(r#"{"request":true,"method":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_join_request_shape() {
        let req = JoinRequest {
            display_name: "alice".to_string(),
            device: json!({"flag": "rust"}),
            rtp_capabilities: json!({"codecs": []}),
            sctp_capabilities: Value::Null,
        };
        let value = to_data(&req).unwrap();
        assert_eq!(value["displayName"], "alice");
        assert_eq!(value["rtpCapabilities"], json!({"codecs": []}));
        assert!(value.get("sctpCapabilities").is_some());
    }

    #[test]
    fn test_transport_info_parsing() {
        let info: TransportInfo = from_data(
            "createWebRtcTransport",
            json!({
                "id": "t1",
                "iceParameters": {"usernameFragment": "u"},
                "iceCandidates": [],
                "dtlsParameters": {"role": "auto"}
            }),
        )
        .unwrap();
        assert_eq!(info.id, "t1");
        assert_eq!(info.sctp_parameters, None);
    }

    #[test]
    fn test_join_response_peers_default_empty() {
        let res: JoinResponse = from_data("join", json!({})).unwrap();
        assert!(res.peers.is_empty());
    }
}
