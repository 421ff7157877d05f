//! Server notification and server request routing
//!
//! Inbound notifications and requests are decoded once into typed values and
//! applied to the [`RoomStore`] and the consumer map. Runs on the room worker.

use crate::engine::{Consumer, ConsumerInfo, RecvTransport};
use crate::signaling::channel::ServerRequest;
use crate::signaling::protocol::{from_data, methods, Notification, PeerInfo};
use crate::store::{ConsumerState, Originator, RoomStore};
use crate::Result;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error code sent when a server request cannot be served
pub const FORBIDDEN: i64 = 403;

/// Error code sent for unknown server request methods
pub const NOT_FOUND: i64 = 404;

/// Error code sent when the engine fails to build a consumer
pub const INTERNAL_ERROR: i64 = 500;

/// Consumers by id, shared with observers
pub type ConsumerMap = DashMap<String, Arc<dyn Consumer>>;

/// Typed server notification
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    /// A peer joined
    NewPeer(PeerInfo),
    /// A peer left
    PeerClosed {
        /// Peer id
        peer_id: String,
    },
    /// A peer renamed itself
    PeerDisplayNameChanged {
        /// Peer id
        peer_id: String,
        /// New name
        display_name: String,
        /// Previous name
        old_display_name: Option<String>,
    },
    /// Consumer closed server-side
    ConsumerClosed {
        /// Consumer id
        consumer_id: String,
    },
    /// Remote producer paused
    ConsumerPaused {
        /// Consumer id
        consumer_id: String,
    },
    /// Remote producer resumed
    ConsumerResumed {
        /// Consumer id
        consumer_id: String,
    },
    /// Current layers changed
    ConsumerLayersChanged {
        /// Consumer id
        consumer_id: String,
        /// Spatial layer, `None` when no layer is being forwarded
        spatial_layer: Option<i64>,
        /// Temporal layer
        temporal_layer: Option<i64>,
    },
    /// Consumer score
    ConsumerScore {
        /// Consumer id
        consumer_id: String,
        /// Score object
        score: Value,
    },
    /// Producer score
    ProducerScore {
        /// Producer id
        producer_id: String,
        /// Score list
        score: Value,
    },
    /// Active speaker changed (`None` when nobody speaks)
    ActiveSpeaker {
        /// Speaking peer
        peer_id: Option<String>,
        /// Volume in dBov
        volume: Option<f64>,
    },
    /// Data consumer closed
    DataConsumerClosed {
        /// Data consumer id
        data_consumer_id: String,
    },
    /// Downlink bandwidth estimation
    DownlinkBwe(Value),
    /// Method this client does not know
    Unknown {
        /// Method name
        method: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerIdData {
    peer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplayNameData {
    peer_id: String,
    display_name: String,
    #[serde(default)]
    old_display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerIdData {
    consumer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayersData {
    consumer_id: String,
    #[serde(default)]
    spatial_layer: Option<i64>,
    #[serde(default)]
    temporal_layer: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerScoreData {
    consumer_id: String,
    score: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerScoreData {
    producer_id: String,
    score: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveSpeakerData {
    #[serde(default)]
    peer_id: Option<String>,
    #[serde(default)]
    volume: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataConsumerIdData {
    data_consumer_id: String,
}

impl ServerNotification {
    /// Decode a notification frame
    ///
    /// Unknown methods decode to [`ServerNotification::Unknown`]; a known
    /// method with a malformed payload is a protocol error.
    pub fn decode(notification: &Notification) -> Result<Self> {
        let method = notification.method.as_str();
        let data = notification.data.clone();

        let decoded = match method {
            methods::NEW_PEER => ServerNotification::NewPeer(from_data(method, data)?),
            methods::PEER_CLOSED => {
                let d: PeerIdData = from_data(method, data)?;
                ServerNotification::PeerClosed { peer_id: d.peer_id }
            }
            methods::PEER_DISPLAY_NAME_CHANGED => {
                let d: DisplayNameData = from_data(method, data)?;
                ServerNotification::PeerDisplayNameChanged {
                    peer_id: d.peer_id,
                    display_name: d.display_name,
                    old_display_name: d.old_display_name,
                }
            }
            methods::CONSUMER_CLOSED => {
                let d: ConsumerIdData = from_data(method, data)?;
                ServerNotification::ConsumerClosed {
                    consumer_id: d.consumer_id,
                }
            }
            methods::CONSUMER_PAUSED => {
                let d: ConsumerIdData = from_data(method, data)?;
                ServerNotification::ConsumerPaused {
                    consumer_id: d.consumer_id,
                }
            }
            methods::CONSUMER_RESUMED => {
                let d: ConsumerIdData = from_data(method, data)?;
                ServerNotification::ConsumerResumed {
                    consumer_id: d.consumer_id,
                }
            }
            methods::CONSUMER_LAYERS_CHANGED => {
                let d: LayersData = from_data(method, data)?;
                ServerNotification::ConsumerLayersChanged {
                    consumer_id: d.consumer_id,
                    spatial_layer: d.spatial_layer,
                    temporal_layer: d.temporal_layer,
                }
            }
            methods::CONSUMER_SCORE => {
                let d: ConsumerScoreData = from_data(method, data)?;
                ServerNotification::ConsumerScore {
                    consumer_id: d.consumer_id,
                    score: d.score,
                }
            }
            methods::PRODUCER_SCORE => {
                let d: ProducerScoreData = from_data(method, data)?;
                ServerNotification::ProducerScore {
                    producer_id: d.producer_id,
                    score: d.score,
                }
            }
            methods::ACTIVE_SPEAKER => {
                let d: ActiveSpeakerData = from_data(method, data)?;
                ServerNotification::ActiveSpeaker {
                    peer_id: d.peer_id,
                    volume: d.volume,
                }
            }
            methods::DATA_CONSUMER_CLOSED => {
                let d: DataConsumerIdData = from_data(method, data)?;
                ServerNotification::DataConsumerClosed {
                    data_consumer_id: d.data_consumer_id,
                }
            }
            methods::DOWNLINK_BWE => ServerNotification::DownlinkBwe(data),
            other => ServerNotification::Unknown {
                method: other.to_string(),
            },
        };

        Ok(decoded)
    }

    /// Method name, for logging
    pub fn name(&self) -> &str {
        match self {
            ServerNotification::NewPeer(_) => methods::NEW_PEER,
            ServerNotification::PeerClosed { .. } => methods::PEER_CLOSED,
            ServerNotification::PeerDisplayNameChanged { .. } => methods::PEER_DISPLAY_NAME_CHANGED,
            ServerNotification::ConsumerClosed { .. } => methods::CONSUMER_CLOSED,
            ServerNotification::ConsumerPaused { .. } => methods::CONSUMER_PAUSED,
            ServerNotification::ConsumerResumed { .. } => methods::CONSUMER_RESUMED,
            ServerNotification::ConsumerLayersChanged { .. } => methods::CONSUMER_LAYERS_CHANGED,
            ServerNotification::ConsumerScore { .. } => methods::CONSUMER_SCORE,
            ServerNotification::ProducerScore { .. } => methods::PRODUCER_SCORE,
            ServerNotification::ActiveSpeaker { .. } => methods::ACTIVE_SPEAKER,
            ServerNotification::DataConsumerClosed { .. } => methods::DATA_CONSUMER_CLOSED,
            ServerNotification::DownlinkBwe(_) => methods::DOWNLINK_BWE,
            ServerNotification::Unknown { method } => method,
        }
    }
}

/// Typed server request
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingRequest {
    /// A remote producer can be consumed
    NewConsumer(ConsumerInfo),
    /// A remote data producer can be consumed
    NewDataConsumer(Value),
    /// Method this client does not know
    Unknown(String),
}

impl IncomingRequest {
    /// Decode a server request
    pub fn decode(method: &str, data: &Value) -> Result<Self> {
        match method {
            methods::NEW_CONSUMER => Ok(IncomingRequest::NewConsumer(from_data(
                method,
                data.clone(),
            )?)),
            methods::NEW_DATA_CONSUMER => Ok(IncomingRequest::NewDataConsumer(data.clone())),
            other => Ok(IncomingRequest::Unknown(other.to_string())),
        }
    }
}

/// Applies server-pushed events to room state
pub struct NotificationRouter {
    store: Arc<RoomStore>,
    consumers: Arc<ConsumerMap>,
}

impl NotificationRouter {
    /// Create a router writing to `store` and `consumers`
    pub fn new(store: Arc<RoomStore>, consumers: Arc<ConsumerMap>) -> Self {
        Self { store, consumers }
    }

    /// Decode and apply a notification; failures are logged, never raised
    pub fn handle_notification(&self, notification: &Notification) {
        match ServerNotification::decode(notification) {
            Ok(decoded) => self.apply(decoded),
            Err(e) => warn!(
                method = %notification.method,
                error = %e,
                "Ignoring malformed notification"
            ),
        }
    }

    /// Apply a decoded notification
    pub fn apply(&self, notification: ServerNotification) {
        debug!(method = notification.name(), "Applying notification");

        match notification {
            ServerNotification::NewPeer(peer) => {
                info!(peer_id = %peer.id, "Peer joined");
                self.store.add_peer(peer);
            }
            ServerNotification::PeerClosed { peer_id } => {
                match self.store.remove_peer(&peer_id) {
                    Some(consumer_ids) => {
                        info!(peer_id = %peer_id, consumers = consumer_ids.len(), "Peer left");
                        for id in consumer_ids {
                            self.release_consumer(&id);
                        }
                    }
                    None => {
                        // Consumers may arrive for a peer we never listed
                        let orphans: Vec<String> = self
                            .store
                            .snapshot()
                            .consumers
                            .values()
                            .filter(|c| c.peer_id == peer_id)
                            .map(|c| c.id.clone())
                            .collect();
                        debug!(
                            peer_id = %peer_id,
                            consumers = orphans.len(),
                            "peerClosed for unlisted peer"
                        );
                        for id in orphans {
                            self.close_consumer(&id);
                        }
                    }
                }
            }
            ServerNotification::PeerDisplayNameChanged {
                peer_id,
                display_name,
                old_display_name,
            } => {
                if self.store.set_peer_display_name(&peer_id, &display_name) {
                    self.store.add_notify(
                        crate::store::NotifyLevel::Info,
                        format!(
                            "{} is now {}",
                            old_display_name.as_deref().unwrap_or(&peer_id),
                            display_name
                        ),
                    );
                }
            }
            ServerNotification::ConsumerClosed { consumer_id } => {
                if !self.close_consumer(&consumer_id) {
                    debug!(consumer_id = %consumer_id, "consumerClosed for unknown consumer");
                }
            }
            ServerNotification::ConsumerPaused { consumer_id } => {
                self.store
                    .set_consumer_paused(&consumer_id, Originator::Remote, true);
            }
            ServerNotification::ConsumerResumed { consumer_id } => {
                self.store
                    .set_consumer_paused(&consumer_id, Originator::Remote, false);
            }
            ServerNotification::ConsumerLayersChanged {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                self.store
                    .set_consumer_layers(&consumer_id, spatial_layer, temporal_layer);
            }
            ServerNotification::ConsumerScore { consumer_id, score } => {
                self.store.set_consumer_score(&consumer_id, score);
            }
            ServerNotification::ProducerScore { producer_id, score } => {
                self.store.set_producer_score(&producer_id, score);
            }
            ServerNotification::ActiveSpeaker { peer_id, volume } => {
                debug!(peer_id = ?peer_id, volume = ?volume, "Active speaker");
                self.store.set_active_speaker(peer_id);
            }
            ServerNotification::DataConsumerClosed { data_consumer_id } => {
                debug!(data_consumer_id = %data_consumer_id, "Data consumer closed");
            }
            ServerNotification::DownlinkBwe(data) => {
                debug!("Downlink BWE: {}", data);
            }
            ServerNotification::Unknown { method } => {
                warn!(method = %method, "Ignoring unknown notification");
            }
        }
    }

    /// Answer a server request
    ///
    /// `recv_transport` is `None` while no receive transport exists (or
    /// consuming is disabled); consumers are refused then.
    pub fn handle_request(&self, request: ServerRequest, recv_transport: Option<&dyn RecvTransport>) {
        let decoded = IncomingRequest::decode(request.method(), request.data());

        let outcome = match decoded {
            Err(e) => {
                warn!(method = %request.method(), error = %e, "Malformed server request");
                request.reject(INTERNAL_ERROR, e.to_string())
            }
            Ok(IncomingRequest::NewConsumer(info)) => match recv_transport {
                Some(transport) => self.new_consumer(request, transport, info),
                None => {
                    warn!(consumer_id = %info.id, "Refusing consumer, not consuming");
                    request.reject(FORBIDDEN, "I do not want to consume")
                }
            },
            Ok(IncomingRequest::NewDataConsumer(_)) => {
                debug!("Refusing data consumer");
                request.reject(FORBIDDEN, "I do not want to data consume")
            }
            Ok(IncomingRequest::Unknown(method)) => {
                warn!(method = %method, "Unknown server request");
                request.reject(NOT_FOUND, format!("unknown method '{}'", method))
            }
        };

        if let Err(e) = outcome {
            warn!(error = %e, "Could not answer server request");
        }
    }

    fn new_consumer(
        &self,
        request: ServerRequest,
        transport: &dyn RecvTransport,
        info: ConsumerInfo,
    ) -> Result<()> {
        if self.consumers.contains_key(&info.id) {
            warn!(consumer_id = %info.id, "Duplicate newConsumer request");
            return request.reject(INTERNAL_ERROR, "consumer already exists");
        }

        let consumer = match transport.consume(&info) {
            Ok(consumer) => consumer,
            Err(e) => {
                self.store.add_notify(
                    crate::store::NotifyLevel::Error,
                    format!("Error creating a Consumer: {}", e),
                );
                return request.reject(INTERNAL_ERROR, e.to_string());
            }
        };

        info!(
            consumer_id = %info.id,
            peer_id = %info.peer_id,
            kind = %info.kind,
            "New consumer"
        );

        self.consumers.insert(info.id.clone(), consumer);
        self.store.add_consumer(ConsumerState {
            id: info.id,
            peer_id: info.peer_id,
            producer_id: info.producer_id,
            kind: info.kind,
            consumer_type: info.consumer_type,
            locally_paused: false,
            remotely_paused: info.producer_paused,
            spatial_layer: None,
            temporal_layer: None,
            score: None,
        });

        request.accept(Value::Object(Default::default()))
    }

    /// Close and forget one consumer; `false` if it is unknown
    pub fn close_consumer(&self, consumer_id: &str) -> bool {
        let known = self.release_consumer(consumer_id);
        let mirrored = self.store.remove_consumer(consumer_id);
        known || mirrored
    }

    /// Close and forget every consumer
    pub fn close_all_consumers(&self) {
        let ids: Vec<String> = self.consumers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_consumer(&id);
        }
    }

    fn release_consumer(&self, consumer_id: &str) -> bool {
        match self.consumers.remove(consumer_id) {
            Some((_, consumer)) => {
                consumer.close();
                true
            }
            None => false,
        }
    }
}
