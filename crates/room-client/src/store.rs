//! Observable room state
//!
//! [`RoomStore`] holds the local mirror of the room. Only the room worker
//! writes to it; observers read whole [`RoomSnapshot`] clones and subscribe to
//! [`RoomEvent`]s. Every mutation happens under one write lock, so a snapshot
//! never shows a half-applied change.

use crate::config::DeviceInfo;
use crate::engine::{MediaKind, TransportDirection, TransportState};
use crate::signaling::protocol::PeerInfo;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Capacity of the event broadcast; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 256;

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `join()` not called yet
    New,
    /// Connecting or reconnecting
    Connecting,
    /// Joined
    Connected,
    /// Closed (terminal until the next `join()`)
    Closed,
}

/// Room-level information
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    /// Room id
    pub room_id: String,
    /// Signaling URL
    pub url: String,
    /// Link other participants can open
    pub invitation_link: String,
    /// Session state
    pub state: ConnectionState,
    /// Peer currently speaking, if any
    pub active_speaker_id: Option<String>,
}

/// The local participant
#[derive(Debug, Clone, PartialEq)]
pub struct MeInfo {
    /// Local peer id
    pub peer_id: String,
    /// Local display name
    pub display_name: String,
    /// Device descriptor sent on join
    pub device: DeviceInfo,
    /// Microphone can be produced
    pub can_send_mic: bool,
    /// Camera can be produced
    pub can_send_cam: bool,
    /// A camera switch is running
    pub cam_in_progress: bool,
}

/// A remote peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerState {
    /// Peer id
    pub id: String,
    /// Display name
    pub display_name: Option<String>,
    /// Device descriptor
    pub device: Option<Value>,
    /// Producer ids exposed by this peer (learned from consumers)
    pub producer_ids: BTreeSet<String>,
    /// Local consumers of this peer's media
    pub consumer_ids: BTreeSet<String>,
}

impl From<PeerInfo> for PeerState {
    fn from(info: PeerInfo) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            device: info.device,
            producer_ids: BTreeSet::new(),
            consumer_ids: BTreeSet::new(),
        }
    }
}

/// A local producer, mirrored read-only
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerState {
    /// Server-assigned id
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Locally paused
    pub paused: bool,
    /// Send transport id
    pub transport_id: String,
    /// Last score reported by the server
    pub score: Option<Value>,
}

/// A local consumer, mirrored read-only
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerState {
    /// Server-assigned id
    pub id: String,
    /// Owning remote peer
    pub peer_id: String,
    /// Remote producer id
    pub producer_id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Consumer type (`simple`, `simulcast`, `svc`)
    pub consumer_type: Option<String>,
    /// Paused on our side
    pub locally_paused: bool,
    /// Remote producer paused
    pub remotely_paused: bool,
    /// Current spatial layer
    pub spatial_layer: Option<i64>,
    /// Current temporal layer
    pub temporal_layer: Option<i64>,
    /// Last score reported by the server
    pub score: Option<Value>,
}

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    /// Informational
    Info,
    /// Error
    Error,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq)]
pub struct Notify {
    /// Notification id
    pub id: String,
    /// Severity
    pub level: NotifyLevel,
    /// Text
    pub text: String,
    /// How long a UI should show it
    pub timeout: Option<Duration>,
}

/// Consistent copy of the whole room state
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    /// Room info
    pub room: RoomInfo,
    /// Local participant
    pub me: MeInfo,
    /// Remote peers by id
    pub peers: BTreeMap<String, PeerState>,
    /// Local producers by id
    pub producers: BTreeMap<String, ProducerState>,
    /// Local consumers by id
    pub consumers: BTreeMap<String, ConsumerState>,
    /// Transport states by direction
    pub transports: BTreeMap<TransportDirection, TransportState>,
}

impl RoomSnapshot {
    /// Producer of the given kind, if any
    pub fn producer_of_kind(&self, kind: MediaKind) -> Option<&ProducerState> {
        self.producers.values().find(|p| p.kind == kind)
    }
}

/// Change notifications pushed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Session state changed
    StateChanged(ConnectionState),
    /// User-facing notification
    Notify(Notify),
    /// Room info changed (URL, active speaker)
    RoomInfoChanged,
    /// Local participant changed
    MeChanged,
    /// Peer joined
    PeerAdded(String),
    /// Peer left
    PeerRemoved(String),
    /// Peer attributes changed
    PeerUpdated(String),
    /// Producer registered
    ProducerAdded(String),
    /// Producer removed
    ProducerRemoved(String),
    /// Producer attributes changed
    ProducerUpdated(String),
    /// Consumer created
    ConsumerAdded(String),
    /// Consumer removed
    ConsumerRemoved(String),
    /// Consumer attributes changed
    ConsumerUpdated(String),
    /// Transport state changed (`Closed` when discarded)
    TransportChanged(TransportDirection, TransportState),
}

/// Who paused a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    /// This client
    Local,
    /// The remote producer
    Remote,
}

/// Room state container
pub struct RoomStore {
    state: RwLock<RoomSnapshot>,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomStore {
    /// Create an empty store for the given participant
    pub fn new(room_id: &str, peer_id: &str, display_name: &str, device: DeviceInfo) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            state: RwLock::new(RoomSnapshot {
                room: RoomInfo {
                    room_id: room_id.to_string(),
                    url: String::new(),
                    invitation_link: String::new(),
                    state: ConnectionState::New,
                    active_speaker_id: None,
                },
                me: MeInfo {
                    peer_id: peer_id.to_string(),
                    display_name: display_name.to_string(),
                    device,
                    can_send_mic: false,
                    can_send_cam: false,
                    cam_in_progress: false,
                },
                peers: BTreeMap::new(),
                producers: BTreeMap::new(),
                consumers: BTreeMap::new(),
                transports: BTreeMap::new(),
            }),
            events,
        }
    }

    /// Subscribe to room events
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> RoomSnapshot {
        self.state.read().clone()
    }

    /// Current session state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().room.state
    }

    /// Ids of the remote peers
    pub fn peer_ids(&self) -> Vec<String> {
        self.state.read().peers.keys().cloned().collect()
    }

    /// One-line human readable room summary
    pub fn room_info_text(&self) -> String {
        let state = self.state.read();
        format!(
            "room {} | {:?} | {} peer(s) | {} producer(s) | {} consumer(s) | {}",
            state.room.room_id,
            state.room.state,
            state.peers.len(),
            state.producers.len(),
            state.consumers.len(),
            state.room.invitation_link
        )
    }

    fn emit(&self, event: RoomEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn set_room_url(&self, url: &str, invitation_link: &str) {
        {
            let mut state = self.state.write();
            state.room.url = url.to_string();
            state.room.invitation_link = invitation_link.to_string();
        }
        self.emit(RoomEvent::RoomInfoChanged);
    }

    pub(crate) fn set_room_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.write();
            if state.room.state == new_state {
                return;
            }
            debug!(
                "Room state transition: {:?} -> {:?}",
                state.room.state, new_state
            );
            state.room.state = new_state;
        }
        self.emit(RoomEvent::StateChanged(new_state));
    }

    pub(crate) fn add_notify(&self, level: NotifyLevel, text: impl Into<String>) {
        self.add_notify_with_timeout(level, text, None);
    }

    pub(crate) fn add_notify_with_timeout(
        &self,
        level: NotifyLevel,
        text: impl Into<String>,
        timeout: Option<Duration>,
    ) {
        let text = text.into();
        match level {
            NotifyLevel::Info => info!("Notify: {}", text),
            NotifyLevel::Error => error!("Notify: {}", text),
        }

        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        self.emit(RoomEvent::Notify(Notify {
            id,
            level,
            text,
            timeout,
        }));
    }

    pub(crate) fn set_display_name(&self, display_name: &str) {
        self.state.write().me.display_name = display_name.to_string();
        self.emit(RoomEvent::MeChanged);
    }

    pub(crate) fn set_media_capabilities(&self, can_send_mic: bool, can_send_cam: bool) {
        {
            let mut state = self.state.write();
            state.me.can_send_mic = can_send_mic;
            state.me.can_send_cam = can_send_cam;
        }
        self.emit(RoomEvent::MeChanged);
    }

    pub(crate) fn set_cam_in_progress(&self, in_progress: bool) {
        self.state.write().me.cam_in_progress = in_progress;
        self.emit(RoomEvent::MeChanged);
    }

    pub(crate) fn set_active_speaker(&self, peer_id: Option<String>) {
        {
            let mut state = self.state.write();
            if state.room.active_speaker_id == peer_id {
                return;
            }
            state.room.active_speaker_id = peer_id;
        }
        self.emit(RoomEvent::RoomInfoChanged);
    }

    /// Replace the peer list with the one from a `join` response
    pub(crate) fn replace_peers(&self, peers: Vec<PeerInfo>) {
        let (removed, added) = {
            let mut state = self.state.write();
            let removed: Vec<String> = state.peers.keys().cloned().collect();
            state.peers.clear();
            let mut added = Vec::with_capacity(peers.len());
            for peer in peers {
                added.push(peer.id.clone());
                state.peers.insert(peer.id.clone(), PeerState::from(peer));
            }
            (removed, added)
        };

        for id in removed {
            self.emit(RoomEvent::PeerRemoved(id));
        }
        for id in added {
            self.emit(RoomEvent::PeerAdded(id));
        }
    }

    pub(crate) fn add_peer(&self, peer: PeerInfo) {
        let id = peer.id.clone();
        let replaced = self
            .state
            .write()
            .peers
            .insert(id.clone(), PeerState::from(peer))
            .is_some();
        if replaced {
            self.emit(RoomEvent::PeerUpdated(id));
        } else {
            self.emit(RoomEvent::PeerAdded(id));
        }
    }

    /// Remove a peer and the consumers bound to it; returns those consumer ids
    pub(crate) fn remove_peer(&self, peer_id: &str) -> Option<Vec<String>> {
        let consumer_ids: Vec<String> = {
            let mut state = self.state.write();
            let peer = state.peers.remove(peer_id)?;
            let mut ids: BTreeSet<String> = peer.consumer_ids;
            // Consumers created before the peer was (re)listed
            let orphans: Vec<String> = state
                .consumers
                .values()
                .filter(|c| c.peer_id == peer_id)
                .map(|c| c.id.clone())
                .collect();
            ids.extend(orphans);
            let ids: Vec<String> = ids.into_iter().collect();
            for id in &ids {
                state.consumers.remove(id);
            }
            ids
        };

        for id in &consumer_ids {
            self.emit(RoomEvent::ConsumerRemoved(id.clone()));
        }
        self.emit(RoomEvent::PeerRemoved(peer_id.to_string()));
        Some(consumer_ids)
    }

    pub(crate) fn set_peer_display_name(&self, peer_id: &str, display_name: &str) -> bool {
        {
            let mut state = self.state.write();
            match state.peers.get_mut(peer_id) {
                Some(peer) => peer.display_name = Some(display_name.to_string()),
                None => return false,
            }
        }
        self.emit(RoomEvent::PeerUpdated(peer_id.to_string()));
        true
    }

    pub(crate) fn clear_peers(&self) {
        let removed: Vec<String> = {
            let mut state = self.state.write();
            let ids = state.peers.keys().cloned().collect();
            state.peers.clear();
            state.room.active_speaker_id = None;
            ids
        };
        for id in removed {
            self.emit(RoomEvent::PeerRemoved(id));
        }
    }

    pub(crate) fn add_producer(&self, producer: ProducerState) {
        let id = producer.id.clone();
        self.state.write().producers.insert(id.clone(), producer);
        self.emit(RoomEvent::ProducerAdded(id));
    }

    pub(crate) fn remove_producer(&self, producer_id: &str) -> bool {
        let removed = self.state.write().producers.remove(producer_id).is_some();
        if removed {
            self.emit(RoomEvent::ProducerRemoved(producer_id.to_string()));
        }
        removed
    }

    pub(crate) fn set_producer_paused(&self, producer_id: &str, paused: bool) {
        self.update_producer(producer_id, |p| p.paused = paused);
    }

    pub(crate) fn set_producer_score(&self, producer_id: &str, score: Value) {
        self.update_producer(producer_id, |p| p.score = Some(score));
    }

    fn update_producer<F: FnOnce(&mut ProducerState)>(&self, producer_id: &str, f: F) -> bool {
        {
            let mut state = self.state.write();
            match state.producers.get_mut(producer_id) {
                Some(producer) => f(producer),
                None => return false,
            }
        }
        self.emit(RoomEvent::ProducerUpdated(producer_id.to_string()));
        true
    }

    pub(crate) fn add_consumer(&self, consumer: ConsumerState) {
        let id = consumer.id.clone();
        let peer_updated = {
            let mut state = self.state.write();
            let peer_updated = match state.peers.get_mut(&consumer.peer_id) {
                Some(peer) => {
                    peer.consumer_ids.insert(consumer.id.clone());
                    peer.producer_ids.insert(consumer.producer_id.clone());
                    Some(peer.id.clone())
                }
                None => None,
            };
            state.consumers.insert(id.clone(), consumer);
            peer_updated
        };

        self.emit(RoomEvent::ConsumerAdded(id));
        if let Some(peer_id) = peer_updated {
            self.emit(RoomEvent::PeerUpdated(peer_id));
        }
    }

    pub(crate) fn remove_consumer(&self, consumer_id: &str) -> bool {
        let peer_updated = {
            let mut state = self.state.write();
            let consumer = match state.consumers.remove(consumer_id) {
                Some(consumer) => consumer,
                None => return false,
            };
            match state.peers.get_mut(&consumer.peer_id) {
                Some(peer) => {
                    peer.consumer_ids.remove(consumer_id);
                    peer.producer_ids.remove(&consumer.producer_id);
                    Some(peer.id.clone())
                }
                None => None,
            }
        };

        self.emit(RoomEvent::ConsumerRemoved(consumer_id.to_string()));
        if let Some(peer_id) = peer_updated {
            self.emit(RoomEvent::PeerUpdated(peer_id));
        }
        true
    }

    pub(crate) fn set_consumer_paused(&self, consumer_id: &str, originator: Originator, paused: bool) {
        self.update_consumer(consumer_id, |c| match originator {
            Originator::Local => c.locally_paused = paused,
            Originator::Remote => c.remotely_paused = paused,
        });
    }

    pub(crate) fn set_consumer_layers(
        &self,
        consumer_id: &str,
        spatial_layer: Option<i64>,
        temporal_layer: Option<i64>,
    ) {
        self.update_consumer(consumer_id, |c| {
            c.spatial_layer = spatial_layer;
            c.temporal_layer = temporal_layer;
        });
    }

    pub(crate) fn set_consumer_score(&self, consumer_id: &str, score: Value) {
        self.update_consumer(consumer_id, |c| c.score = Some(score));
    }

    fn update_consumer<F: FnOnce(&mut ConsumerState)>(&self, consumer_id: &str, f: F) -> bool {
        {
            let mut state = self.state.write();
            match state.consumers.get_mut(consumer_id) {
                Some(consumer) => f(consumer),
                None => return false,
            }
        }
        self.emit(RoomEvent::ConsumerUpdated(consumer_id.to_string()));
        true
    }

    pub(crate) fn set_transport_state(&self, direction: TransportDirection, transport_state: TransportState) {
        {
            let mut state = self.state.write();
            if state.transports.get(&direction) == Some(&transport_state) {
                return;
            }
            state.transports.insert(direction, transport_state);
        }
        self.emit(RoomEvent::TransportChanged(direction, transport_state));
    }

    pub(crate) fn remove_transport(&self, direction: TransportDirection) {
        let removed = self.state.write().transports.remove(&direction).is_some();
        if removed {
            self.emit(RoomEvent::TransportChanged(direction, TransportState::Closed));
        }
    }
}
