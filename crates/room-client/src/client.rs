//! Room session coordinator
//!
//! [`RoomClient`] is a cheap handle: every public operation only enqueues a
//! command for the room worker, a dedicated OS thread running a
//! current-thread runtime. The worker is the single writer of the session
//! state and of the [`RoomStore`]. Signaling I/O runs on a separate
//! one-thread runtime so responses keep resolving while the worker is busy or
//! blocked in [`SendTransportListener::on_produce`].
//!
//! Multi-step flows (capabilities, join, transport creation) run as worker
//! tasks that post their result back as an event tagged with the session
//! epoch. A disconnect or close bumps the epoch, so results belonging to a
//! previous connection are dropped instead of being applied.

use crate::capture::{MediaCaptureProvider, MediaTrack};
use crate::config::RoomOptions;
use crate::engine::{
    Consumer, MediaEngine, MediaKind, ProduceOptions, Producer, RecvTransport, SendTransport,
    SendTransportListener, TransportDirection, TransportListener, TransportState,
};
use crate::router::{ConsumerMap, NotificationRouter};
use crate::signaling::channel::{ChannelConfig, ChannelEvent, ChannelState, SignalingChannel};
use crate::signaling::protocol::{
    from_data, methods, to_data, ChangeDisplayNameRequest, ConnectTransportRequest,
    CreateTransportRequest, JoinRequest, JoinResponse, ProduceRequest, ProduceResponse,
    ProducerIdRequest, RestartIceRequest, RestartIceResponse, TransportInfo,
};
use crate::signaling::transport::Connector;
use crate::signaling::websocket::WebSocketConnector;
use crate::store::{ConnectionState, NotifyLevel, ProducerState, RoomEvent, RoomSnapshot, RoomStore};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Extra wait on top of the request timeout before `on_produce` gives up
const PRODUCE_GRACE: Duration = Duration::from_secs(1);

/// How long the "joined" notification should be shown
const JOINED_NOTIFY_TIMEOUT: Duration = Duration::from_millis(3000);

/// Caller intents
enum Command {
    Join,
    Close(SyncSender<()>),
    Dispose,
    EnableMic,
    DisableMic,
    MuteMic,
    UnmuteMic,
    EnableCam,
    DisableCam,
    ChangeCam,
    ChangeDisplayName(String),
    RestartIce,
}

/// Completions of worker tasks
enum Step {
    Joined(Result<JoinResponse>),
    TransportCreated(TransportDirection, Result<TransportInfo>),
    TransportState(TransportDirection, TransportState),
    DisplayNameChanged(String, Result<()>),
    IceRestarted(TransportDirection, Result<Value>),
    RequestFailed(String),
}

enum WorkerEvent {
    Command(Command),
    Channel { channel: u64, event: ChannelEvent },
    Step { epoch: u64, step: Step },
    CameraSwitched(std::result::Result<(), String>),
}

/// Client for one room on an SFU
///
/// Dropping the client disposes it.
pub struct RoomClient {
    options: Arc<RoomOptions>,
    store: Arc<RoomStore>,
    consumers: Arc<ConsumerMap>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    worker_thread: thread::ThreadId,
    io_runtime: Mutex<Option<Runtime>>,
    disposed: AtomicBool,
}

impl RoomClient {
    /// Create a client that reaches the server over WebSocket
    ///
    /// Empty room id, peer id and display name are replaced by random ids.
    pub fn new(
        options: RoomOptions,
        engine: Arc<dyn MediaEngine>,
        capture: Arc<dyn MediaCaptureProvider>,
    ) -> Result<Self> {
        Self::with_connector(options, Arc::new(WebSocketConnector::new()), engine, capture)
    }

    /// Create a client using a custom signaling connector
    pub fn with_connector(
        options: RoomOptions,
        connector: Arc<dyn Connector>,
        engine: Arc<dyn MediaEngine>,
        capture: Arc<dyn MediaCaptureProvider>,
    ) -> Result<Self> {
        let options = options.with_generated_ids();
        options.validate()?;
        let url = options.signaling_url()?;
        let invitation_link = options.invitation_link()?;
        let options = Arc::new(options);

        let store = Arc::new(RoomStore::new(
            &options.room_id,
            &options.peer_id,
            &options.display_name,
            options.device.clone(),
        ));
        store.set_room_url(url.as_str(), invitation_link.as_str());
        let consumers: Arc<ConsumerMap> = Arc::new(DashMap::new());

        let io_runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("room-signaling")
            .enable_all()
            .build()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            options: options.clone(),
            store: store.clone(),
            router: NotificationRouter::new(store.clone(), consumers.clone()),
            engine,
            capture,
            connector,
            io: io_runtime.handle().clone(),
            events: events_tx.clone(),
            state: ConnectionState::New,
            epoch: 0,
            channel_seq: 0,
            channel: None,
            forwarder: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            mic_track: None,
            cam_track: None,
            cam_in_progress: false,
            tasks: JoinSet::new(),
        };

        let (ready_tx, ready_rx) = sync_channel::<Result<()>>(1);
        let spawned = thread::Builder::new()
            .name("room-worker".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => {
                        let _ = ready_tx.send(Ok(()));
                        runtime
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                runtime.block_on(worker.run(events_rx));
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                io_runtime.shutdown_background();
                return Err(e.into());
            }
        };

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::engine("room worker exited during startup")));
        if let Err(e) = ready {
            let _ = handle.join();
            io_runtime.shutdown_background();
            return Err(e);
        }

        info!(
            room_id = %options.room_id,
            peer_id = %options.peer_id,
            "Room client created"
        );

        Ok(Self {
            worker_thread: handle.thread().id(),
            options,
            store,
            consumers,
            events: events_tx,
            worker: Mutex::new(Some(handle)),
            io_runtime: Mutex::new(Some(io_runtime)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Effective options (with generated ids filled in)
    pub fn options(&self) -> &RoomOptions {
        &self.options
    }

    /// Observable room state
    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    /// Copy of the current room state
    pub fn snapshot(&self) -> RoomSnapshot {
        self.store.snapshot()
    }

    /// Current session state
    pub fn connection_state(&self) -> ConnectionState {
        self.store.connection_state()
    }

    /// Subscribe to room events
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.store.subscribe()
    }

    /// Live consumer by id
    pub fn consumer(&self, consumer_id: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.get(consumer_id).map(|c| c.value().clone())
    }

    /// Number of live consumers
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Connect and join the room
    pub fn join(&self) {
        self.send(Command::Join);
    }

    /// Leave the room
    ///
    /// Idempotent. Returns once the worker has torn the session down.
    pub fn close(&self) {
        let (ack_tx, ack_rx) = sync_channel(1);
        if !self.send(Command::Close(ack_tx)) {
            return;
        }
        if thread::current().id() != self.worker_thread {
            let _ = ack_rx.recv();
        }
    }

    /// Start sending the microphone
    pub fn enable_mic(&self) {
        self.send(Command::EnableMic);
    }

    /// Stop sending the microphone
    pub fn disable_mic(&self) {
        self.send(Command::DisableMic);
    }

    /// Pause the microphone producer
    pub fn mute_mic(&self) {
        self.send(Command::MuteMic);
    }

    /// Resume the microphone producer
    pub fn unmute_mic(&self) {
        self.send(Command::UnmuteMic);
    }

    /// Start sending the camera
    pub fn enable_cam(&self) {
        self.send(Command::EnableCam);
    }

    /// Stop sending the camera
    pub fn disable_cam(&self) {
        self.send(Command::DisableCam);
    }

    /// Switch to the next camera
    pub fn change_cam(&self) {
        self.send(Command::ChangeCam);
    }

    /// Change the local display name
    pub fn change_display_name(&self, display_name: impl Into<String>) {
        self.send(Command::ChangeDisplayName(display_name.into()));
    }

    /// Restart ICE on every live transport
    pub fn restart_ice(&self) {
        self.send(Command::RestartIce);
    }

    /// Close if needed, release the media engine and local tracks, then stop
    /// the worker and the signaling runtime
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.events.send(WorkerEvent::Command(Command::Dispose));

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Room worker panicked");
            }
        }

        if let Some(runtime) = self.io_runtime.lock().take() {
            runtime.shutdown_background();
        }

        debug!(room_id = %self.options.room_id, "Room client disposed");
    }

    fn send(&self, command: Command) -> bool {
        if self.events.send(WorkerEvent::Command(command)).is_err() {
            warn!("Room worker is not running, command dropped");
            return false;
        }
        true
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Transport listener relaying engine callbacks to the signaling server
struct SignalingTransportListener {
    channel: Arc<SignalingChannel>,
    io: Handle,
    events: mpsc::UnboundedSender<WorkerEvent>,
    epoch: u64,
    direction: TransportDirection,
    produce_timeout: Duration,
}

impl TransportListener for SignalingTransportListener {
    fn on_connect(&self, transport_id: &str, dtls_parameters: Value) {
        debug!(transport_id, direction = %self.direction, "Transport needs connect");

        let request = ConnectTransportRequest {
            transport_id: transport_id.to_string(),
            dtls_parameters,
        };
        let channel = self.channel.clone();
        let direction = self.direction;

        self.io.spawn(async move {
            let result = match to_data(&request) {
                Ok(data) => channel
                    .request(methods::CONNECT_WEBRTC_TRANSPORT, data)
                    .await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => debug!(direction = %direction, "connectWebRtcTransport done"),
                Err(e) => error!(
                    direction = %direction,
                    error = %e,
                    "connectWebRtcTransport failed"
                ),
            }
        });
    }

    fn on_connection_state_change(&self, transport_id: &str, state: TransportState) {
        info!(transport_id, direction = %self.direction, ?state, "Transport state changed");
        let _ = self.events.send(WorkerEvent::Step {
            epoch: self.epoch,
            step: Step::TransportState(self.direction, state),
        });
    }
}

impl SendTransportListener for SignalingTransportListener {
    /// Blocks the calling thread until the `produce` response arrives.
    ///
    /// The request runs on the signaling runtime, whose dispatch loop resolves
    /// it independently of the caller. Must not be called from a signaling
    /// runtime thread.
    fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<String> {
        let data = to_data(&ProduceRequest {
            transport_id: transport_id.to_string(),
            kind: kind.as_str().to_string(),
            rtp_parameters,
            app_data,
        })?;

        let (tx, rx) = sync_channel::<Result<String>>(1);
        let channel = self.channel.clone();

        debug!(transport_id, %kind, "Sending produce request");
        self.io.spawn(async move {
            let result = channel
                .request(methods::PRODUCE, data)
                .await
                .and_then(|data| from_data::<ProduceResponse>(methods::PRODUCE, data))
                .map(|response| response.id);
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.produce_timeout) {
            Ok(result) => {
                if let Ok(id) = &result {
                    debug!(producer_id = %id, "Server assigned producer id");
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
                method: methods::PRODUCE.to_string(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }
}

/// Session state owned by the room worker
struct Worker {
    options: Arc<RoomOptions>,
    store: Arc<RoomStore>,
    router: NotificationRouter,
    engine: Arc<dyn MediaEngine>,
    capture: Arc<dyn MediaCaptureProvider>,
    connector: Arc<dyn Connector>,
    io: Handle,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: ConnectionState,
    epoch: u64,
    channel_seq: u64,
    channel: Option<Arc<SignalingChannel>>,
    forwarder: Option<JoinHandle<()>>,
    send_transport: Option<Box<dyn SendTransport>>,
    recv_transport: Option<Box<dyn RecvTransport>>,
    producers: HashMap<MediaKind, Box<dyn Producer>>,
    mic_track: Option<Arc<dyn MediaTrack>>,
    cam_track: Option<Arc<dyn MediaTrack>>,
    cam_in_progress: bool,
    tasks: JoinSet<()>,
}

fn device_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "mic",
        MediaKind::Video => "cam",
        MediaKind::Data => "data",
    }
}

async fn join_room(
    channel: &SignalingChannel,
    engine: &dyn MediaEngine,
    display_name: String,
    device: Value,
) -> Result<JoinResponse> {
    let router_capabilities = channel
        .request(methods::GET_ROUTER_RTP_CAPABILITIES, json!({}))
        .await?;
    let rtp_capabilities = engine.load(&router_capabilities)?;
    debug!("Media engine loaded");

    let request = JoinRequest {
        display_name,
        device,
        rtp_capabilities,
        sctp_capabilities: engine.sctp_capabilities().unwrap_or(Value::Null),
    };
    channel.request_typed(methods::JOIN, &request).await
}

impl Worker {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        debug!(room_id = %self.options.room_id, "Room worker started");

        while let Some(event) = events.recv().await {
            let keep_running = self.handle_event(event);
            while self.tasks.try_join_next().is_some() {}
            if !keep_running {
                break;
            }
        }

        self.tasks.abort_all();
        debug!(room_id = %self.options.room_id, "Room worker stopped");
    }

    fn handle_event(&mut self, event: WorkerEvent) -> bool {
        match event {
            WorkerEvent::Command(command) => return self.handle_command(command),
            WorkerEvent::Channel { channel, event } => {
                if channel == self.channel_seq {
                    self.handle_channel_event(event);
                } else {
                    debug!(channel, "Dropping event from a replaced signaling channel");
                }
            }
            WorkerEvent::Step { epoch, step } => {
                if epoch == self.epoch {
                    self.handle_step(step);
                } else {
                    debug!(epoch, current = self.epoch, "Dropping stale step");
                }
            }
            WorkerEvent::CameraSwitched(result) => self.on_camera_switched(result),
        }
        true
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join => self.join(),
            Command::Close(ack) => {
                self.close();
                let _ = ack.send(());
            }
            Command::Dispose => {
                self.dispose();
                return false;
            }
            Command::EnableMic => self.enable(MediaKind::Audio),
            Command::DisableMic => self.disable(MediaKind::Audio),
            Command::MuteMic => self.set_mic_paused(true),
            Command::UnmuteMic => self.set_mic_paused(false),
            Command::EnableCam => self.enable(MediaKind::Video),
            Command::DisableCam => self.disable(MediaKind::Video),
            Command::ChangeCam => self.change_cam(),
            Command::ChangeDisplayName(name) => self.change_display_name(name),
            Command::RestartIce => self.restart_ice(),
        }
        true
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => self.on_open(),
            ChannelEvent::Failed(reason) => {
                warn!(reason = %reason, "Signaling connection failed");
                self.store
                    .add_notify(NotifyLevel::Error, "WebSocket connection failed");
                if self.state != ConnectionState::Closed {
                    self.set_state(ConnectionState::Connecting);
                }
            }
            ChannelEvent::Disconnected => self.on_disconnected(),
            ChannelEvent::Closed => {
                if self.state != ConnectionState::Closed {
                    self.store
                        .add_notify(NotifyLevel::Error, "Signaling channel closed");
                    self.close();
                }
            }
            ChannelEvent::Request(request) => {
                self.router
                    .handle_request(request, self.recv_transport.as_deref());
            }
            ChannelEvent::Notification(notification) => {
                self.router.handle_notification(&notification);
            }
        }
    }

    fn handle_step(&mut self, step: Step) {
        match step {
            Step::Joined(Ok(response)) => self.on_joined(response),
            Step::Joined(Err(e @ (Error::ChannelClosed | Error::NotConnected))) => {
                // The channel's Disconnected or Closed event decides what happens next
                warn!(error = %e, "Join interrupted by connection loss");
            }
            Step::Joined(Err(e)) => {
                error!(error = %e, "Joining the room failed");
                self.store.add_notify(
                    NotifyLevel::Error,
                    format!("Could not join the room: {}", e),
                );
                self.close();
            }
            Step::TransportCreated(direction, Ok(info)) => {
                self.on_transport_created(direction, info)
            }
            Step::TransportCreated(direction, Err(e)) => {
                error!(%direction, error = %e, "createWebRtcTransport failed");
                self.store.add_notify(
                    NotifyLevel::Error,
                    format!("Could not create {} transport: {}", direction, e),
                );
            }
            Step::TransportState(direction, state) => {
                let live = match direction {
                    TransportDirection::Send => self.send_transport.is_some(),
                    TransportDirection::Recv => self.recv_transport.is_some(),
                };
                if live {
                    self.store.set_transport_state(direction, state);
                }
            }
            Step::DisplayNameChanged(name, Ok(())) => {
                self.store.set_display_name(&name);
                self.store
                    .add_notify(NotifyLevel::Info, format!("Display name changed to {}", name));
            }
            Step::DisplayNameChanged(_, Err(e)) => {
                self.store.add_notify(
                    NotifyLevel::Error,
                    format!("Could not change display name: {}", e),
                );
            }
            Step::IceRestarted(direction, Ok(ice_parameters)) => {
                let result = match direction {
                    TransportDirection::Send => self
                        .send_transport
                        .as_ref()
                        .map(|t| t.restart_ice(&ice_parameters)),
                    TransportDirection::Recv => self
                        .recv_transport
                        .as_ref()
                        .map(|t| t.restart_ice(&ice_parameters)),
                };
                match result {
                    Some(Ok(())) => info!(%direction, "ICE restarted"),
                    Some(Err(e)) => self.store.add_notify(
                        NotifyLevel::Error,
                        format!("ICE restart failed: {}", e),
                    ),
                    None => debug!(%direction, "Transport gone before ICE restart completed"),
                }
            }
            Step::IceRestarted(direction, Err(e)) => {
                self.store.add_notify(
                    NotifyLevel::Error,
                    format!("restartIce for {} transport failed: {}", direction, e),
                );
            }
            Step::RequestFailed(text) => {
                self.store.add_notify(NotifyLevel::Error, text);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.store.set_room_state(state);
    }

    fn join(&mut self) {
        let awaiting_rejoin = self.state == ConnectionState::Connecting
            && self.channel.as_ref().map_or(true, |c| {
                matches!(
                    c.state(),
                    ChannelState::Idle | ChannelState::Disconnected | ChannelState::Closed
                )
            });
        if !matches!(self.state, ConnectionState::New | ConnectionState::Closed) && !awaiting_rejoin {
            warn!(state = ?self.state, "join() ignored, session already active");
            return;
        }

        let url = match self.options.signaling_url() {
            Ok(url) => url.to_string(),
            Err(e) => {
                self.store
                    .add_notify(NotifyLevel::Error, format!("Invalid signaling URL: {}", e));
                return;
            }
        };

        info!(url = %url, "Joining room");

        self.drop_channel();
        self.channel_seq += 1;
        self.epoch += 1;

        let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::new(
            url,
            self.connector.clone(),
            self.io.clone(),
            ChannelConfig {
                request_timeout: self.options.request_timeout(),
                reconnect: self.options.reconnect,
            },
            channel_tx,
        );

        let events = self.events.clone();
        let seq = self.channel_seq;
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = channel_rx.recv().await {
                if events
                    .send(WorkerEvent::Channel {
                        channel: seq,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }));

        self.set_state(ConnectionState::Connecting);

        if let Err(e) = channel.connect() {
            warn!(error = %e, "Could not start signaling connection");
        }
        self.channel = Some(channel);
    }

    fn on_open(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => return,
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let engine = self.engine.clone();
        let events = self.events.clone();
        let display_name = self.store.snapshot().me.display_name;
        let device = match to_data(&self.options.device) {
            Ok(device) => device,
            Err(e) => {
                error!(error = %e, "Could not encode device descriptor");
                Value::Null
            }
        };

        debug!(epoch, "Signaling open, joining");
        self.tasks.spawn(async move {
            let result = join_room(&channel, engine.as_ref(), display_name, device).await;
            let _ = events.send(WorkerEvent::Step {
                epoch,
                step: Step::Joined(result),
            });
        });
    }

    fn on_joined(&mut self, response: JoinResponse) {
        if self.state == ConnectionState::Closed {
            return;
        }

        info!(peers = response.peers.len(), "Joined room");
        self.set_state(ConnectionState::Connected);
        self.store.add_notify_with_timeout(
            NotifyLevel::Info,
            "You are in the room!",
            Some(JOINED_NOTIFY_TIMEOUT),
        );
        self.store.replace_peers(response.peers);

        if self.options.produce {
            let can_send_mic = self.engine.can_produce(MediaKind::Audio);
            let can_send_cam = self.engine.can_produce(MediaKind::Video);
            self.store.set_media_capabilities(can_send_mic, can_send_cam);

            if can_send_mic || can_send_cam {
                self.create_transport(TransportDirection::Send);
            } else {
                warn!("Device cannot produce audio or video, no send transport");
            }
        }

        if self.options.consume {
            self.create_transport(TransportDirection::Recv);
        }
    }

    fn create_transport(&mut self, direction: TransportDirection) {
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => return,
        };

        let request = CreateTransportRequest {
            force_tcp: self.options.force_tcp,
            producing: direction == TransportDirection::Send,
            consuming: direction == TransportDirection::Recv,
            sctp_capabilities: self.engine.sctp_capabilities().unwrap_or(Value::Null),
        };
        let epoch = self.epoch;
        let events = self.events.clone();

        debug!(%direction, "Creating transport");
        self.tasks.spawn(async move {
            let result = channel
                .request_typed::<_, TransportInfo>(methods::CREATE_WEBRTC_TRANSPORT, &request)
                .await;
            let _ = events.send(WorkerEvent::Step {
                epoch,
                step: Step::TransportCreated(direction, result),
            });
        });
    }

    fn on_transport_created(&mut self, direction: TransportDirection, info: TransportInfo) {
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => return,
        };
        let listener = Arc::new(SignalingTransportListener {
            channel,
            io: self.io.clone(),
            events: self.events.clone(),
            epoch: self.epoch,
            direction,
            produce_timeout: self.options.request_timeout() + PRODUCE_GRACE,
        });

        match direction {
            TransportDirection::Send => {
                if self.send_transport.is_some() {
                    warn!(transport_id = %info.id, "Send transport already exists");
                    return;
                }
                match self.engine.create_send_transport(listener, &info) {
                    Ok(transport) => {
                        info!(transport_id = %info.id, "Send transport created");
                        self.send_transport = Some(transport);
                        self.store
                            .set_transport_state(TransportDirection::Send, TransportState::New);
                        if self.options.produce {
                            self.enable(MediaKind::Audio);
                            self.enable(MediaKind::Video);
                        }
                    }
                    Err(e) => self.store.add_notify(
                        NotifyLevel::Error,
                        format!("Could not create send transport: {}", e),
                    ),
                }
            }
            TransportDirection::Recv => {
                if self.recv_transport.is_some() {
                    warn!(transport_id = %info.id, "Recv transport already exists");
                    return;
                }
                match self.engine.create_recv_transport(listener, &info) {
                    Ok(transport) => {
                        info!(transport_id = %info.id, "Recv transport created");
                        self.recv_transport = Some(transport);
                        self.store
                            .set_transport_state(TransportDirection::Recv, TransportState::New);
                    }
                    Err(e) => self.store.add_notify(
                        NotifyLevel::Error,
                        format!("Could not create recv transport: {}", e),
                    ),
                }
            }
        }
    }

    fn on_disconnected(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        warn!("Signaling disconnected");
        self.store
            .add_notify(NotifyLevel::Error, "WebSocket disconnected");

        self.epoch += 1;
        self.tasks.abort_all();
        self.set_state(ConnectionState::Connecting);
        self.teardown_media();

        if !self.options.reconnect.is_automatic() {
            info!("Manual reconnect policy, waiting for join()");
        }
    }

    /// Close producers, consumers and transports and forget remote peers
    fn teardown_media(&mut self) {
        for (_, producer) in self.producers.drain() {
            producer.close();
            self.store.remove_producer(producer.id());
        }

        self.router.close_all_consumers();

        if let Some(transport) = self.send_transport.take() {
            transport.close();
            self.store.remove_transport(TransportDirection::Send);
        }
        if let Some(transport) = self.recv_transport.take() {
            transport.close();
            self.store.remove_transport(TransportDirection::Recv);
        }

        self.store.clear_peers();
    }

    fn drop_channel(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            debug!("close() | already closed");
            return;
        }

        info!(room_id = %self.options.room_id, "Closing room");

        // Phase first: anything still in flight sees a closed session
        self.state = ConnectionState::Closed;
        self.epoch += 1;
        self.tasks.abort_all();

        self.teardown_media();
        self.drop_channel();

        self.store.set_room_state(ConnectionState::Closed);
    }

    fn dispose(&mut self) {
        self.close();
        self.tasks.abort_all();
        self.engine.dispose();

        if let Some(track) = self.mic_track.take() {
            track.dispose();
        }
        if let Some(track) = self.cam_track.take() {
            track.dispose();
        }
        self.capture.dispose();

        info!(room_id = %self.options.room_id, "Room disposed");
    }

    fn local_track(&mut self, kind: MediaKind) -> Result<Arc<dyn MediaTrack>> {
        let slot = match kind {
            MediaKind::Audio => &mut self.mic_track,
            _ => &mut self.cam_track,
        };
        if let Some(track) = slot {
            return Ok(track.clone());
        }

        let track = match kind {
            MediaKind::Audio => self.capture.create_audio_track()?,
            _ => self.capture.create_video_track()?,
        };
        track.set_enabled(true);
        *slot = Some(track.clone());
        Ok(track)
    }

    fn produce_options(&self, kind: MediaKind) -> ProduceOptions {
        let codec = match kind {
            MediaKind::Video => self.options.video_codec.map(|c| c.mime_type().to_string()),
            _ => None,
        };
        ProduceOptions {
            codec,
            codec_options: None,
            app_data: json!({}),
        }
    }

    fn enable(&mut self, kind: MediaKind) {
        let label = device_label(kind);

        if !self.engine.is_loaded() {
            warn!("enable_{}() | device not loaded", label);
            return;
        }
        if !self.engine.can_produce(kind) {
            warn!("enable_{}() | cannot produce {}", label, kind);
            return;
        }
        if self.producers.contains_key(&kind) {
            warn!("enable_{}() | already enabled", label);
            return;
        }
        if self.send_transport.is_none() {
            warn!("enable_{}() | no send transport", label);
            return;
        }

        let track = match self.local_track(kind) {
            Ok(track) => track,
            Err(e) => {
                self.store.add_notify(
                    NotifyLevel::Error,
                    format!("Error enabling {}: {}", label, e),
                );
                return;
            }
        };
        let options = self.produce_options(kind);

        let (transport_id, result) = match self.send_transport.as_ref() {
            Some(transport) => (transport.id().to_string(), transport.produce(track, options)),
            None => return,
        };

        match result {
            Ok(producer) => {
                info!(producer_id = %producer.id(), %kind, "Producer created");
                self.store.add_producer(ProducerState {
                    id: producer.id().to_string(),
                    kind,
                    paused: producer.is_paused(),
                    transport_id,
                    score: None,
                });
                self.producers.insert(kind, producer);
            }
            Err(e) => {
                error!(%kind, error = %e, "Producing failed");
                self.store.add_notify(
                    NotifyLevel::Error,
                    format!("Error enabling {}: {}", label, e),
                );
            }
        }
    }

    fn disable(&mut self, kind: MediaKind) {
        let label = device_label(kind);

        let producer = match self.producers.remove(&kind) {
            Some(producer) => producer,
            None => {
                warn!("disable_{}() | no producer", label);
                return;
            }
        };

        let producer_id = producer.id().to_string();
        producer.close();
        self.store.remove_producer(&producer_id);
        info!(producer_id = %producer_id, %kind, "Producer closed");

        self.spawn_request(
            methods::CLOSE_PRODUCER,
            ProducerIdRequest { producer_id },
            format!("Error closing server-side {} Producer", label),
        );
    }

    fn set_mic_paused(&mut self, paused: bool) {
        let producer_id = match self.producers.get(&MediaKind::Audio) {
            Some(producer) => {
                if paused {
                    producer.pause();
                } else {
                    producer.resume();
                }
                producer.id().to_string()
            }
            None => {
                warn!(paused, "mute_mic()/unmute_mic() | no mic producer");
                return;
            }
        };

        self.store.set_producer_paused(&producer_id, paused);

        let (method, verb) = if paused {
            (methods::PAUSE_PRODUCER, "pausing")
        } else {
            (methods::RESUME_PRODUCER, "resuming")
        };
        self.spawn_request(
            method,
            ProducerIdRequest { producer_id },
            format!("Error {} server-side mic Producer", verb),
        );
    }

    fn change_cam(&mut self) {
        if self.cam_in_progress {
            warn!("change_cam() | switch already in progress");
            return;
        }

        self.cam_in_progress = true;
        self.store.set_cam_in_progress(true);

        let events = self.events.clone();
        self.capture.switch_camera(Box::new(move |result| {
            let _ = events.send(WorkerEvent::CameraSwitched(result));
        }));
    }

    fn on_camera_switched(&mut self, result: std::result::Result<(), String>) {
        self.cam_in_progress = false;
        self.store.set_cam_in_progress(false);

        if let Err(e) = result {
            self.store
                .add_notify(NotifyLevel::Error, format!("Could not change cam: {}", e));
        }
    }

    fn change_display_name(&mut self, display_name: String) {
        let display_name = display_name.trim().to_string();
        if display_name.is_empty() {
            warn!("change_display_name() | empty name");
            return;
        }
        if self.state != ConnectionState::Connected {
            warn!(state = ?self.state, "change_display_name() | not connected");
            return;
        }
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => return,
        };

        let request = ChangeDisplayNameRequest {
            display_name: display_name.clone(),
        };
        let epoch = self.epoch;
        let events = self.events.clone();

        self.tasks.spawn(async move {
            let result = channel
                .request_typed::<_, Value>(methods::CHANGE_DISPLAY_NAME, &request)
                .await
                .map(|_| ());
            let _ = events.send(WorkerEvent::Step {
                epoch,
                step: Step::DisplayNameChanged(display_name, result),
            });
        });
    }

    fn restart_ice(&mut self) {
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => {
                warn!("restart_ice() | no signaling channel");
                return;
            }
        };

        let transports = [
            (
                TransportDirection::Send,
                self.send_transport.as_ref().map(|t| t.id().to_string()),
            ),
            (
                TransportDirection::Recv,
                self.recv_transport.as_ref().map(|t| t.id().to_string()),
            ),
        ];

        for (direction, transport_id) in transports {
            let transport_id = match transport_id {
                Some(id) => id,
                None => continue,
            };
            let channel = channel.clone();
            let epoch = self.epoch;
            let events = self.events.clone();

            self.tasks.spawn(async move {
                let result = channel
                    .request_typed::<_, RestartIceResponse>(
                        methods::RESTART_ICE,
                        &RestartIceRequest { transport_id },
                    )
                    .await
                    .map(|response| response.ice_parameters);
                let _ = events.send(WorkerEvent::Step {
                    epoch,
                    step: Step::IceRestarted(direction, result),
                });
            });
        }
    }

    /// Fire a best-effort request; failure becomes a user notification
    fn spawn_request<T>(&mut self, method: &'static str, payload: T, failure: String)
    where
        T: serde::Serialize + Send + 'static,
    {
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => return,
        };
        let epoch = self.epoch;
        let events = self.events.clone();

        self.tasks.spawn(async move {
            let result = match to_data(&payload) {
                Ok(data) => channel.request(method, data).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(method, error = %e, "Request failed");
                let _ = events.send(WorkerEvent::Step {
                    epoch,
                    step: Step::RequestFailed(format!("{}: {}", failure, e)),
                });
            }
        });
    }
}
