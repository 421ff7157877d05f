//! Mock media engine and capture provider
//!
//! Every lifecycle call is counted in an [`EngineLog`] so tests can check
//! that teardown closes exactly what was created.

use parking_lot::Mutex;
use serde_json::{json, Value};
use sfu_room_client::capture::SwitchCameraCallback;
use sfu_room_client::signaling::protocol::TransportInfo;
use sfu_room_client::{
    Consumer, ConsumerInfo, LocalTrack, MediaCaptureProvider, MediaEngine, MediaKind, MediaTrack,
    ProduceOptions, Producer, RecvTransport, Result, SendTransport, SendTransportListener,
    Transport, TransportListener, TransportState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle counters shared by the mock engine objects
#[derive(Default)]
pub struct EngineLog {
    pub loads: AtomicUsize,
    pub send_transports: AtomicUsize,
    pub recv_transports: AtomicUsize,
    pub transports_closed: AtomicUsize,
    pub producers_closed: AtomicUsize,
    pub consumers_closed: AtomicUsize,
    pub ice_restarts: AtomicUsize,
    pub disposed: AtomicBool,
    pub produce_codecs: Mutex<Vec<Option<String>>>,
}

impl EngineLog {
    /// Read a counter
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Media engine that fakes transports and asks the listener for ids
pub struct MockEngine {
    log: Arc<EngineLog>,
    can_produce: bool,
    capabilities: Mutex<Option<Value>>,
}

impl MockEngine {
    /// Create an engine; `can_produce` applies to audio and video
    pub fn new(can_produce: bool) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(EngineLog::default()),
            can_produce,
            capabilities: Mutex::new(None),
        })
    }

    /// Lifecycle counters
    pub fn log(&self) -> &Arc<EngineLog> {
        &self.log
    }

    /// Whether the engine reports audio/video as producible
    pub fn can_produce_media(&self) -> bool {
        self.can_produce
    }
}

impl MediaEngine for MockEngine {
    fn load(&self, router_rtp_capabilities: &Value) -> Result<Value> {
        self.log.loads.fetch_add(1, Ordering::SeqCst);
        let local = json!({
            "codecs": router_rtp_capabilities["codecs"].clone(),
            "headerExtensions": []
        });
        *self.capabilities.lock() = Some(local.clone());
        Ok(local)
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.lock().is_some()
    }

    fn rtp_capabilities(&self) -> Option<Value> {
        self.capabilities.lock().clone()
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        self.can_produce && kind != MediaKind::Data
    }

    fn create_send_transport(
        &self,
        listener: Arc<dyn SendTransportListener>,
        info: &TransportInfo,
    ) -> Result<Box<dyn SendTransport>> {
        self.log.send_transports.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSendTransport {
            id: info.id.clone(),
            listener,
            log: self.log.clone(),
            connected: AtomicBool::new(false),
        }))
    }

    fn create_recv_transport(
        &self,
        listener: Arc<dyn TransportListener>,
        info: &TransportInfo,
    ) -> Result<Box<dyn RecvTransport>> {
        self.log.recv_transports.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRecvTransport {
            id: info.id.clone(),
            listener,
            log: self.log.clone(),
            connected: AtomicBool::new(false),
        }))
    }

    fn dispose(&self) {
        self.capabilities.lock().take();
        self.log.disposed.store(true, Ordering::SeqCst);
    }
}

struct MockSendTransport {
    id: String,
    listener: Arc<dyn SendTransportListener>,
    log: Arc<EngineLog>,
    connected: AtomicBool,
}

impl Transport for MockSendTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn restart_ice(&self, _ice_parameters: &Value) -> Result<()> {
        self.log.ice_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.log.transports_closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl SendTransport for MockSendTransport {
    fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        options: ProduceOptions,
    ) -> Result<Box<dyn Producer>> {
        // First produce triggers DTLS, like a real transport
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.listener
                .on_connect(&self.id, json!({"role": "client", "fingerprints": []}));
            self.listener
                .on_connection_state_change(&self.id, TransportState::Connecting);
        }

        self.log.produce_codecs.lock().push(options.codec.clone());
        let rtp_parameters = json!({
            "mid": track.kind().as_str(),
            "codecs": [{"mimeType": options.codec.unwrap_or_default()}]
        });
        let id = self
            .listener
            .on_produce(&self.id, track.kind(), rtp_parameters, options.app_data)?;

        Ok(Box::new(MockProducer {
            id,
            kind: track.kind(),
            paused: AtomicBool::new(false),
            log: self.log.clone(),
        }))
    }
}

struct MockRecvTransport {
    id: String,
    listener: Arc<dyn TransportListener>,
    log: Arc<EngineLog>,
    connected: AtomicBool,
}

impl Transport for MockRecvTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn restart_ice(&self, _ice_parameters: &Value) -> Result<()> {
        self.log.ice_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.log.transports_closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl RecvTransport for MockRecvTransport {
    fn consume(&self, info: &ConsumerInfo) -> Result<Arc<dyn Consumer>> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.listener
                .on_connect(&self.id, json!({"role": "client", "fingerprints": []}));
        }

        Ok(Arc::new(MockConsumer {
            id: info.id.clone(),
            producer_id: info.producer_id.clone(),
            kind: info.kind,
            paused: AtomicBool::new(false),
            log: self.log.clone(),
        }))
    }
}

struct MockProducer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    log: Arc<EngineLog>,
}

impl Producer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.log.producers_closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    log: Arc<EngineLog>,
}

impl Consumer for MockConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.log.consumers_closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture provider handing out [`LocalTrack`]s it keeps track of
#[derive(Default)]
pub struct MockCapture {
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
    switch_fails: AtomicBool,
    disposed: AtomicBool,
}

impl MockCapture {
    /// Tracks created so far
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks.lock().clone()
    }

    /// Make camera switches fail
    pub fn fail_switch(&self) {
        self.switch_fails.store(true, Ordering::SeqCst);
    }

    /// Whether the provider was disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn track(&self, kind: MediaKind) -> Arc<dyn MediaTrack> {
        let track = Arc::new(LocalTrack::new(kind));
        self.tracks.lock().push(track.clone());
        track
    }
}

impl MediaCaptureProvider for MockCapture {
    fn create_audio_track(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(self.track(MediaKind::Audio))
    }

    fn create_video_track(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(self.track(MediaKind::Video))
    }

    fn switch_camera(&self, on_done: SwitchCameraCallback) {
        let fails = self.switch_fails.load(Ordering::SeqCst);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            on_done(if fails {
                Err("camera busy".to_string())
            } else {
                Ok(())
            });
        });
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
