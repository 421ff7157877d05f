//! Room client integration test harness
//!
//! Provides:
//! - A scripted protoo signaling server on the in-memory connector
//! - A mock media engine and capture provider that count lifecycle calls
//! - Polling helpers for state the room worker updates asynchronously
//!
//! Tests must run on a multi-thread runtime: `RoomClient::close` blocks the
//! calling thread until the worker acknowledges.

#![allow(dead_code)]

pub mod media;
pub mod test_server;

use parking_lot::Mutex;
use sfu_room_client::signaling::MemoryConnector;
use sfu_room_client::{ConnectionState, ReconnectPolicy, RoomClient, RoomEvent, RoomOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

pub use media::{EngineLog, MockCapture, MockEngine};
pub use test_server::{ServerScript, ServerSession, TestServer};

/// How long [`eventually`] waits before failing the test
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging once
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Reconnect quickly so tests don't wait on real backoff
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::Automatic {
        max_attempts: 5,
        min_delay_ms: 10,
        max_delay_ms: 40,
    }
}

/// Options for a producing and consuming participant
pub fn options(reconnect: ReconnectPolicy) -> RoomOptions {
    RoomOptions::new("test-room", "alice")
        .with_display_name("Alice")
        .with_server("sfu.test", 4443)
        .with_request_timeout(Duration::from_secs(2))
        .with_reconnect(reconnect)
}

/// A client wired to a test server and mocks
pub struct TestRoom {
    pub client: RoomClient,
    pub server: TestServer,
    pub connector: Arc<MemoryConnector>,
    pub engine: Arc<MockEngine>,
    pub capture: Arc<MockCapture>,
    pub notifies: Arc<Mutex<Vec<String>>>,
}

impl TestRoom {
    /// Build a room; nothing connects until `client.join()`
    pub fn new(options: RoomOptions, can_produce: bool) -> Self {
        init_tracing();

        let (server, connector) = TestServer::new();
        let engine = MockEngine::new(can_produce);
        let capture = Arc::new(MockCapture::default());
        let client = RoomClient::with_connector(
            options,
            connector.clone(),
            engine.clone(),
            capture.clone(),
        )
            .expect("room client");
        let notifies = record_notifies(&client);

        Self {
            client,
            server,
            connector,
            engine,
            capture,
            notifies,
        }
    }

    /// Join and wait until the session is fully set up
    ///
    /// Fully set up means connected, with every expected transport and
    /// producer in place.
    pub async fn join(&mut self) -> ServerSession {
        self.client.join();
        let session = self.server.accept().await;
        self.wait_ready().await;
        session
    }

    /// Wait for the room to reach `Connected` with media in place
    pub async fn wait_ready(&self) {
        let options = self.client.options().clone();
        let can_produce = self.engine.can_produce_media();

        eventually("room ready", || {
            let snapshot = self.client.snapshot();
            let producing = options.produce && can_produce;
            let transports = usize::from(producing) + usize::from(options.consume);
            let producers = if producing { 2 } else { 0 };
            snapshot.room.state == ConnectionState::Connected
                && snapshot.transports.len() == transports
                && snapshot.producers.len() == producers
        })
        .await;
    }

    /// Whether a notification containing `text` was shown
    pub fn notified(&self, text: &str) -> bool {
        self.notifies.lock().iter().any(|n| n.contains(text))
    }
}

/// Collect the text of every notification the client shows
pub fn record_notifies(client: &RoomClient) -> Arc<Mutex<Vec<String>>> {
    let mut events = client.subscribe();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RoomEvent::Notify(notify)) => sink.lock().push(notify.text),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    log
}

/// Poll `condition` until it holds, failing the test after [`WAIT`]
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
