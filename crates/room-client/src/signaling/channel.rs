//! Signaling channel: correlated requests, server requests and notifications
//! multiplexed over one persistent frame transport.
//!
//! The connection loop runs on the runtime handed to [`SignalingChannel::new`].
//! Responses resolve pending requests directly on that runtime; everything
//! else (lifecycle, server requests, notifications) is forwarded as a
//! [`ChannelEvent`] to whoever owns the event receiver.

use super::protocol::{Message, Notification, Request, RequestId};
use super::transport::{Connector, FrameTransport};
use crate::config::ReconnectPolicy;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// `connect()` not called yet
    Idle,
    /// Connection attempt in progress
    Connecting,
    /// Connected; requests may be sent
    Open,
    /// Not connected after a failure or a lost connection
    Disconnected,
    /// Deliberately closed (terminal)
    Closed,
}

/// Events delivered to the channel owner
#[derive(Debug)]
pub enum ChannelEvent {
    /// Connection established (also after a reconnect)
    Open,
    /// A connection attempt failed
    Failed(String),
    /// An open connection was lost; the channel is not closed
    Disconnected,
    /// The channel closed; emitted exactly once
    Closed,
    /// Server-initiated request awaiting accept/reject
    Request(ServerRequest),
    /// Server notification
    Notification(Notification),
}

/// Channel tuning
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Time to wait for a correlated response
    pub request_timeout: Duration,
    /// Retry behaviour after failures and disconnects
    pub reconnect: ReconnectPolicy,
}

/// A request sent by the server; must be answered exactly once
#[derive(Debug)]
pub struct ServerRequest {
    request: Request,
    responder: Responder,
}

/// Answers a [`ServerRequest`] on the connection it arrived on
#[derive(Debug)]
pub struct Responder {
    id: RequestId,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

impl ServerRequest {
    /// Correlation id
    pub fn id(&self) -> RequestId {
        self.request.id
    }

    /// Method name
    pub fn method(&self) -> &str {
        &self.request.method
    }

    /// Request payload
    pub fn data(&self) -> &Value {
        &self.request.data
    }

    /// Split into the request and its responder
    pub fn into_parts(self) -> (Request, Responder) {
        (self.request, self.responder)
    }

    /// Accept with a response payload
    pub fn accept(self, data: Value) -> Result<()> {
        self.responder.accept(data)
    }

    /// Reject with an error code and reason
    pub fn reject(self, code: i64, reason: impl Into<String>) -> Result<()> {
        self.responder.reject(code, reason)
    }
}

impl Responder {
    /// Accept with a response payload
    pub fn accept(self, data: Value) -> Result<()> {
        let msg = Message::success(self.id, data);
        self.send(msg)
    }

    /// Reject with an error code and reason
    pub fn reject(self, code: i64, reason: impl Into<String>) -> Result<()> {
        let msg = Message::error(self.id, code, reason);
        self.send(msg)
    }

    fn send(&self, msg: Message) -> Result<()> {
        let frame = msg.to_json()?;
        match &self.outgoing {
            Some(out) => out.send(frame).map_err(|_| Error::ChannelClosed),
            None => Err(Error::ChannelClosed),
        }
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Shutdown,
    Lost,
}

/// Persistent duplex signaling channel
pub struct SignalingChannel {
    url: String,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    config: ChannelConfig,
    state: RwLock<ChannelState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Removes a pending entry when the awaiting request future finishes or is
/// dropped, whichever way it ends.
struct PendingGuard<'a> {
    channel: &'a SignalingChannel,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel.pending.lock().remove(&self.id);
    }
}

impl SignalingChannel {
    /// Create a channel; nothing happens until [`connect`](Self::connect)
    ///
    /// # Arguments
    ///
    /// * `url` - Signaling server URL
    /// * `connector` - Transport used to open connections
    /// * `runtime` - Runtime running the connection loop
    /// * `config` - Timeouts and reconnect policy
    /// * `events` - Receives lifecycle events, server requests and notifications
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        runtime: Handle,
        config: ChannelConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            url: url.into(),
            connector,
            runtime,
            config,
            state: RwLock::new(ChannelState::Idle),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown_tx,
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    /// Whether requests can be sent
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Whether the channel was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Start connecting in the background
    ///
    /// A no-op while a connection loop is already running.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            debug!(url = %self.url, "Signaling channel already connecting");
            return Ok(());
        }

        let channel = Arc::clone(self);
        *task = Some(self.runtime.spawn(channel.run()));
        Ok(())
    }

    /// Send a request and wait for the correlated response
    ///
    /// Fails immediately with [`Error::NotConnected`] when the channel is not
    /// open, with [`Error::Rejected`] on an error response, with
    /// [`Error::Timeout`] after the request timeout, and with
    /// [`Error::ChannelClosed`] if the connection goes away first.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = Message::request(id, method, data).to_json()?;
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard { channel: self, id };

        let sent = match self.outgoing.lock().as_ref() {
            Some(out) => out.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            return Err(Error::NotConnected);
        }

        debug!(id, method, "Sent signaling request");

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                warn!(id, method, "Signaling request timed out");
                Err(Error::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Typed wrapper around [`request`](Self::request)
    pub async fn request_typed<Req, Res>(&self, method: &str, payload: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let data = serde_json::to_value(payload)?;
        let response = self.request(method, data).await?;
        super::protocol::from_data(method, response)
    }

    /// Send a fire-and-forget notification
    pub fn notify(&self, method: &str, data: Value) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        let frame = Message::notification(method, data).to_json()?;
        let outgoing = self.outgoing.lock();
        let out = outgoing.as_ref().ok_or(Error::NotConnected)?;
        out.send(frame).map_err(|_| Error::NotConnected)
    }

    /// Close the channel
    ///
    /// Idempotent. Rejects every pending request with
    /// [`Error::ChannelClosed`] and emits [`ChannelEvent::Closed`] once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(url = %self.url, "Closing signaling channel");

        self.set_state(ChannelState::Closed);
        self.outgoing.lock().take();
        self.reject_pending();
        self.shutdown_tx.send_replace(true);
        self.emit(ChannelEvent::Closed);
    }

    /// Connection loop: connect, pump frames, retry per policy
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if self.is_closed() {
                break;
            }

            self.set_state(ChannelState::Connecting);

            let connected = tokio::select! {
                _ = shutdown_signal(&mut shutdown_rx) => break,
                result = self.connector.connect(&self.url) => result,
            };

            match connected {
                Ok(transport) => {
                    attempt = 0;

                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    *self.outgoing.lock() = Some(out_tx);
                    self.set_state(ChannelState::Open);
                    info!(url = %self.url, "Signaling channel open");
                    self.emit(ChannelEvent::Open);

                    let outcome = self.pump(transport, out_rx, &mut shutdown_rx).await;

                    self.outgoing.lock().take();
                    self.reject_pending();

                    if outcome == Outcome::Shutdown || self.is_closed() {
                        break;
                    }

                    warn!(url = %self.url, "Signaling connection lost");
                    self.set_state(ChannelState::Disconnected);
                    self.emit(ChannelEvent::Disconnected);
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Signaling connection failed");
                    self.set_state(ChannelState::Disconnected);
                    self.emit(ChannelEvent::Failed(e.to_string()));
                }
            }

            attempt += 1;
            match self.config.reconnect.delay(attempt) {
                Some(delay) => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Retrying signaling connection");
                    tokio::select! {
                        _ = shutdown_signal(&mut shutdown_rx) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    if self.config.reconnect.is_automatic() {
                        error!(
                            attempts = attempt - 1,
                            "Giving up on signaling connection"
                        );
                        self.close();
                    }
                    break;
                }
            }
        }

        debug!(url = %self.url, "Signaling connection loop terminated");
    }

    /// Move frames between the transport and the channel until the
    /// connection ends or the channel shuts down.
    async fn pump(
        &self,
        transport: FrameTransport,
        mut out_rx: mpsc::UnboundedReceiver<String>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let FrameTransport {
            mut sink,
            mut stream,
        } = transport;

        loop {
            tokio::select! {
                _ = shutdown_signal(shutdown_rx) => {
                    while let Ok(frame) = out_rx.try_recv() {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    return Outcome::Shutdown;
                }
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            warn!(error = %e, "Failed to send signaling frame");
                            return Outcome::Lost;
                        }
                    }
                    None => return Outcome::Lost,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => {
                        warn!(error = %e, "Signaling transport error");
                        return Outcome::Lost;
                    }
                    None => return Outcome::Lost,
                },
            }
        }
    }

    /// Route one inbound frame
    fn dispatch(&self, text: &str) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signaling frame");
                return;
            }
        };

        match message {
            Message::Response(response) => {
                let entry = self.pending.lock().remove(&response.id);
                match entry {
                    Some(pending) => {
                        let result = response.result.map_err(|body| Error::Rejected {
                            method: pending.method.clone(),
                            code: body.code,
                            reason: body.reason,
                        });
                        debug!(id = response.id, method = %pending.method, ok = result.is_ok(), "Received response");
                        let _ = pending.tx.send(result);
                    }
                    None => {
                        warn!(id = response.id, "Response for unknown request, dropping");
                    }
                }
            }
            Message::Request(request) => {
                debug!(id = request.id, method = %request.method, "Received server request");
                let responder = Responder {
                    id: request.id,
                    outgoing: self.outgoing.lock().clone(),
                };
                self.emit(ChannelEvent::Request(ServerRequest { request, responder }));
            }
            Message::Notification(notification) => {
                debug!(method = %notification.method, "Received notification");
                self.emit(ChannelEvent::Notification(notification));
            }
        }
    }

    fn reject_pending(&self) {
        let drained: Vec<(RequestId, PendingRequest)> = self.pending.lock().drain().collect();
        for (id, pending) in drained {
            debug!(id, method = %pending.method, "Rejecting pending request");
            let _ = pending.tx.send(Err(Error::ChannelClosed));
        }
    }

    fn set_state(&self, new_state: ChannelState) {
        let mut state = self.state.write();
        if *state == ChannelState::Closed {
            return;
        }
        if *state != new_state {
            debug!("Signaling channel state transition: {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            debug!("Signaling event receiver dropped");
        }
    }
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}
