//! Scripted protoo signaling server over the in-memory connector

use parking_lot::Mutex;
use serde_json::{json, Value};
use sfu_room_client::signaling::protocol::{methods, Request, RequestId, Response};
use sfu_room_client::signaling::{MemoryConnector, MemoryListener, Message};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::WAIT;

/// How the server answers client requests
#[derive(Default)]
pub struct ServerScript {
    peers: Mutex<Vec<Value>>,
    failing: Mutex<HashSet<String>>,
    ignored: Mutex<HashSet<String>>,
    transports: AtomicUsize,
}

impl ServerScript {
    /// Peers returned by `join`
    pub fn set_peers(&self, peers: Vec<Value>) {
        *self.peers.lock() = peers;
    }

    /// Reject every `method` request with a 500
    pub fn fail(&self, method: &str) {
        self.failing.lock().insert(method.to_string());
    }

    /// Never answer `method` requests
    pub fn ignore(&self, method: &str) {
        self.ignored.lock().insert(method.to_string());
    }

    /// Answer `method` normally again
    pub fn heal(&self, method: &str) {
        self.failing.lock().remove(method);
        self.ignored.lock().remove(method);
    }

    fn respond(&self, request: &Request) -> Option<Message> {
        if self.ignored.lock().contains(&request.method) {
            return None;
        }
        if self.failing.lock().contains(&request.method) {
            return Some(Message::error(
                request.id,
                500,
                format!("{} refused", request.method),
            ));
        }

        let data = match request.method.as_str() {
            methods::GET_ROUTER_RTP_CAPABILITIES => json!({
                "codecs": [
                    {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
                    {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
                ],
                "headerExtensions": []
            }),
            methods::JOIN => json!({ "peers": self.peers.lock().clone() }),
            methods::CREATE_WEBRTC_TRANSPORT => {
                let n = self.transports.fetch_add(1, Ordering::SeqCst) + 1;
                let direction = if request.data["producing"] == json!(true) {
                    "send"
                } else {
                    "recv"
                };
                json!({
                    "id": format!("{}-transport-{}", direction, n),
                    "iceParameters": {"usernameFragment": "u1", "password": "p1", "iceLite": true},
                    "iceCandidates": [],
                    "dtlsParameters": {"role": "auto", "fingerprints": []},
                    "sctpParameters": null
                })
            }
            methods::PRODUCE => json!({
                "id": format!("producer-{}", request.data["kind"].as_str().unwrap_or("unknown"))
            }),
            methods::RESTART_ICE => json!({
                "iceParameters": {"usernameFragment": "u2", "password": "p2", "iceLite": true}
            }),
            _ => json!({}),
        };

        Some(Message::success(request.id, data))
    }
}

/// Accepts client connections and serves them from a [`ServerScript`]
pub struct TestServer {
    listener: MemoryListener,
    script: Arc<ServerScript>,
}

impl TestServer {
    /// Create a server and the connector clients should use
    pub fn new() -> (Self, Arc<MemoryConnector>) {
        let (connector, listener) = MemoryConnector::new();
        (
            Self {
                listener,
                script: Arc::new(ServerScript::default()),
            },
            Arc::new(connector),
        )
    }

    /// Shared answer script
    pub fn script(&self) -> &Arc<ServerScript> {
        &self.script
    }

    /// Wait for the next client connection and start serving it
    pub async fn accept(&mut self) -> ServerSession {
        let connection = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("timed out waiting for a client connection")
            .expect("connector dropped");
        ServerSession::start(connection, self.script.clone())
    }

    /// Assert that no client connects within `wait`
    pub async fn expect_no_connection(&mut self, wait: Duration) {
        if let Ok(Some(connection)) = tokio::time::timeout(wait, self.listener.accept()).await {
            panic!("unexpected connection to {}", connection.url());
        }
    }
}

/// One served client connection
///
/// Dropping the session drops the connection, which the client sees as a
/// lost WebSocket.
pub struct ServerSession {
    url: String,
    requests: Arc<Mutex<Vec<Request>>>,
    outgoing: mpsc::UnboundedSender<Message>,
    replies: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Response>>>>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl ServerSession {
    fn start(
        mut connection: sfu_room_client::signaling::MemoryConnection,
        script: Arc<ServerScript>,
    ) -> Self {
        let url = connection.url().to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let replies: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        let task = {
            let requests = requests.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        outgoing = outgoing_rx.recv() => match outgoing {
                            Some(message) => {
                                if connection.send(&message).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        incoming = connection.recv() => match incoming {
                            Some(Message::Request(request)) => {
                                debug!(method = %request.method, "Test server got request");
                                let reply = script.respond(&request);
                                requests.lock().push(request);
                                if let Some(reply) = reply {
                                    if connection.send(&reply).is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Message::Response(response)) => {
                                if let Some(tx) = replies.lock().remove(&response.id) {
                                    let _ = tx.send(response);
                                }
                            }
                            Some(Message::Notification(_)) => {}
                            None => break,
                        },
                    }
                }
            })
        };

        Self {
            url,
            requests,
            outgoing,
            replies,
            next_id: AtomicU64::new(1_000_000),
            task,
        }
    }

    /// URL the client connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Method names of all requests received so far, in arrival order
    pub fn methods(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.method.clone()).collect()
    }

    /// Requests received for `method`
    pub fn requests(&self, method: &str) -> Vec<Request> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    /// Number of requests received for `method`
    pub fn count(&self, method: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.method == method).count()
    }

    /// Push a notification to the client
    pub fn notify(&self, method: &str, data: Value) {
        self.outgoing
            .send(Message::notification(method, data))
            .expect("server session stopped");
    }

    /// Send a request to the client and wait for its response
    pub async fn request(&self, method: &str, data: Value) -> Response {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.replies.lock().insert(id, tx);
        self.outgoing
            .send(Message::request(id, method, data))
            .expect("server session stopped");

        tokio::time::timeout(WAIT, rx)
            .await
            .expect("timed out waiting for the client response")
            .expect("server session stopped")
    }

    /// Drop the connection
    pub fn disconnect(self) {}
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
