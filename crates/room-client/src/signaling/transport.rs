//! Frame transports for the signaling channel
//!
//! A [`Connector`] opens a duplex text-frame connection. The channel does not
//! care whether frames travel over a WebSocket or an in-process pipe.

use crate::signaling::protocol::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::channel::mpsc as frame_mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outgoing half of a connection
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Incoming half of a connection; ends when the peer goes away
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open duplex text-frame connection
pub struct FrameTransport {
    /// Frames to the server
    pub sink: FrameSink,
    /// Frames from the server
    pub stream: FrameStream,
}

/// Opens signaling connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `url`
    async fn connect(&self, url: &str) -> Result<FrameTransport>;
}

/// In-process connector
///
/// Each successful [`Connector::connect`] hands a [`MemoryConnection`] to the
/// paired [`MemoryListener`], which plays the server side.
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
    failures: AtomicUsize,
}

/// Server side of a [`MemoryConnector`]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryConnection>,
}

/// One accepted in-process connection, seen from the server
///
/// Dropping it looks like a lost connection to the client.
pub struct MemoryConnection {
    url: String,
    to_client: frame_mpsc::UnboundedSender<String>,
    from_client: frame_mpsc::UnboundedReceiver<String>,
}

impl MemoryConnector {
    /// Create a connector and its listener
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                failures: AtomicUsize::new(0),
            },
            MemoryListener { accept_rx },
        )
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<FrameTransport> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!("Refusing in-memory connection to {}", url);
            return Err(Error::Connect(format!("connection to {} refused", url)));
        }

        let (to_server, from_client) = frame_mpsc::unbounded::<String>();
        let (to_client, from_server) = frame_mpsc::unbounded::<String>();

        let connection = MemoryConnection {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.accept_tx
            .send(connection)
            .map_err(|_| Error::Connect(format!("no listener for {}", url)))?;

        let sink = to_server.sink_map_err(|e| Error::WebSocket(e.to_string()));
        let stream = from_server.map(Ok);

        Ok(FrameTransport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

impl MemoryListener {
    /// Wait for the next client connection
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accept_rx.recv().await
    }
}

impl MemoryConnection {
    /// URL the client connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a raw text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.to_client
            .unbounded_send(text.into())
            .map_err(|_| Error::ChannelClosed)
    }

    /// Send a frame to the client
    pub fn send(&self, msg: &Message) -> Result<()> {
        self.send_text(msg.to_json()?)
    }

    /// Next raw text frame from the client, `None` once it hung up
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Next decodable frame from the client, `None` once it hung up
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let text = self.recv_text().await?;
            match Message::from_json(&text) {
                Ok(msg) => return Some(msg),
                Err(e) => warn!("Dropping undecodable client frame: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut transport = connector.connect("mem://room").await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.url(), "mem://room");

        transport
            .sink
            .send(Message::notification("hello", json!({})).to_json().unwrap())
            .await
            .unwrap();
        match server.recv().await.unwrap() {
            Message::Notification(n) => assert_eq!(n.method, "hello"),
            other => panic!("unexpected frame {:?}", other),
        }

        server.send_text("ping").unwrap();
        assert_eq!(transport.stream.next().await.unwrap().unwrap(), "ping");

        drop(server);
        assert!(transport.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_fail_next() {
        let (connector, _listener) = MemoryConnector::new();
        connector.fail_next(1);
        assert!(connector.connect("mem://a").await.is_err());
        assert!(connector.connect("mem://a").await.is_ok());
    }
}
