//! WebSocket connector (tokio-tungstenite)

use super::transport::{Connector, FrameTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info};

/// WebSocket subprotocol spoken by protoo servers
pub const PROTOO_SUBPROTOCOL: &str = "protoo";

/// Connects to a signaling server over WebSocket (ws:// or wss://)
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    subprotocol: Option<String>,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            subprotocol: Some(PROTOO_SUBPROTOCOL.to_string()),
        }
    }
}

impl WebSocketConnector {
    /// Connector negotiating the `protoo` subprotocol
    pub fn new() -> Self {
        Self::default()
    }

    /// Override (or drop) the requested subprotocol
    pub fn with_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<FrameTransport> {
        info!("Connecting to signaling server: {}", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Connect(format!("invalid url {}: {}", url, e)))?;
        if let Some(protocol) = &self.subprotocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| Error::Connect(format!("invalid subprotocol: {}", e)))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::Connect(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(text))))
            .sink_map_err(|e| Error::WebSocket(e.to_string()));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes)
                        .map_err(|e| Error::protocol(format!("binary frame is not utf-8: {}", e))),
                ),
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket close frame received: {:?}", frame);
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::WebSocket(e.to_string()))),
            })
        });

        Ok(FrameTransport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_subprotocol() {
        let connector = WebSocketConnector::new();
        assert_eq!(connector.subprotocol.as_deref(), Some(PROTOO_SUBPROTOCOL));
    }

    #[tokio::test]
    async fn test_invalid_url_fails() {
        let connector = WebSocketConnector::new().with_subprotocol(None);
        let result = connector.connect("not a url").await;
        assert!(matches!(result, Err(Error::Connect(_))));
    }
}
