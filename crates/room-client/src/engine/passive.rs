//! Capability-only engine for signaling-only sessions

use super::{MediaEngine, MediaKind, RecvTransport, SendTransport, SendTransportListener, TransportListener};
use crate::signaling::protocol::TransportInfo;
use crate::{Error, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Engine that loads router capabilities but never carries media
///
/// Suitable for observers that join with producing and consuming disabled:
/// the room, its peers and notifications are tracked, transports are not.
#[derive(Default)]
pub struct PassiveEngine {
    capabilities: RwLock<Option<Value>>,
}

impl PassiveEngine {
    /// Create an unloaded engine
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaEngine for PassiveEngine {
    fn load(&self, router_rtp_capabilities: &Value) -> Result<Value> {
        if !router_rtp_capabilities.is_object() {
            return Err(Error::engine("router RTP capabilities must be an object"));
        }

        // Advertise no codecs: the server must never try to send us media.
        let local = serde_json::json!({
            "codecs": [],
            "headerExtensions": []
        });
        *self.capabilities.write() = Some(local.clone());
        debug!("Passive engine loaded");
        Ok(local)
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.read().is_some()
    }

    fn rtp_capabilities(&self) -> Option<Value> {
        self.capabilities.read().clone()
    }

    fn can_produce(&self, _kind: MediaKind) -> bool {
        false
    }

    fn create_send_transport(
        &self,
        _listener: Arc<dyn SendTransportListener>,
        info: &TransportInfo,
    ) -> Result<Box<dyn SendTransport>> {
        Err(Error::engine(format!(
            "passive engine cannot create send transport {}",
            info.id
        )))
    }

    fn create_recv_transport(
        &self,
        _listener: Arc<dyn TransportListener>,
        info: &TransportInfo,
    ) -> Result<Box<dyn RecvTransport>> {
        Err(Error::engine(format!(
            "passive engine cannot create recv transport {}",
            info.id
        )))
    }

    fn dispose(&self) {
        self.capabilities.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_and_dispose() {
        let engine = PassiveEngine::new();
        assert!(!engine.is_loaded());

        let local = engine.load(&json!({"codecs": [{"mimeType": "audio/opus"}]})).unwrap();
        assert!(engine.is_loaded());
        assert_eq!(local["codecs"], json!([]));
        assert!(!engine.can_produce(MediaKind::Audio));

        engine.dispose();
        assert!(!engine.is_loaded());
        assert!(engine.rtp_capabilities().is_none());
    }

    #[test]
    fn test_rejects_non_object_capabilities() {
        let engine = PassiveEngine::new();
        assert!(engine.load(&json!("nope")).is_err());
        assert!(!engine.is_loaded());
    }
}
