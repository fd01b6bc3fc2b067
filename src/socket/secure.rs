//! src/socket/secure.rs
//!
//! TLS WebSocket to the secure port with client-cert mutual authentication,
//! using the PKCS#12 bundle `ContextStore` exports. Grounded on
//! `xplat/Flipper/FlipperSocket.h`'s `Secure` variant contract.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::ConnectionEndpoint;
use crate::error::Result;
use crate::wire::ConnectionPayload;

use super::transport::WsTransport;
use super::{ClientIdentity, EventHandler, MessageHandler, Socket};

pub struct SecureSocket {
    transport: WsTransport,
}

impl SecureSocket {
    pub fn new(endpoint: ConnectionEndpoint, payload: ConnectionPayload, identity: ClientIdentity) -> Self {
        Self { transport: WsTransport::new(endpoint, payload, Some(identity)) }
    }
}

#[async_trait]
impl Socket for SecureSocket {
    fn set_event_handler(&self, handler: EventHandler) {
        self.transport.set_event_handler(handler);
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.transport.set_message_handler(handler);
    }

    async fn connect(&self) -> Result<bool> {
        self.transport.connect().await
    }

    async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    async fn send(&self, msg: Value) -> Result<()> {
        self.transport.send(msg).await
    }

    async fn send_expect_response(&self, msg: Value, completion: oneshot::Sender<String>) -> Result<()> {
        self.transport.send_expect_response(msg, completion).await
    }
}
