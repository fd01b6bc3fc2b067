//! src/socket/insecure.rs
//!
//! Plain WebSocket to the insecure port, used solely for certificate
//! enrollment. Grounded on `xplat/Flipper/FlipperSocket.h`'s `Insecure`
//! variant contract.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::ConnectionEndpoint;
use crate::error::Result;
use crate::wire::ConnectionPayload;

use super::transport::WsTransport;
use super::{EventHandler, MessageHandler, Socket};

pub struct InsecureSocket {
    transport: WsTransport,
}

impl InsecureSocket {
    pub fn new(endpoint: ConnectionEndpoint, payload: ConnectionPayload) -> Self {
        Self { transport: WsTransport::new(endpoint, payload, None) }
    }
}

#[async_trait]
impl Socket for InsecureSocket {
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
