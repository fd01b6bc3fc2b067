//! src/socket/transport.rs
//!
//! Shared WebSocket read/write plumbing used by both `Insecure` and
//! `Secure` sockets. Generalized from `maowbot-core`'s
//! `platforms::vrchat_pipeline::runtime::start_websocket_task` (split
//! stream, `tokio::select!` read loop with a shutdown oneshot) and
//! `platforms::twitch_irc::client` (native-tls connector construction).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::{
    handshake::client::generate_key,
    http::{header, Request, Uri},
    protocol::Message as WsMessage,
};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ConnectionEndpoint;
use crate::error::{Error, Result};
use crate::wire::{connection_payload_query, ConnectionPayload};

use super::{check_payload_size, ClientIdentity, EventHandler, MessageHandler, SocketEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = futures_util::stream::SplitSink<WsStream, WsMessage>;

pub(crate) struct WsTransport {
    endpoint: ConnectionEndpoint,
    payload: ConnectionPayload,
    identity: Option<ClientIdentity>,
    event_handler: Arc<SyncMutex<Option<EventHandler>>>,
    message_handler: Arc<SyncMutex<Option<MessageHandler>>>,
    pending_response: Arc<AsyncMutex<Option<oneshot::Sender<String>>>>,
    writer: Arc<AsyncMutex<Option<WsWriter>>>,
    read_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: SyncMutex<Option<oneshot::Sender<()>>>,
}

impl WsTransport {
    pub fn new(endpoint: ConnectionEndpoint, payload: ConnectionPayload, identity: Option<ClientIdentity>) -> Self {
        Self {
            endpoint,
            payload,
            identity,
            event_handler: Arc::new(SyncMutex::new(None)),
            message_handler: Arc::new(SyncMutex::new(None)),
            pending_response: Arc::new(AsyncMutex::new(None)),
            writer: Arc::new(AsyncMutex::new(None)),
            read_task: SyncMutex::new(None),
            shutdown: SyncMutex::new(None),
        }
    }

    pub fn set_event_handler(&self, handler: EventHandler) {
        *self.event_handler.lock() = Some(handler);
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.message_handler.lock() = Some(handler);
    }

    fn url(&self) -> String {
        let scheme = if self.endpoint.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/?{}",
            self.endpoint.host,
            self.endpoint.port,
            connection_payload_query(&self.payload)
        )
    }

    pub async fn connect(&self) -> Result<bool> {
        let uri: Uri = self
            .url()
            .parse()
            .map_err(|e| Error::Transport(format!("invalid socket URL: {e}")))?;

        let key = generate_key();
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::HOST, format!("{}:{}", self.endpoint.host, self.endpoint.port))
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, key)
            .body(())
            .map_err(|e| Error::Transport(format!("failed to build handshake request: {e}")))?;

        let connector = if self.endpoint.secure {
            Some(Connector::NativeTls(self.build_tls_connector()?))
        } else {
            None
        };

        let connect_result = connect_async_tls_with_config(request, None, false, connector).await;

        let (stream, _response) = match connect_result {
            Ok(pair) => pair,
            Err(e) => {
                let message = e.to_string();
                if is_ssl_related(&message) {
                    warn!(error = %message, "TLS handshake failed");
                    self.emit_event(SocketEvent::SslError(message));
                } else {
                    warn!(error = %message, "socket connect failed");
                    self.emit_event(SocketEvent::Error(message));
                }
                return Ok(false);
            }
        };

        let (write_half, mut read_half) = stream.split();
        *self.writer.lock().await = Some(write_half);

        info!(host = %self.endpoint.host, port = self.endpoint.port, secure = self.endpoint.secure, "socket open");
        self.emit_event(SocketEvent::Open);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown.lock() = Some(shutdown_tx);

        let event_handler = self.event_handler.clone();
        let message_handler = self.message_handler.clone();
        let pending_response = self.pending_response.clone();
        let writer = self.writer.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_msg = read_half.next() => {
                        match maybe_msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                let text = text.to_string();
                                let completion = pending_response.lock().await.take();
                                if let Some(completion) = completion {
                                    let _ = completion.send(text);
                                } else if let Some(handler) = message_handler.lock().clone() {
                                    debug!(len = text.len(), "inbound frame");
                                    handler(text);
                                }
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                debug!(?frame, "socket closed by peer");
                                break;
                            }
                            Some(Ok(_other)) => {
                                // ping/pong/binary: not part of this protocol
                            }
                            Some(Err(e)) => {
                                let message = e.to_string();
                                if let Some(handler) = event_handler.lock().clone() {
                                    if is_ssl_related(&message) {
                                        handler(SocketEvent::SslError(message));
                                    } else {
                                        handler(SocketEvent::Error(message));
                                    }
                                }
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            *writer.lock().await = None;
            if let Some(handler) = event_handler.lock().clone() {
                handler(SocketEvent::Close);
            }
        });

        *self.read_task.lock() = Some(handle);
        Ok(true)
    }

    pub async fn disconnect(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        let task = self.read_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *self.writer.lock().await = None;
    }

    pub async fn send(&self, msg: serde_json::Value) -> Result<()> {
        let serialized = check_payload_size(&msg)?;
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                writer.send(WsMessage::Text(serialized.into())).await?;
                Ok(())
            }
            None => Err(Error::Transport("socket is not connected".into())),
        }
    }

    pub async fn send_expect_response(&self, msg: serde_json::Value, completion: oneshot::Sender<String>) -> Result<()> {
        let serialized = check_payload_size(&msg)?;
        *self.pending_response.lock().await = Some(completion);
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                writer.send(WsMessage::Text(serialized.into())).await?;
                Ok(())
            }
            None => {
                self.pending_response.lock().await.take();
                Err(Error::Transport("socket is not connected".into()))
            }
        }
    }

    fn emit_event(&self, event: SocketEvent) {
        if let Some(handler) = self.event_handler.lock().clone() {
            handler(event);
        }
    }

    fn build_tls_connector(&self) -> Result<native_tls::TlsConnector> {
        let mut builder = native_tls::TlsConnector::builder();
        // The desktop's CA is self-signed and provisioned by us via
        // ContextStore; chain-of-trust and hostname checks against a public
        // root store don't apply here.
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);

        if let Some(identity) = &self.identity {
            let der = std::fs::read(&identity.pkcs12_path)?;
            let identity = native_tls::Identity::from_pkcs12(&der, &identity.pkcs12_password)?;
            builder.identity(identity);
        }

        Ok(builder.build()?)
    }
}

fn is_ssl_related(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake")
}
