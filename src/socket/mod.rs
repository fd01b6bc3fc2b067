//! src/socket/mod.rs
//!
//! Pluggable transport interface, grounded on `xplat/Flipper/FlipperSocket.h`
//! (the interface shape) and `xplat/Flipper/FlipperSocketProvider.h` (the
//! process-singleton factory). The WebSocket/TLS plumbing itself is
//! generalized from `maowbot-core`'s `platforms::vrchat_pipeline::runtime`
//! (read loop over a split WS stream) and `platforms::twitch_irc::client`
//! (native-tls connector setup).

mod insecure;
mod secure;
mod transport;

pub use insecure::InsecureSocket;
pub use secure::SecureSocket;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::ConnectionEndpoint;
use crate::error::{Error, Result};
use crate::wire::ConnectionPayload;

/// 2^53 - 1: the largest integer a JS `number` represents exactly. Both ends
/// of this protocol are desktop JS/TS tooling, so payloads above this size
/// are refused locally instead of risking silent truncation on the other
/// side.
pub const MAX_PAYLOAD_BYTES: u64 = (1u64 << 53) - 1;

/// Events delivered asynchronously to the owning `ConnectionManager`.
/// Exactly one `Open` precedes any message; exactly one of
/// `Close`/`Error`/`SslError` terminates the socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Open,
    Close,
    Error(String),
    /// Distinguished from `Error` so the manager can avoid treating a
    /// transient SSL/handshake fault (e.g. clock skew) as a failed
    /// connection attempt that would trigger re-enrollment.
    SslError(String),
}

pub type EventHandler = Arc<dyn Fn(SocketEvent) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Client-certificate identity used by `Secure` sockets: a PKCS#12 archive
/// path plus its password, as produced by `ContextStore::export_pkcs12`.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub pkcs12_path: PathBuf,
    pub pkcs12_password: String,
}

#[async_trait]
pub trait Socket: Send + Sync {
    fn set_event_handler(&self, handler: EventHandler);
    fn set_message_handler(&self, handler: MessageHandler);
    async fn connect(&self) -> Result<bool>;
    async fn disconnect(&self);
    async fn send(&self, msg: Value) -> Result<()>;
    /// Routes the *next* inbound text frame to `completion` instead of the
    /// regular message handler. One-shot; used only during enrollment.
    async fn send_expect_response(&self, msg: Value, completion: oneshot::Sender<String>) -> Result<()>;
}

pub(crate) fn check_payload_size(msg: &Value) -> Result<String> {
    let serialized = serde_json::to_string(msg)?;
    if serialized.len() as u64 > MAX_PAYLOAD_BYTES {
        return Err(Error::Transport(format!(
            "payload of {} bytes exceeds the {}-byte limit",
            serialized.len(),
            MAX_PAYLOAD_BYTES
        )));
    }
    Ok(serialized)
}

/// Selects and constructs the `Insecure`/`Secure` socket variant. Swappable
/// so tests can install a mock transport.
pub trait SocketFactory: Send + Sync {
    fn create_insecure(&self, endpoint: ConnectionEndpoint, payload: ConnectionPayload) -> Arc<dyn Socket>;
    fn create_secure(
        &self,
        endpoint: ConnectionEndpoint,
        payload: ConnectionPayload,
        identity: ClientIdentity,
    ) -> Arc<dyn Socket>;
}

struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn create_insecure(&self, endpoint: ConnectionEndpoint, payload: ConnectionPayload) -> Arc<dyn Socket> {
        Arc::new(InsecureSocket::new(endpoint, payload))
    }

    fn create_secure(
        &self,
        endpoint: ConnectionEndpoint,
        payload: ConnectionPayload,
        identity: ClientIdentity,
    ) -> Arc<dyn Socket> {
        Arc::new(SecureSocket::new(endpoint, payload, identity))
    }
}

static SOCKET_FACTORY: Lazy<Mutex<Arc<dyn SocketFactory>>> =
    Lazy::new(|| Mutex::new(Arc::new(DefaultSocketFactory)));

/// Process-wide singleton that constructs sockets. Production code never
/// touches this directly; `ConnectionManager` goes through `SocketProvider`.
pub struct SocketProvider;

impl SocketProvider {
    /// Installs a custom factory, e.g. a test double. Affects every
    /// `ConnectionManager` in the process from this point on.
    pub fn set_factory(factory: Arc<dyn SocketFactory>) {
        *SOCKET_FACTORY.lock() = factory;
    }

    pub fn create_insecure(endpoint: ConnectionEndpoint, payload: ConnectionPayload) -> Arc<dyn Socket> {
        let factory = SOCKET_FACTORY.lock().clone();
        factory.create_insecure(endpoint, payload)
    }

    pub fn create_secure(
        endpoint: ConnectionEndpoint,
        payload: ConnectionPayload,
        identity: ClientIdentity,
    ) -> Arc<dyn Socket> {
        let factory = SOCKET_FACTORY.lock().clone();
        factory.create_secure(endpoint, payload, identity)
    }
}
