//! src/plugin_connection.rs
//!
//! Per-plugin send/receive façade, grounded on
//! `xplat/Flipper/FlipperConnectionImpl.h` (`call`, `receive`, `send`,
//! `error`) and, for the receiver-table shape, on
//! `maowbot-core/src/plugins/plugin_connection.rs`'s trait-object registry
//! pattern.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::connection_manager::ConnectionManager;
use crate::error::{Error, Result};
use crate::responder::Responder;
use crate::wire::{error_frame, execute_frame};

/// Plugin-supplied handler for a named inbound method. Returning `Err`
/// (or panicking) is caught by `call` and converted into an error response;
/// the connection survives either way.
pub type Receiver = dyn Fn(Value, Arc<Responder>) -> Result<()> + Send + Sync;

/// Created by `Client` when a plugin becomes active. Holds the method →
/// receiver table for this activation; registration is additive for the
/// connection's lifetime and the whole table goes away when the connection
/// itself is dropped (on `deinit`, plugin removal, or socket close).
pub struct PluginConnection {
    identifier: String,
    manager: Arc<ConnectionManager>,
    receivers: Mutex<IndexMap<String, Arc<Receiver>>>,
}

impl PluginConnection {
    pub fn new(identifier: String, manager: Arc<ConnectionManager>) -> Self {
        Self { identifier, manager, receivers: Mutex::new(IndexMap::new()) }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Sends `{"method":"execute","params":{"api","method","params"}}`.
    pub fn send(&self, method: &str, params: Value) {
        self.manager.send(execute_frame(&self.identifier, method, params));
    }

    /// Same shape as `send`, but `raw_json_params` is the plugin's own
    /// already-serialized params payload — callers that already have a JSON
    /// string on hand don't need to build a `serde_json::Value` first.
    pub fn send_raw(&self, method: &str, raw_json_params: &str) {
        match serde_json::from_str::<Value>(raw_json_params) {
            Ok(params) => self.send(method, params),
            Err(e) => {
                tracing::warn!(error = %e, plugin = %self.identifier, "send_raw given invalid JSON, dropping");
            }
        }
    }

    /// Emits an unsolicited `{"error":{"message","stacktrace"}}` frame.
    pub fn error(&self, message: impl Into<String>, stacktrace: Option<String>) {
        let message = message.into();
        self.manager.send(error_frame(&message, stacktrace.as_deref()));
    }

    /// Registers `handler` under `method`, replacing any prior registration
    /// for the same name.
    pub fn receive(
        &self,
        method: impl Into<String>,
        handler: impl Fn(Value, Arc<Responder>) -> Result<()> + Send + Sync + 'static,
    ) {
        self.receivers.lock().insert(method.into(), Arc::new(handler));
    }

    /// Internal dispatch entry for an inbound `execute` targeting this api.
    /// If no receiver is registered, replies with a `ReceiverNotFound`
    /// error. If the handler errors or panics, the failure is caught and
    /// converted into an error response — this connection is never torn
    /// down as a result.
    pub fn call(&self, method: &str, params: Value, responder: Responder) {
        let handler = self.receivers.lock().get(method).cloned();
        let Some(handler) = handler else {
            responder.error(Error::ReceiverNotFound(method.to_string()).to_string(), None);
            return;
        };

        debug!(plugin = %self.identifier, method, "dispatching receiver");
        let responder = Arc::new(responder);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(params, responder.clone())));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => responder.error(e.to_string(), None),
            Err(_) => responder.error(format!("receiver '{method}' panicked"), None),
        }
    }
}
