//! src/responder.rs
//!
//! One-shot reply channel for an inbound request. Grounded on
//! `xplat/Flipper/FlipperResponderImpl.h` for the destructor-fires-success
//! behaviour, and on `FlipperClient::onMessageReceived`
//! (`examples/original_source/xplat/Flipper/FlipperClient.cpp`) for the
//! id-less case: the original only constructs a responder at all when the
//! inbound frame carries an `id`; an id-less dispatch gets none, so nothing
//! is ever sent back for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

/// Sink a `Responder` posts its reply frame onto. Implemented by the
/// `ConnectionManager` (delivery is scheduled onto its worker, per §4.5);
/// tests implement it directly to record frames without a live socket.
pub trait ResponseSink: Send + Sync {
    fn send_frame(&self, frame: Value);
}

/// One-shot reply to an inbound message. Exactly one of `success`/`error`
/// is ever emitted; if neither is called before the `Responder` is dropped,
/// the destructor emits an empty success so the desktop never hangs.
///
/// A `Responder` built with `id: None` is always handed to the plugin (per
/// §3: "a Responder may still be handed to the plugin") but every send —
/// `success`, `error`, and the drop-default alike — is suppressed, since
/// there is no inbound `id` for the desktop to be waiting on. This matches
/// the original, where no responder object is even constructed for an
/// id-less message.
pub struct Responder {
    sink: Arc<dyn ResponseSink>,
    id: Option<i64>,
    replied: AtomicBool,
}

impl Responder {
    pub fn new(sink: Arc<dyn ResponseSink>, id: Option<i64>) -> Self {
        Self { sink, id, replied: AtomicBool::new(false) }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn success(&self, value: Value) {
        if self.replied.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit_success(value);
    }

    pub fn error(&self, message: impl Into<String>, stacktrace: Option<String>) {
        if self.replied.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit_error(message.into(), stacktrace);
    }

    fn emit_success(&self, value: Value) {
        let Some(id) = self.id else { return };
        self.sink.send_frame(serde_json::json!({ "id": id, "success": value }));
    }

    fn emit_error(&self, message: String, stacktrace: Option<String>) {
        let Some(id) = self.id else { return };
        let body = serde_json::json!({ "message": message, "stacktrace": stacktrace });
        self.sink.send_frame(serde_json::json!({ "id": id, "error": body }));
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.replied.swap(true, Ordering::SeqCst) {
            self.emit_success(serde_json::json!({}));
        }
    }
}
