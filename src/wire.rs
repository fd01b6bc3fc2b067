//! src/wire.rs
//!
//! JSON wire types exchanged with the desktop. Grounded on
//! `xplat/Flipper/FlipperConnectionManagerImpl.cpp`'s use of `folly::dynamic`
//! to build `{method, params, id}` / `{id, success|error}` frames, and on
//! `maowbot_proto::plugs` for the "typed payload enum" shape used elsewhere
//! in the teacher for wire messages.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Certificate-exchange transport mechanism. Default is `FsAccess`: the
/// desktop delivers certificates by writing into a filesystem path visible
/// to the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Medium {
    FsAccess = 0,
    Www = 1,
}

impl Default for Medium {
    fn default() -> Self {
        Medium::FsAccess
    }
}

impl Serialize for Medium {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(*self as i32)
    }
}

impl<'de> Deserialize<'de> for Medium {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i32::deserialize(deserializer)?;
        Ok(match raw {
            1 => Medium::Www,
            _ => Medium::FsAccess,
        })
    }
}

/// First-contact handshake payload, sent as the base WebSocket connect
/// query/header data. `csr`/`csr_path` are only present on the secure
/// (post-enrollment) connect.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionPayload {
    pub os: String,
    pub device: String,
    pub device_id: String,
    pub app: String,
    pub sdk_version: u32,
    pub medium: Medium,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csr_path: Option<String>,
}

/// An inbound request from the desktop: `{method, params?, id?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteParams {
    pub api: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginParam {
    pub plugin: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl ErrorBody {
    pub fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), stacktrace: None }
    }
}

/// Builds the outbound `{"method":"execute","params":{"api","method","params"}}` frame.
pub fn execute_frame(api: &str, method: &str, params: Value) -> Value {
    serde_json::json!({
        "method": "execute",
        "params": {
            "api": api,
            "method": method,
            "params": params,
        }
    })
}

/// Builds the outbound unsolicited error frame.
pub fn error_frame(message: &str, stacktrace: Option<&str>) -> Value {
    serde_json::json!({
        "error": {
            "message": message,
            "stacktrace": stacktrace,
        }
    })
}

/// Builds the outbound `{"method":"refreshPlugins"}` frame.
pub fn refresh_plugins_frame() -> Value {
    serde_json::json!({ "method": "refreshPlugins" })
}

/// Serializes a `ConnectionPayload` into the query string carried on the
/// WebSocket connect URL, e.g. `os=...&device=...&csr=<base64>&...`.
/// Grounded on `xplat/Flipper/FlipperURLSerializer.cpp`: every field is
/// percent-encoded except `csr`, which is base64-encoded instead.
pub fn connection_payload_query(payload: &ConnectionPayload) -> String {
    use base64::Engine;

    let mut parts = Vec::with_capacity(8);
    parts.push(format!("os={}", urlencoding::encode(&payload.os)));
    parts.push(format!("device={}", urlencoding::encode(&payload.device)));
    parts.push(format!("device_id={}", urlencoding::encode(&payload.device_id)));
    parts.push(format!("app={}", urlencoding::encode(&payload.app)));
    parts.push(format!("sdk_version={}", payload.sdk_version));
    parts.push(format!("medium={}", payload.medium as i32));
    if let Some(csr) = &payload.csr {
        let encoded = base64::engine::general_purpose::STANDARD.encode(csr);
        parts.push(format!("csr={}", urlencoding::encode(&encoded)));
    }
    if let Some(csr_path) = &payload.csr_path {
        parts.push(format!("csr_path={}", urlencoding::encode(csr_path)));
    }
    parts.join("&")
}

/// Builds the `signCertificate` enrollment request.
pub fn sign_certificate_frame(csr: &str, destination: &str, medium: Medium) -> Value {
    serde_json::json!({
        "method": "signCertificate",
        "csr": csr,
        "destination": destination,
        "medium": medium as i32,
    })
}
