//! src/plugin.rs
//!
//! Polymorphic plugin entity, grounded on `xplat/Flipper/FlipperPlugin.h`'s
//! virtual interface (`identifier`, `didConnect`, `didDisconnect`,
//! `runInBackground`) and, in Rust shape, on the `PluginConnection` trait
//! object style used by `maowbot-core/src/plugins/plugin_connection.rs`.
//!
//! Callbacks are synchronous and are invoked by `Client` while holding its
//! internal registry lock (see `crate::client`) — a plugin implementation
//! must not call back into `Client` from within `on_connect`/`on_disconnect`
//! on the same thread.

use std::sync::Arc;

use crate::plugin_connection::PluginConnection;

/// A capability the embedding application registers with a `Client`.
///
/// `identifier()` must be stable and non-empty for the lifetime of the
/// plugin; it is the key `Client` uses for its registry and for routing
/// `execute`/`init`/`deinit` messages.
pub trait Plugin: Send + Sync {
    fn identifier(&self) -> String;

    /// Invoked when this plugin becomes active: either in response to an
    /// inbound `init` (non-background plugins) or at `Client::start`/socket
    /// `Open` (background plugins). `connection` is the façade this plugin
    /// uses to talk back to its desktop counterpart.
    fn on_connect(&self, connection: Arc<PluginConnection>);

    /// Invoked when this plugin's connection is torn down (`deinit`,
    /// removal, or socket close). Always paired with a preceding
    /// `on_connect` for the same activation.
    fn on_disconnect(&self);

    /// If true, this plugin is activated as soon as the socket connects,
    /// without waiting for an inbound `init`.
    fn runs_in_background(&self) -> bool {
        false
    }
}
