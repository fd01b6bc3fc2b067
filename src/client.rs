//! src/client.rs
//!
//! Plugin registry, top-level dispatcher and lifecycle owner, grounded on
//! `xplat/Flipper/FlipperClient.cpp`'s `addPlugin`/`removePlugin`/`onMessageReceived`
//! dispatch table and, for the "one mutex guards the registry and the
//! connection map" shape, on `maowbot-core/src/plugins/manager/core.rs`'s
//! `PluginManager`.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::ClientConfig;
use crate::connection_manager::{ConnectionManager, MessageReceiver};
use crate::context_store::ContextStore;
use crate::diagnostics::{DiagnosticState, StateElement};
use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::plugin_connection::PluginConnection;
use crate::responder::Responder;
use crate::scheduler::Scheduler;
use crate::wire::{refresh_plugins_frame, ExecuteParams, InboundMessage, PluginParam};

struct ClientState {
    plugins: IndexMap<String, Arc<dyn Plugin>>,
    connections: HashMap<String, Arc<PluginConnection>>,
}

/// Plugin registry, top-level dispatcher, and lifecycle owner. One `Client`
/// owns exactly one `ConnectionManager`.
pub struct Client {
    manager: Arc<ConnectionManager>,
    diagnostics: Arc<DiagnosticState>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        connection_worker: Arc<dyn Scheduler>,
        callback_worker: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let context_store = Arc::new(ContextStore::new(
            config.private_app_directory.clone(),
            config.app_id.clone(),
            config.device_id.clone(),
        ));
        let diagnostics = DiagnosticState::new();
        let manager =
            ConnectionManager::new(config, context_store, diagnostics.clone(), connection_worker, callback_worker);

        let client = Arc::new(Self {
            manager: manager.clone(),
            diagnostics,
            state: Mutex::new(ClientState { plugins: IndexMap::new(), connections: HashMap::new() }),
        });
        manager.set_dispatcher(client.clone());
        client
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn set_certificate_provider(&self, provider: Arc<dyn crate::connection_manager::CertificateProvider>) {
        self.manager.set_certificate_provider(provider);
    }

    pub fn start(self: &Arc<Self>) {
        self.manager.start();
    }

    pub async fn stop(self: &Arc<Self>) {
        self.manager.stop().await;
    }

    /// Inserts `plugin` into the registry. Duplicate identifiers are
    /// rejected rather than silently replacing the existing registration
    /// (§9's Open Question (b): the source throws).
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let id = plugin.identifier();
        if id.is_empty() {
            return Err(Error::Internal("plugin identifier must not be empty".into()));
        }

        let mut state = self.state.lock();
        if state.plugins.contains_key(&id) {
            return Err(Error::PluginExists(id));
        }
        state.plugins.insert(id.clone(), plugin.clone());

        let connected = self.manager.is_connected();
        if connected {
            self.manager.send(refresh_plugins_frame());
        }
        if plugin.runs_in_background() && connected && !state.connections.contains_key(&id) {
            let connection = Arc::new(PluginConnection::new(id.clone(), self.manager.clone()));
            state.connections.insert(id, connection.clone());
            plugin.on_connect(connection);
        }
        Ok(())
    }

    /// Symmetric with `add_plugin`: tears down any live connection for
    /// `identifier` and broadcasts `refreshPlugins` if connected.
    pub fn remove_plugin(&self, identifier: &str) -> Result<()> {
        let mut state = self.state.lock();
        let plugin = state
            .plugins
            .shift_remove(identifier)
            .ok_or_else(|| Error::PluginNotFound(identifier.to_string()))?;
        if state.connections.remove(identifier).is_some() {
            plugin.on_disconnect();
        }
        drop(state);

        if self.manager.is_connected() {
            self.manager.send(refresh_plugins_frame());
        }
        Ok(())
    }

    pub fn get_plugin(&self, identifier: &str) -> Option<Arc<dyn Plugin>> {
        self.state.lock().plugins.get(identifier).cloned()
    }

    pub fn has_plugin(&self, identifier: &str) -> bool {
        self.state.lock().plugins.contains_key(identifier)
    }

    pub fn state_elements(&self) -> Vec<StateElement> {
        self.diagnostics.state_elements()
    }

    pub fn state(&self) -> String {
        self.diagnostics.state()
    }

    /// Mirrors `FlipperClient::onMessageReceived`'s `init` arm: a target
    /// absent from the registry is reported back as an error (via
    /// `responder`, suppressed automatically if the inbound message carried
    /// no `id`), not merely logged. An already-active plugin is a no-op —
    /// that idempotence guards P2/P3 (at most one live connection, a
    /// balanced connect/disconnect bracket) that the original's
    /// unconditional re-`didConnect` does not.
    fn activate_plugin(&self, identifier: &str, responder: &Responder) {
        let mut state = self.state.lock();
        let Some(plugin) = state.plugins.get(identifier).cloned() else {
            warn!(plugin = identifier, "init for an unregistered plugin");
            responder.error(format!("plugin {identifier} not found for method init"), None);
            return;
        };
        if state.connections.contains_key(identifier) {
            return;
        }
        let connection = Arc::new(PluginConnection::new(identifier.to_string(), self.manager.clone()));
        state.connections.insert(identifier.to_string(), connection.clone());
        plugin.on_connect(connection);
    }

    /// Mirrors `FlipperClient::onMessageReceived`'s `deinit` arm: a target
    /// absent from the registry is an error; a registered plugin with no
    /// live connection is a silent no-op, same as the original's
    /// `disconnect()` helper.
    fn deactivate_plugin(&self, identifier: &str, responder: &Responder) {
        let mut state = self.state.lock();
        if !state.plugins.contains_key(identifier) {
            warn!(plugin = identifier, "deinit for an unregistered plugin");
            responder.error(format!("plugin {identifier} not found for method deinit"), None);
            return;
        }
        if state.connections.remove(identifier).is_some() {
            if let Some(plugin) = state.plugins.get(identifier).cloned() {
                plugin.on_disconnect();
            }
        }
    }
}

impl MessageReceiver for Client {
    fn on_message(&self, message: InboundMessage, responder: Responder) {
        match message.method.as_str() {
            "getPlugins" => {
                let ids: Vec<String> = self.state.lock().plugins.keys().cloned().collect();
                responder.success(serde_json::json!({ "plugins": ids }));
            }
            "init" => match serde_json::from_value::<PluginParam>(message.params) {
                Ok(p) => self.activate_plugin(&p.plugin, &responder),
                Err(e) => responder.error(format!("invalid init params: {e}"), None),
            },
            "deinit" => match serde_json::from_value::<PluginParam>(message.params) {
                Ok(p) => self.deactivate_plugin(&p.plugin, &responder),
                Err(e) => responder.error(format!("invalid deinit params: {e}"), None),
            },
            // Registry and connection-map lookup happen under the same
            // `state` guard that `conn.call` runs under, per §4.7 ("plugin
            // callbacks are invoked while holding the lock") — mirrors
            // `FlipperClient::onMessageReceived` holding `mutex_` across
            // `conn->call(...)`.
            "execute" => match serde_json::from_value::<ExecuteParams>(message.params) {
                Ok(p) => {
                    let state = self.state.lock();
                    match state.connections.get(&p.api).cloned() {
                        Some(conn) => conn.call(&p.method, p.params, responder),
                        None => responder.error(Error::ConnectionNotFound(p.api, p.method).to_string(), None),
                    }
                }
                Err(e) => responder.error(format!("invalid execute params: {e}"), None),
            },
            other => {
                responder.error(Error::UnknownMethod(other.to_string()).to_string(), None);
            }
        }
    }

    fn on_connected(&self) {
        let mut state = self.state.lock();
        let background_ids: Vec<String> = state
            .plugins
            .iter()
            .filter(|(_, plugin)| plugin.runs_in_background())
            .map(|(id, _)| id.clone())
            .collect();
        for id in background_ids {
            if state.connections.contains_key(&id) {
                continue;
            }
            let Some(plugin) = state.plugins.get(&id).cloned() else { continue };
            let connection = Arc::new(PluginConnection::new(id.clone(), self.manager.clone()));
            state.connections.insert(id, connection.clone());
            plugin.on_connect(connection);
        }
    }

    fn on_disconnected(&self) {
        let mut state = self.state.lock();
        let torn_down: Vec<(String, Arc<PluginConnection>)> = state.connections.drain().collect();
        for (id, _connection) in torn_down {
            if let Some(plugin) = state.plugins.get(&id).cloned() {
                plugin.on_disconnect();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    struct RecordingPlugin {
        id: String,
        background: bool,
        events: Arc<SyncMutex<Vec<String>>>,
    }

    impl Plugin for RecordingPlugin {
        fn identifier(&self) -> String {
            self.id.clone()
        }
        fn on_connect(&self, _connection: Arc<PluginConnection>) {
            self.events.lock().push(format!("{}:connect", self.id));
        }
        fn on_disconnect(&self) {
            self.events.lock().push(format!("{}:disconnect", self.id));
        }
        fn runs_in_background(&self) -> bool {
            self.background
        }
    }

    fn plugin(id: &str, background: bool, events: Arc<SyncMutex<Vec<String>>>) -> Arc<dyn Plugin> {
        Arc::new(RecordingPlugin { id: id.to_string(), background, events })
    }

    #[tokio::test]
    async fn get_plugins_reports_insertion_order() {
        let (client, root) = test_client();
        let events = Arc::new(SyncMutex::new(Vec::new()));
        client.add_plugin(plugin("Cat", false, events.clone())).unwrap();
        client.add_plugin(plugin("Dog", false, events.clone())).unwrap();

        let (responder, rx) = responder(Some(1));
        client.on_message(
            serde_json::from_value(serde_json::json!({ "method": "getPlugins", "id": 1 })).unwrap(),
            responder,
        );
        let frame = rx.await.unwrap();
        assert_eq!(frame, serde_json::json!({ "id": 1, "success": { "plugins": ["Cat", "Dog"] } }));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn duplicate_add_plugin_is_rejected() {
        let (client, root) = test_client();
        let events = Arc::new(SyncMutex::new(Vec::new()));
        client.add_plugin(plugin("Cat", false, events.clone())).unwrap();
        let err = client.add_plugin(plugin("Cat", false, events)).unwrap_err();
        assert!(matches!(err, Error::PluginExists(id) if id == "Cat"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn init_then_deinit_then_init_again_brackets_on_connect_and_on_disconnect() {
        let (client, root) = test_client();
        let events = Arc::new(SyncMutex::new(Vec::new()));
        client.add_plugin(plugin("T", false, events.clone())).unwrap();

        let (r1, _rx1) = responder(None);
        client.on_message(
            serde_json::from_value(serde_json::json!({ "method": "init", "params": { "plugin": "T" } })).unwrap(),
            r1,
        );
        let (r2, _rx2) = responder(None);
        client.on_message(
            serde_json::from_value(serde_json::json!({ "method": "deinit", "params": { "plugin": "T" } })).unwrap(),
            r2,
        );
        let (r3, _rx3) = responder(None);
        client.on_message(
            serde_json::from_value(serde_json::json!({ "method": "init", "params": { "plugin": "T" } })).unwrap(),
            r3,
        );

        assert_eq!(*events.lock(), vec!["T:connect", "T:disconnect", "T:connect"]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn execute_dispatches_to_the_registered_receiver() {
        let (client, root) = test_client();
        let events = Arc::new(SyncMutex::new(Vec::new()));

        struct PingPlugin {
            events: Arc<SyncMutex<Vec<String>>>,
        }
        impl Plugin for PingPlugin {
            fn identifier(&self) -> String {
                "T".into()
            }
            fn on_connect(&self, connection: Arc<PluginConnection>) {
                self.events.lock().push("T:connect".into());
                connection.receive("ping", |_params, responder| {
                    responder.success(serde_json::json!({ "msg": "pong" }));
                    Ok(())
                });
            }
            fn on_disconnect(&self) {}
        }

        client.add_plugin(Arc::new(PingPlugin { events: events.clone() })).unwrap();
        let (init_responder, _rx) = responder(None);
        client.on_message(
            serde_json::from_value(serde_json::json!({ "method": "init", "params": { "plugin": "T" } })).unwrap(),
            init_responder,
        );

        let (responder, rx) = responder(Some(7));
        client.on_message(
            serde_json::from_value(
                serde_json::json!({ "id": 7, "method": "execute", "params": { "api": "T", "method": "ping" } }),
            )
            .unwrap(),
            responder,
        );
        let frame = rx.await.unwrap();
        assert_eq!(frame, serde_json::json!({ "id": 7, "success": { "msg": "pong" } }));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn unknown_method_is_reported_as_an_error() {
        let (client, root) = test_client();
        let (responder, rx) = responder(Some(2));
        client.on_message(
            serde_json::from_value(serde_json::json!({ "id": 2, "method": "quux" })).unwrap(),
            responder,
        );
        let frame = rx.await.unwrap();
        assert_eq!(frame["id"], 2);
        assert_eq!(frame["error"]["message"], "Received unknown method: quux");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn execute_with_unknown_api_reports_connection_not_found() {
        let (client, root) = test_client();
        let (responder, rx) = responder(Some(3));
        client.on_message(
            serde_json::from_value(
                serde_json::json!({ "id": 3, "method": "execute", "params": { "api": "Nope", "method": "x" } }),
            )
            .unwrap(),
            responder,
        );
        let frame = rx.await.unwrap();
        assert_eq!(frame["id"], 3);
        assert!(frame["error"]["message"].as_str().unwrap().contains("Nope"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn background_plugin_activates_on_connect_and_tears_down_on_disconnect() {
        let (client, root) = test_client();
        let events = Arc::new(SyncMutex::new(Vec::new()));
        client.add_plugin(plugin("B", true, events.clone())).unwrap();

        client.on_connected();
        assert_eq!(*events.lock(), vec!["B:connect"]);

        client.on_disconnected();
        assert_eq!(*events.lock(), vec!["B:connect", "B:disconnect"]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn remove_plugin_tears_down_its_connection() {
        let (client, root) = test_client();
        let events = Arc::new(SyncMutex::new(Vec::new()));
        client.add_plugin(plugin("B", true, events.clone())).unwrap();
        client.on_connected();

        client.remove_plugin("B").unwrap();
        assert_eq!(*events.lock(), vec!["B:connect", "B:disconnect"]);
        assert!(!client.has_plugin("B"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn init_for_an_unregistered_plugin_replies_with_not_found() {
        let (client, root) = test_client();
        let (responder, rx) = responder(Some(1));
        client.on_message(
            serde_json::from_value(serde_json::json!({ "id": 1, "method": "init", "params": { "plugin": "Ghost" } }))
                .unwrap(),
            responder,
        );
        let frame = rx.await.unwrap();
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["error"]["message"], "plugin Ghost not found for method init");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn deinit_for_an_unregistered_plugin_replies_with_not_found() {
        let (client, root) = test_client();
        let (responder, rx) = responder(Some(2));
        client.on_message(
            serde_json::from_value(
                serde_json::json!({ "id": 2, "method": "deinit", "params": { "plugin": "Ghost" } }),
            )
            .unwrap(),
            responder,
        );
        let frame = rx.await.unwrap();
        assert_eq!(frame["id"], 2);
        assert_eq!(frame["error"]["message"], "plugin Ghost not found for method deinit");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn id_less_init_for_an_unregistered_plugin_emits_nothing() {
        let (client, root) = test_client();
        let (responder, rx) = responder(None);
        client.on_message(
            serde_json::from_value(serde_json::json!({ "method": "init", "params": { "plugin": "Ghost" } }))
                .unwrap(),
            responder,
        );
        // `responder` dropped when `on_message` returned above without ever
        // calling `success`/`error` on it; its `id: None` means even the
        // drop-default is suppressed, so the sender side is gone with no
        // frame ever sent — the receiver observes a closed channel.
        assert!(rx.await.is_err(), "no frame should have been sent for an id-less message");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn deinit_for_a_registered_but_inactive_plugin_is_a_silent_no_op() {
        let (client, root) = test_client();
        let events = Arc::new(SyncMutex::new(Vec::new()));
        client.add_plugin(plugin("T", false, events.clone())).unwrap();

        let (responder, rx) = responder(Some(9));
        client.on_message(
            serde_json::from_value(serde_json::json!({ "id": 9, "method": "deinit", "params": { "plugin": "T" } }))
                .unwrap(),
            responder,
        );
        let frame = rx.await.unwrap();
        assert_eq!(frame, serde_json::json!({ "id": 9, "success": {} }));
        assert!(events.lock().is_empty());
        let _ = std::fs::remove_dir_all(root);
    }
}
