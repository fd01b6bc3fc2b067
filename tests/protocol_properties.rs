// tests/protocol_properties.rs
//
// Property-style coverage for the registry/dispatch invariants in spec.md
// §8 (P1 registry uniqueness, P5 per-plugin ordering), driven by a
// deterministic pseudo-random interleaving rather than a crate like
// `proptest` (the teacher's dependency stack has no property-testing
// crate, so this generates its own sequences with a small seeded
// xorshift, same as `maowbot-core`'s `tests/integration` suites drive
// fixed scripted scenarios rather than fuzzing).

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use sonar_core::{Client, ClientConfig, MessageReceiver, Plugin, PluginConnection, Responder, ResponseSink, Scheduler, WorkerScheduler};
use tokio::sync::oneshot;

struct OneShotSink(Mutex<Option<oneshot::Sender<Value>>>);

impl ResponseSink for OneShotSink {
    fn send_frame(&self, frame: Value) {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(frame);
        }
    }
}

/// A `Responder` paired with a receiver of its single emitted frame, built
/// only from the crate's public API (no socket/`ConnectionManager` needed)
/// — the same shape as `client.rs`'s private `test_support::responder`,
/// reconstructed here because integration tests only see public items.
fn responder(id: Option<i64>) -> (Responder, oneshot::Receiver<Value>) {
    let (tx, rx) = oneshot::channel();
    let sink = Arc::new(OneShotSink(Mutex::new(Some(tx))));
    (Responder::new(sink, id), rx)
}

struct Xorshift(u64);

impl Xorshift {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

fn test_client() -> (Arc<Client>, std::path::PathBuf) {
    let root = std::env::temp_dir().join(format!("sonar-core-proptest-{}", uuid::Uuid::new_v4()));
    let config = ClientConfig::new(
        "localhost",
        "test-os",
        "test-device",
        "fallback-device-id",
        "TestApp",
        "com.example.test",
        &root,
    );
    let scheduler: Arc<dyn Scheduler> = Arc::new(WorkerScheduler::new());
    (Client::new(config, scheduler.clone(), scheduler), root)
}

struct NoopPlugin {
    id: String,
}

impl Plugin for NoopPlugin {
    fn identifier(&self) -> String {
        self.id.clone()
    }
    fn on_connect(&self, _connection: Arc<PluginConnection>) {}
    fn on_disconnect(&self) {}
}

/// P1: across a randomized sequence of add/remove calls against a small
/// fixed pool of identifiers (so ids collide often), the registry never
/// ends up holding two plugins under the same identifier, and the live
/// set matches a plain-Rust ground-truth model tracked alongside it.
#[tokio::test]
async fn registry_uniqueness_holds_across_randomized_add_remove_sequences() {
    let (client, root) = test_client();
    let ids = ["Cat", "Dog", "Fox", "Owl"];
    let mut rng = Xorshift::new(0xC0FFEE);
    let mut expected_present: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for _ in 0..500 {
        let id = ids[rng.below(ids.len())];
        if rng.below(2) == 0 {
            let result = client.add_plugin(Arc::new(NoopPlugin { id: id.to_string() }));
            if expected_present.contains(id) {
                assert!(result.is_err(), "adding an already-present id must be rejected");
            } else {
                assert!(result.is_ok(), "adding a fresh id must succeed");
                expected_present.insert(id);
            }
        } else {
            let result = client.remove_plugin(id);
            if expected_present.contains(id) {
                assert!(result.is_ok());
                expected_present.remove(id);
            } else {
                assert!(result.is_err(), "removing an absent id must be rejected");
            }
        }

        for &candidate in &ids {
            assert_eq!(client.has_plugin(candidate), expected_present.contains(candidate));
        }
    }

    let (responder, rx) = responder(Some(1));
    client.on_message(
        serde_json::from_value(serde_json::json!({ "id": 1, "method": "getPlugins" })).unwrap(),
        responder,
    );
    let frame = rx.await.unwrap();
    let reported: std::collections::HashSet<String> = frame["success"]["plugins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    let expected: std::collections::HashSet<String> = expected_present.iter().map(|s| s.to_string()).collect();
    assert_eq!(reported, expected);

    let _ = std::fs::remove_dir_all(root);
}

/// P5: for a plugin receiving `execute` calls interleaved with traffic
/// aimed at other plugins, the sequence of its receiver invocations
/// equals the subsequence of inbound messages that targeted it, in
/// arrival order.
#[tokio::test]
async fn per_plugin_dispatch_order_matches_arrival_order_under_interleaving() {
    let (client, root) = test_client();
    let apis = ["A", "B", "C"];
    let log: Arc<Mutex<Vec<(String, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    struct RecordingPlugin {
        id: String,
        log: Arc<Mutex<Vec<(String, i64)>>>,
    }
    impl Plugin for RecordingPlugin {
        fn identifier(&self) -> String {
            self.id.clone()
        }
        fn on_connect(&self, connection: Arc<PluginConnection>) {
            let id = self.id.clone();
            let log = self.log.clone();
            connection.receive("tick", move |params, responder| {
                let seq = params["seq"].as_i64().unwrap();
                log.lock().push((id.clone(), seq));
                responder.success(serde_json::json!({}));
                Ok(())
            });
        }
        fn on_disconnect(&self) {}
    }

    for api in apis {
        client
            .add_plugin(Arc::new(RecordingPlugin { id: api.to_string(), log: log.clone() }))
            .unwrap();
        let (responder, _rx) = responder(None);
        client.on_message(
            serde_json::from_value(serde_json::json!({ "method": "init", "params": { "plugin": api } })).unwrap(),
            responder,
        );
    }

    let mut rng = Xorshift::new(0xABCD1234);
    let mut expected_per_api: std::collections::HashMap<&str, Vec<i64>> =
        apis.iter().map(|a| (*a, Vec::new())).collect();

    for seq in 0..300i64 {
        let api = apis[rng.below(apis.len())];
        expected_per_api.get_mut(api).unwrap().push(seq);
        let (responder, _rx) = responder(Some(seq));
        client.on_message(
            serde_json::from_value(serde_json::json!({
                "id": seq,
                "method": "execute",
                "params": { "api": api, "method": "tick", "params": { "seq": seq } }
            }))
            .unwrap(),
            responder,
        );
    }

    let recorded = log.lock();
    for api in apis {
        let actual: Vec<i64> = recorded.iter().filter(|(id, _)| id == api).map(|(_, s)| *s).collect();
        assert_eq!(&actual, expected_per_api.get(api).unwrap());
    }

    let _ = std::fs::remove_dir_all(root);
}
