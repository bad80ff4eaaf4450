//! Shared fixtures for edgemux integration tests.

use edgemux::cache::{Event, EventKind};
use edgemux::negotiate::{DecodedObject, DynamicObject};
use edgemux::scheme::Resource;
use edgemux::types::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Statically registered test type for the typed decode path.
#[derive(Debug, Serialize, Deserialize)]
pub struct TestPod {
    pub metadata: ObjectMeta,
    pub spec: TestPodSpec,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPodSpec {
    pub node_name: String,
}

impl Resource for TestPod {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Pod";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Wire payload for a core-group pod.
pub fn pod_json(name: &str, namespace: &str, rv: u64) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "resourceVersion": rv.to_string()
        },
        "spec": { "nodeName": "edge-0" }
    })
}

/// Wire payload for a named-group extension object with no registered type.
pub fn widget_json(name: &str, namespace: &str, rv: u64) -> Value {
    json!({
        "apiVersion": "samplecontroller.example.com/v1",
        "kind": "Widget",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "resourceVersion": rv.to_string()
        },
        "spec": { "size": 3 }
    })
}

/// Wraps items in a List envelope anchored at `rv`.
pub fn list_envelope(kind: &str, items: Vec<Value>, rv: u64) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": kind,
        "metadata": { "resourceVersion": rv.to_string() },
        "items": items
    })
}

/// One newline-delimited watch frame.
pub fn watch_frame(kind: &str, object: Value) -> String {
    format!("{}\n", json!({ "type": kind, "object": object }))
}

/// An ERROR frame reporting an expired resource version.
pub fn expired_frame() -> String {
    watch_frame(
        "ERROR",
        json!({
            "kind": "Status",
            "code": 410,
            "reason": "Expired",
            "message": "too old resource version"
        }),
    )
}

/// Mounts the List endpoint for a collection path.
pub async fn mount_list(server: &MockServer, collection_path: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(collection_path))
        .and(query_param_is_missing("watch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Mounts the Watch endpoint for a collection path. The response body is a
/// fixed frame sequence; once it ends the client sees a disconnect and
/// retries, and already-applied versions are dropped by the cache.
pub async fn mount_watch(server: &MockServer, collection_path: &str, frames: String) {
    Mock::given(method("GET"))
        .and(path(collection_path))
        .and(query_param("watch", "true"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(frames.into_bytes(), "application/json"),
        )
        .mount(server)
        .await;
}

/// In-memory event for driving the cache and multiplexer directly.
pub fn change_event(kind: EventKind, name: &str, rv: u64) -> Event {
    let object = DynamicObject::from_value(&pod_json(name, "default", rv)).unwrap();
    Event::new(kind, DecodedObject::Dynamic(object))
}
