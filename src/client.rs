//! Upstream transport clients.
//!
//! The [`ClientResolver`] builds, per resource type, a client bound to the
//! correct request-path prefix: `/api` for the unnamed core group, `/apis`
//! for named groups. Statically registered types get a typed client whose
//! decode errors surface directly; extension types get a dynamic client with
//! the schema-less fallback. Both variants sit behind the [`UpstreamClient`]
//! tagged union and expose the same operations.
//!
//! The wire protocol is List/Watch over HTTP with JSON encoding: List returns
//! an envelope with `items` and `metadata.resourceVersion`; Watch streams
//! newline-delimited `{"type": ..., "object": ...}` frames from
//! `?watch=true&resourceVersion=N`, and reports an invalidated version as an
//! ERROR frame (or an HTTP 410) which surfaces here as
//! [`EdgemuxError::Expired`].

use crate::cache::{Event, EventKind};
use crate::config::UpstreamConfig;
use crate::error::{EdgemuxError, Result};
use crate::negotiate::{DecodedList, DecodedObject, Negotiator};
use crate::scheme::Scheme;
use crate::types::{ResourceKey, ResourceType};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// HTTP status used by the upstream for "resourceVersion too old".
const STATUS_GONE: u16 = 410;

/// Builds transport clients bound to the correct path prefix and decoder
/// chain for each resource type.
#[derive(Debug)]
pub struct ClientResolver {
    config: UpstreamConfig,
    http: reqwest::Client,
    scheme: Arc<Scheme>,
}

impl ClientResolver {
    /// Creates a resolver. The underlying HTTP client is built once and
    /// shared by every resolved client.
    pub fn new(config: UpstreamConfig, scheme: Arc<Scheme>) -> Result<Self> {
        reqwest::Url::parse(&config.base_url).map_err(|e| {
            EdgemuxError::ClientConstruction(format!(
                "invalid upstream base URL {:?}: {}",
                config.base_url, e
            ))
        })?;

        // No client-level request timeout: the watch connection is long
        // lived. Non-streaming requests set a per-request timeout instead.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| EdgemuxError::ClientConstruction(e.to_string()))?;

        Ok(Self {
            config,
            http,
            scheme,
        })
    }

    /// Resolves a client for a resource type.
    ///
    /// Idempotent: resolving the same type twice yields functionally
    /// equivalent clients sharing one connection pool.
    pub fn resolve(&self, resource_type: &ResourceType, is_dynamic: bool) -> Result<UpstreamClient> {
        if resource_type.version.is_empty() || resource_type.resource.is_empty() {
            return Err(EdgemuxError::ClientConstruction(format!(
                "malformed resource type {}",
                resource_type
            )));
        }

        let negotiator = if is_dynamic {
            Negotiator::with_fallback(self.scheme.clone(), resource_type.clone())
        } else {
            Negotiator::strict(self.scheme.clone(), resource_type.clone())
        };

        let rest = RestClient {
            http: self.http.clone(),
            config: self.config.clone(),
            resource_type: resource_type.clone(),
            negotiator,
        };

        Ok(if is_dynamic {
            UpstreamClient::Dynamic(rest)
        } else {
            UpstreamClient::Typed(rest)
        })
    }
}

/// Transport client for one resource type: typed or dynamic, one interface.
#[derive(Debug, Clone)]
pub enum UpstreamClient {
    /// Client for a statically registered type.
    Typed(RestClient),
    /// Client for a dynamically discovered extension type.
    Dynamic(RestClient),
}

impl UpstreamClient {
    fn rest(&self) -> &RestClient {
        match self {
            UpstreamClient::Typed(rest) | UpstreamClient::Dynamic(rest) => rest,
        }
    }

    /// Whether this client serves a dynamically discovered type.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, UpstreamClient::Dynamic(_))
    }

    /// The resource type this client serves.
    pub fn resource_type(&self) -> &ResourceType {
        &self.rest().resource_type
    }

    /// Performs a full List, returning the objects and the resource version
    /// the list is anchored at.
    pub async fn list(&self) -> Result<DecodedList> {
        self.rest().list().await
    }

    /// Opens a watch stream for changes after `from_resource_version`.
    pub async fn watch(&self, from_resource_version: u64) -> Result<WatchStream> {
        self.rest().watch(from_resource_version).await
    }

    /// Creates an object upstream.
    pub async fn create(&self, object: &DecodedObject) -> Result<DecodedObject> {
        self.rest().create(object).await
    }

    /// Replaces an object upstream.
    pub async fn update(&self, key: &ResourceKey, object: &DecodedObject) -> Result<DecodedObject> {
        self.rest().update(key, object).await
    }

    /// Deletes an object upstream.
    pub async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.rest().delete(key).await
    }
}

/// REST transport for one resource type.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    config: UpstreamConfig,
    resource_type: ResourceType,
    negotiator: Negotiator,
}

impl RestClient {
    fn collection_url(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.resource_type.collection_path()
        )
    }

    fn namespaced_collection_url(&self, namespace: Option<&str>) -> String {
        let rt = &self.resource_type;
        let base = self.config.base_url.trim_end_matches('/');
        match namespace {
            Some(ns) if rt.is_core_group() => format!(
                "{}{}/{}/namespaces/{}/{}",
                base,
                rt.api_prefix(),
                rt.version,
                ns,
                rt.resource
            ),
            Some(ns) => format!(
                "{}{}/{}/{}/namespaces/{}/{}",
                base,
                rt.api_prefix(),
                rt.group,
                rt.version,
                ns,
                rt.resource
            ),
            None => self.collection_url(),
        }
    }

    fn object_url(&self, key: &ResourceKey) -> String {
        format!(
            "{}/{}",
            self.namespaced_collection_url(key.namespace.as_deref()),
            key.name
        )
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        match status.as_u16() {
            404 => Err(EdgemuxError::NotFound(format!(
                "{}: {}",
                self.resource_type, message
            ))),
            code => Err(EdgemuxError::Upstream {
                status: code,
                message,
            }),
        }
    }

    /// Performs a full List against the collection endpoint.
    pub async fn list(&self) -> Result<DecodedList> {
        let response = self
            .http
            .get(self.collection_url())
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let body: serde_json::Value = self.check(response).await?.json().await?;
        self.negotiator.decode_list(&body)
    }

    /// Opens the long-lived watch stream.
    pub async fn watch(&self, from_resource_version: u64) -> Result<WatchStream> {
        let response = self
            .http
            .get(self.collection_url())
            .query(&[
                ("watch", "true"),
                ("resourceVersion", &from_resource_version.to_string()),
                ("allowWatchBookmarks", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == STATUS_GONE {
            return Err(EdgemuxError::Expired {
                resource_version: from_resource_version,
            });
        }
        let response = self.check(response).await?;

        let stream: ByteStream =
            Box::pin(response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())));

        Ok(WatchStream {
            stream,
            buffer: Vec::new(),
            negotiator: self.negotiator.clone(),
            from_resource_version,
        })
    }

    /// Creates an object upstream. Not cached; the snapshot is updated by the
    /// corresponding event arriving on the watch path.
    pub async fn create(&self, object: &DecodedObject) -> Result<DecodedObject> {
        let body = self.encode(object)?;
        let namespace = object.metadata().namespace.clone();
        let response = self
            .http
            .post(self.namespaced_collection_url(namespace.as_deref()))
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?;
        let body: serde_json::Value = self.check(response).await?.json().await?;
        self.negotiator.decode_object(&body)
    }

    /// Replaces an object upstream.
    pub async fn update(&self, key: &ResourceKey, object: &DecodedObject) -> Result<DecodedObject> {
        let body = self.encode(object)?;
        let response = self
            .http
            .put(self.object_url(key))
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?;
        let body: serde_json::Value = self.check(response).await?.json().await?;
        self.negotiator.decode_object(&body)
    }

    /// Deletes an object upstream.
    pub async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let response = self
            .http
            .delete(self.object_url(key))
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    fn encode(&self, object: &DecodedObject) -> Result<serde_json::Value> {
        let mut body = object.to_json()?;
        // Typed objects may omit their type tags; the wire form requires them.
        if let Some(map) = body.as_object_mut() {
            let identity = object.type_identity();
            map.entry("apiVersion")
                .or_insert_with(|| serde_json::Value::String(identity.api_version.clone()));
            map.entry("kind")
                .or_insert_with(|| serde_json::Value::String(identity.kind.clone()));
        }
        Ok(body)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("resource_type", &self.resource_type)
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

type ByteStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Vec<u8>, reqwest::Error>> + Send>>;

/// Newline-delimited JSON watch frame as sent by the upstream server.
#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: serde_json::Value,
}

/// Error payload carried by an ERROR frame.
#[derive(Debug, Deserialize)]
struct WireStatus {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decoded change stream from one upstream watch connection.
pub struct WatchStream {
    stream: ByteStream,
    buffer: Vec<u8>,
    negotiator: Negotiator,
    from_resource_version: u64,
}

impl WatchStream {
    /// Reads the next event. Returns `Ok(None)` when the upstream closed the
    /// stream, and [`EdgemuxError::Expired`] when the server reports our
    /// resource version is no longer valid.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match self.decode_frame(line)? {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    fn decode_frame(&self, line: &[u8]) -> Result<Option<Event>> {
        let frame: WireFrame = serde_json::from_slice(line).map_err(|e| {
            EdgemuxError::Serialization(format!("invalid watch frame: {}", e))
        })?;

        let kind = match frame.kind.as_str() {
            "ADDED" => EventKind::Added,
            "MODIFIED" => EventKind::Modified,
            "DELETED" => EventKind::Deleted,
            "BOOKMARK" => {
                let resource_version = frame.object["metadata"]["resourceVersion"]
                    .as_str()
                    .and_then(|rv| rv.parse::<u64>().ok())
                    .ok_or_else(|| {
                        EdgemuxError::Serialization("bookmark without resourceVersion".into())
                    })?;
                return Ok(Some(Event::bookmark(resource_version)));
            }
            "ERROR" => {
                let status: WireStatus =
                    serde_json::from_value(frame.object).unwrap_or(WireStatus {
                        code: None,
                        reason: None,
                        message: None,
                    });
                let expired = status.code == Some(STATUS_GONE)
                    || matches!(status.reason.as_deref(), Some("Expired") | Some("Gone"));
                if expired {
                    return Err(EdgemuxError::Expired {
                        resource_version: self.from_resource_version,
                    });
                }
                return Err(EdgemuxError::UpstreamConnection(
                    status.message.unwrap_or_else(|| "watch error".to_string()),
                ));
            }
            other => {
                warn!(kind = %other, "Skipping unknown watch frame kind");
                return Ok(None);
            }
        };

        let object = self.negotiator.decode_object(&frame.object)?;
        Ok(Some(Event::new(kind, object)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn resolver(base_url: &str) -> ClientResolver {
        let config = UpstreamConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        ClientResolver::new(config, Arc::new(Scheme::new())).unwrap()
    }

    fn watch_stream_over(frames: &str) -> WatchStream {
        let chunks: Vec<std::result::Result<Vec<u8>, reqwest::Error>> =
            vec![Ok(frames.as_bytes().to_vec())];
        WatchStream {
            stream: Box::pin(stream::iter(chunks)),
            buffer: Vec::new(),
            negotiator: Negotiator::with_fallback(
                Arc::new(Scheme::new()),
                ResourceType::new("", "v1", "pods"),
            ),
            from_resource_version: 5,
        }
    }

    #[test]
    fn test_invalid_base_url_is_client_construction_error() {
        let config = UpstreamConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        let err = ClientResolver::new(config, Arc::new(Scheme::new())).unwrap_err();
        assert!(matches!(err, EdgemuxError::ClientConstruction(_)));
    }

    #[test]
    fn test_malformed_resource_type_rejected() {
        let resolver = resolver("http://127.0.0.1:8080");
        let err = resolver
            .resolve(&ResourceType::new("", "", "pods"), false)
            .unwrap_err();
        assert!(matches!(err, EdgemuxError::ClientConstruction(_)));
    }

    #[test]
    fn test_core_group_urls() {
        let resolver = resolver("http://127.0.0.1:8080/");
        let client = resolver
            .resolve(&ResourceType::new("", "v1", "pods"), false)
            .unwrap();
        assert!(!client.is_dynamic());

        let rest = client.rest();
        assert_eq!(rest.collection_url(), "http://127.0.0.1:8080/api/v1/pods");
        assert_eq!(
            rest.object_url(&ResourceKey::namespaced("default", "web-0")),
            "http://127.0.0.1:8080/api/v1/namespaces/default/pods/web-0"
        );
        assert_eq!(
            rest.object_url(&ResourceKey::cluster_scoped("node-1")),
            "http://127.0.0.1:8080/api/v1/pods/node-1"
        );
    }

    #[test]
    fn test_named_group_urls() {
        let resolver = resolver("http://127.0.0.1:8080");
        let client = resolver
            .resolve(
                &ResourceType::new("samplecontroller.example.com", "v1", "widgets"),
                true,
            )
            .unwrap();
        assert!(client.is_dynamic());

        let rest = client.rest();
        assert_eq!(
            rest.collection_url(),
            "http://127.0.0.1:8080/apis/samplecontroller.example.com/v1/widgets"
        );
        assert_eq!(
            rest.object_url(&ResourceKey::namespaced("edge", "w1")),
            "http://127.0.0.1:8080/apis/samplecontroller.example.com/v1/namespaces/edge/widgets/w1"
        );
    }

    #[tokio::test]
    async fn test_watch_stream_decodes_frames() {
        let frames = concat!(
            r#"{"type":"ADDED","object":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"a","resourceVersion":"6"}}}"#,
            "\n",
            r#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"9"}}}"#,
            "\n",
        );
        let mut stream = watch_stream_over(frames);

        let first = stream.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind, EventKind::Added);
        assert_eq!(first.resource_version, 6);

        let second = stream.next_event().await.unwrap().unwrap();
        assert_eq!(second.kind, EventKind::Bookmark);
        assert_eq!(second.resource_version, 9);
        assert!(second.object.is_none());

        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_stream_surfaces_expired() {
        let frames = concat!(
            r#"{"type":"ERROR","object":{"kind":"Status","code":410,"reason":"Expired","message":"too old resource version"}}"#,
            "\n",
        );
        let mut stream = watch_stream_over(frames);
        let err = stream.next_event().await.unwrap_err();
        assert!(matches!(err, EdgemuxError::Expired { resource_version: 5 }));
    }

    #[tokio::test]
    async fn test_watch_stream_reassembles_split_frames() {
        let frame = r#"{"type":"ADDED","object":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"a","resourceVersion":"6"}}}"#;
        let bytes = format!("{}\n", frame).into_bytes();
        let (head, tail) = bytes.split_at(20);
        let chunks: Vec<std::result::Result<Vec<u8>, reqwest::Error>> =
            vec![Ok(head.to_vec()), Ok(tail.to_vec())];
        let mut stream = WatchStream {
            stream: Box::pin(stream::iter(chunks)),
            buffer: Vec::new(),
            negotiator: Negotiator::with_fallback(
                Arc::new(Scheme::new()),
                ResourceType::new("", "v1", "pods"),
            ),
            from_resource_version: 0,
        };

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.resource_version, 6);
    }
}
