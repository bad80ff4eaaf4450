//! Core identifier and metadata types shared across edgemux.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier for a distinct kind of cluster object: (group, version, resource).
///
/// The unnamed ("core") group is represented by an empty `group` string and is
/// served under a different request-path prefix than named groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceType {
    /// API group; empty string for the core group.
    pub group: String,
    /// API version, e.g. `v1`.
    pub version: String,
    /// Plural resource name, e.g. `pods`.
    pub resource: String,
}

impl ResourceType {
    /// Creates a new resource type identifier.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// Whether this type belongs to the unnamed core group.
    pub fn is_core_group(&self) -> bool {
        self.group.is_empty()
    }

    /// Request-path prefix: `/api` for the core group, `/apis` for named groups.
    pub fn api_prefix(&self) -> &'static str {
        if self.is_core_group() {
            "/api"
        } else {
            "/apis"
        }
    }

    /// Collection path for this resource type, e.g. `/api/v1/pods` or
    /// `/apis/samplecontroller.example.com/v1/widgets`.
    pub fn collection_path(&self) -> String {
        if self.is_core_group() {
            format!("{}/{}/{}", self.api_prefix(), self.version, self.resource)
        } else {
            format!(
                "{}/{}/{}/{}",
                self.api_prefix(),
                self.group,
                self.version,
                self.resource
            )
        }
    }

    /// The `apiVersion` wire form: `v1` for core, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.is_core_group() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

/// Identity of a single object within a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Namespace; `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// Object name, unique within its namespace.
    pub name: String,
}

impl ResourceKey {
    /// Creates a namespaced key.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Creates a cluster-scoped key.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Observed type identity of a decoded object (`apiVersion` + `kind`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeIdentity {
    /// `apiVersion` as seen on the wire, e.g. `v1` or `group/v1`.
    pub api_version: String,
    /// Object kind, e.g. `Pod`.
    pub kind: String,
}

impl TypeIdentity {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Standard object metadata carried by every cluster object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Namespace; absent for cluster-scoped objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Server-assigned unique identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Per-resource-type change counter assigned by the upstream server.
    /// Encoded as a decimal string on the wire.
    #[serde(with = "resource_version_serde")]
    pub resource_version: u64,
    /// Object labels.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Server-assigned creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// The identity key for this object.
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// The upstream protocol carries resource versions as decimal strings; an
/// absent or empty field decodes as zero.
mod resource_version_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("") => Ok(0),
            Some(s) => s.parse::<u64>().map_err(de::Error::custom),
        }
    }
}

/// Selection predicate applied to object metadata on list and watch.
///
/// An empty selector matches everything. Namespace and every label entry must
/// all match for an object to be selected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Selector {
    /// Restrict to a single namespace.
    pub namespace: Option<String>,
    /// Required label key/value pairs.
    pub labels: HashMap<String, String>,
}

impl Selector {
    /// Selector matching every object.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts the selector to a namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Requires a label key/value pair.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Checks whether object metadata satisfies this selector.
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ref ns) = self.namespace {
            if meta.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }

        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_group_path() {
        let rt = ResourceType::new("", "v1", "pods");
        assert!(rt.is_core_group());
        assert_eq!(rt.api_prefix(), "/api");
        assert_eq!(rt.collection_path(), "/api/v1/pods");
        assert_eq!(rt.api_version(), "v1");
    }

    #[test]
    fn test_named_group_path() {
        let rt = ResourceType::new("samplecontroller.example.com", "v1", "widgets");
        assert!(!rt.is_core_group());
        assert_eq!(rt.api_prefix(), "/apis");
        assert_eq!(
            rt.collection_path(),
            "/apis/samplecontroller.example.com/v1/widgets"
        );
        assert_eq!(rt.api_version(), "samplecontroller.example.com/v1");
    }

    #[test]
    fn test_resource_version_wire_format() {
        let meta: ObjectMeta = serde_json::from_value(serde_json::json!({
            "name": "web-0",
            "namespace": "default",
            "resourceVersion": "1234"
        }))
        .unwrap();
        assert_eq!(meta.resource_version, 1234);

        let encoded = serde_json::to_value(&meta).unwrap();
        assert_eq!(encoded["resourceVersion"], "1234");
    }

    #[test]
    fn test_resource_version_absent_decodes_as_zero() {
        let meta: ObjectMeta =
            serde_json::from_value(serde_json::json!({ "name": "web-0" })).unwrap();
        assert_eq!(meta.resource_version, 0);
    }

    #[test]
    fn test_selector_matching() {
        let meta = ObjectMeta {
            name: "web-0".to_string(),
            namespace: Some("default".to_string()),
            labels: [("app".to_string(), "web".to_string())].into_iter().collect(),
            ..Default::default()
        };

        assert!(Selector::all().matches(&meta));
        assert!(Selector::all().with_namespace("default").matches(&meta));
        assert!(!Selector::all().with_namespace("other").matches(&meta));
        assert!(Selector::all().with_label("app", "web").matches(&meta));
        assert!(!Selector::all().with_label("app", "db").matches(&meta));
        assert!(!Selector::all()
            .with_namespace("default")
            .with_label("tier", "front")
            .matches(&meta));
    }
}
