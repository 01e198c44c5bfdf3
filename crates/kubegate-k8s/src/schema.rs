//! Cluster schema snapshots
//!
//! A [`ClusterSchema`] is built from API discovery and answers three
//! questions for proxied requests: which kinds can be decoded, which
//! resources RBAC can reason about, and which GVK a request path refers to.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use parking_lot::Mutex;
use tracing::debug;

use kubegate_types::GvkKey;

use crate::error::{Error, Result};

// ============================================================================
// Codec Table
// ============================================================================

/// Kinds the gateway can decode and encode for a cluster
#[derive(Clone, Debug, Default)]
pub struct CodecTable {
    kinds: HashMap<GroupVersionKind, ApiResource>,
}

impl CodecTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: ApiResource) {
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        self.kinds.insert(gvk, resource);
    }

    pub fn resource(&self, gvk: &GroupVersionKind) -> Option<&ApiResource> {
        self.kinds.get(gvk)
    }

    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains_key(gvk)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Decode a JSON body of a registered kind
    pub fn decode(&self, body: &[u8]) -> Result<DynamicObject> {
        let object: DynamicObject =
            serde_json::from_slice(body).map_err(|e| Error::Codec(e.to_string()))?;
        let gvk = object_gvk(&object)?;
        if !self.contains(&gvk) {
            return Err(Error::Codec(format!(
                "no codec registered for {}/{} {}",
                gvk.group, gvk.version, gvk.kind
            )));
        }
        Ok(object)
    }

    /// Encode an object of a registered kind as JSON
    pub fn encode(&self, object: &DynamicObject) -> Result<Vec<u8>> {
        let gvk = object_gvk(object)?;
        if !self.contains(&gvk) {
            return Err(Error::Codec(format!(
                "no codec registered for {}/{} {}",
                gvk.group, gvk.version, gvk.kind
            )));
        }
        serde_json::to_vec(object).map_err(|e| Error::Codec(e.to_string()))
    }
}

fn object_gvk(object: &DynamicObject) -> Result<GroupVersionKind> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| Error::Codec("object is missing apiVersion and kind".to_string()))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

// ============================================================================
// RBAC Supported Resources
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RbacResourceKey {
    pub api_group: String,
    /// Plural resource name
    pub resource: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RbacResource {
    pub kind: String,
    pub namespaced: bool,
}

/// Resources the gateway is prepared to authorize against
#[derive(Clone, Debug, Default)]
pub struct RbacSupportedResources {
    resources: HashMap<RbacResourceKey, RbacResource>,
}

impl RbacSupportedResources {
    pub fn insert(&mut self, api_group: &str, resource: &str, kind: &str, namespaced: bool) {
        self.resources.insert(
            RbacResourceKey {
                api_group: api_group.to_string(),
                resource: resource.to_string(),
            },
            RbacResource {
                kind: kind.to_string(),
                namespaced,
            },
        );
    }

    pub fn get(&self, api_group: &str, resource: &str) -> Option<&RbacResource> {
        self.resources.get(&RbacResourceKey {
            api_group: api_group.to_string(),
            resource: resource.to_string(),
        })
    }

    pub fn is_namespaced(&self, api_group: &str, resource: &str) -> Option<bool> {
        self.get(api_group, resource).map(|r| r.namespaced)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RbacResourceKey, &RbacResource)> {
        self.resources.iter()
    }
}

// ============================================================================
// Cluster Schema
// ============================================================================

/// Lookup from (resource, group, version) to the canonical GVK
pub type GvkIndex = HashMap<GvkKey, GroupVersionKind>;

/// One resource reported by API discovery
#[derive(Clone, Debug)]
pub struct DiscoveredResource {
    pub resource: ApiResource,
    pub namespaced: bool,
    pub verbs: Vec<String>,
    /// Served from the group's preferred version
    pub preferred: bool,
}

/// Immutable schema snapshot of a cluster, swapped as a unit
#[derive(Clone, Debug, Default)]
pub struct ClusterSchema {
    pub codecs: Arc<CodecTable>,
    pub rbac_supported: Arc<RbacSupportedResources>,
    pub gvk_index: Arc<GvkIndex>,
}

impl ClusterSchema {
    /// Build the snapshot from discovery output.
    ///
    /// Codecs and GVK lookups cover every served version; RBAC only tracks
    /// the preferred version of resources that expose at least one verb.
    pub fn from_discovered(resources: impl IntoIterator<Item = DiscoveredResource>) -> Self {
        let mut codecs = CodecTable::new();
        let mut rbac_supported = RbacSupportedResources::default();
        let mut gvk_index = GvkIndex::new();

        for discovered in resources {
            let ar = discovered.resource;
            gvk_index.insert(
                GvkKey::new(&ar.plural, &ar.group, &ar.version),
                GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind),
            );
            if discovered.preferred && !discovered.verbs.is_empty() {
                rbac_supported.insert(&ar.group, &ar.plural, &ar.kind, discovered.namespaced);
            }
            codecs.register(ar);
        }

        Self {
            codecs: Arc::new(codecs),
            rbac_supported: Arc::new(rbac_supported),
            gvk_index: Arc::new(gvk_index),
        }
    }

    pub fn gvk(&self, key: &GvkKey) -> Option<GroupVersionKind> {
        self.gvk_index.get(key).cloned()
    }
}

// ============================================================================
// Schema Builders
// ============================================================================

/// Introspects a live cluster. Either call may fail when the cluster is
/// unreachable.
pub trait SchemaBuilder: Send + Sync {
    fn build<'a>(
        &'a self,
        cluster_name: &'a str,
        config: Arc<kube::Config>,
    ) -> BoxFuture<'a, Result<ClusterSchema>>;

    /// `git_version` of the API server
    fn server_version<'a>(
        &'a self,
        cluster_name: &'a str,
        config: Arc<kube::Config>,
    ) -> BoxFuture<'a, Result<String>>;

    /// Release cached clients
    fn close(&self) {}
}

/// [`SchemaBuilder`] backed by kube API discovery.
///
/// Keeps one client per connection settings; a renewed config gets a new
/// client.
#[derive(Default)]
pub struct DiscoverySchemaBuilder {
    client: Mutex<Option<(Arc<kube::Config>, kube::Client)>>,
}

impl DiscoverySchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, cluster_name: &str, config: Arc<kube::Config>) -> Result<kube::Client> {
        let mut cached = self.client.lock();
        if let Some((cached_config, client)) = cached.as_ref() {
            if Arc::ptr_eq(cached_config, &config) {
                return Ok(client.clone());
            }
        }

        let client = kube::Client::try_from((*config).clone())
            .map_err(|e| Error::connection("create API client", cluster_name, e))?;
        debug!(cluster = %cluster_name, "created API client");
        *cached = Some((config, client.clone()));
        Ok(client)
    }
}

impl SchemaBuilder for DiscoverySchemaBuilder {
    fn build<'a>(
        &'a self,
        cluster_name: &'a str,
        config: Arc<kube::Config>,
    ) -> BoxFuture<'a, Result<ClusterSchema>> {
        Box::pin(async move {
            let client = self.client_for(cluster_name, config)?;
            let discovery = Discovery::new(client)
                .run()
                .await
                .map_err(|e| Error::connection("discover API resources", cluster_name, e))?;

            let mut resources = Vec::new();
            for group in discovery.groups() {
                let preferred = group.preferred_version_or_latest();
                for version in group.versions() {
                    for (ar, caps) in group.versioned_resources(version) {
                        resources.push(DiscoveredResource {
                            namespaced: matches!(caps.scope, Scope::Namespaced),
                            verbs: caps.operations.clone(),
                            preferred: version == preferred,
                            resource: ar,
                        });
                    }
                }
            }

            debug!(
                cluster = %cluster_name,
                resources = resources.len(),
                "discovered API resources"
            );
            Ok(ClusterSchema::from_discovered(resources))
        })
    }

    fn server_version<'a>(
        &'a self,
        cluster_name: &'a str,
        config: Arc<kube::Config>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let client = self.client_for(cluster_name, config)?;
            let info = client
                .apiserver_version()
                .await
                .map_err(|e| Error::connection("get server version", cluster_name, e))?;
            Ok(info.git_version)
        })
    }

    fn close(&self) {
        self.client.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{}/{}", group, version)
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version,
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    fn discovered(ar: ApiResource, preferred: bool, verbs: &[&str]) -> DiscoveredResource {
        DiscoveredResource {
            resource: ar,
            namespaced: true,
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            preferred,
        }
    }

    fn sample_schema() -> ClusterSchema {
        ClusterSchema::from_discovered(vec![
            discovered(resource("", "v1", "Pod", "pods"), true, &["get", "list"]),
            discovered(
                resource("apps", "v1", "Deployment", "deployments"),
                true,
                &["get", "list", "watch"],
            ),
            discovered(
                resource("autoscaling", "v1", "HorizontalPodAutoscaler", "horizontalpodautoscalers"),
                false,
                &["get"],
            ),
            discovered(resource("", "v1", "Binding", "bindings"), true, &[]),
        ])
    }

    #[test]
    fn test_gvk_index_covers_all_versions() {
        let schema = sample_schema();
        let gvk = schema
            .gvk(&GvkKey::new("horizontalpodautoscalers", "autoscaling", "v1"))
            .unwrap();
        assert_eq!(gvk.kind, "HorizontalPodAutoscaler");
        assert!(schema.gvk(&GvkKey::new("widgets", "example.com", "v1")).is_none());
    }

    #[test]
    fn test_rbac_only_tracks_preferred_resources_with_verbs() {
        let schema = sample_schema();
        let rbac = &schema.rbac_supported;
        assert_eq!(rbac.get("apps", "deployments").unwrap().kind, "Deployment");
        assert_eq!(rbac.is_namespaced("", "pods"), Some(true));
        assert!(rbac.get("autoscaling", "horizontalpodautoscalers").is_none());
        assert!(rbac.get("", "bindings").is_none());
        assert_eq!(rbac.len(), 2);
    }

    #[test]
    fn test_codec_decodes_registered_kind() {
        let schema = sample_schema();
        let body = br#"{"apiVersion":"apps/v1","kind":"Deployment","metadata":{"name":"web"},"spec":{"replicas":2}}"#;
        let object = schema.codecs.decode(body).unwrap();
        assert_eq!(object.metadata.name.as_deref(), Some("web"));
        assert_eq!(object.data["spec"]["replicas"], 2);

        let encoded = schema.codecs.encode(&object).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["kind"], "Deployment");
    }

    #[test]
    fn test_codec_rejects_unknown_kind() {
        let schema = sample_schema();
        let body = br#"{"apiVersion":"example.com/v1","kind":"Widget","metadata":{"name":"w"}}"#;
        assert!(matches!(schema.codecs.decode(body), Err(Error::Codec(_))));

        let body = br#"{"metadata":{"name":"w"}}"#;
        assert!(matches!(schema.codecs.decode(body), Err(Error::Codec(_))));
    }
}
