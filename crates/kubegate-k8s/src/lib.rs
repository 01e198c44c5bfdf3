//! Kubernetes integration for kubegate
//!
//! This crate turns cluster identities into connection settings and builds
//! schema snapshots from API discovery.

pub mod cloud;
mod credentials;
mod error;
mod kubeconfig;
mod schema;

pub use credentials::{KubeCredentials, StaticCredentials};
pub use error::{Error, Result};
pub use kubeconfig::{kube_config_from_rest, kubeconfig_from_rest, load_static_kube_config};
pub use schema::{
    ClusterSchema, CodecTable, DiscoveredResource, DiscoverySchemaBuilder, GvkIndex,
    RbacResource, RbacResourceKey, RbacSupportedResources, SchemaBuilder,
};

// Re-export types used in our public API
pub use kube::core::GroupVersionKind;
pub use kubegate_types::{ApiResourceRequest, GvkKey, KubeCluster, RestConfig};
