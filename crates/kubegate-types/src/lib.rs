//! Shared types for kubegate
//!
//! This crate contains the cluster identity, credential and resource lookup
//! types used across the kubegate crates.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// Cluster Identity
// ============================================================================

/// AWS EKS cluster coordinates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsClusterConfig {
    pub region: String,
    pub name: String,
    #[serde(default)]
    pub account_id: String,
}

/// Azure AKS cluster coordinates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureClusterConfig {
    pub subscription_id: String,
    pub resource_group: String,
    pub resource_name: String,
    #[serde(default)]
    pub tenant_id: String,
}

/// GCP GKE cluster coordinates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpClusterConfig {
    pub project_id: String,
    pub location: String,
    pub name: String,
}

/// Where the credentials of a cluster come from
#[derive(Clone, PartialEq, Eq)]
pub enum ClusterSource {
    /// Raw kubeconfig YAML with long-lived credentials
    Kubeconfig(String),
    Aws(AwsClusterConfig),
    Azure(AzureClusterConfig),
    Gcp(GcpClusterConfig),
}

impl ClusterSource {
    /// Short provider name used in logs and errors
    pub fn provider(&self) -> &'static str {
        match self {
            ClusterSource::Kubeconfig(_) => "kubeconfig",
            ClusterSource::Aws(_) => "aws",
            ClusterSource::Azure(_) => "azure",
            ClusterSource::Gcp(_) => "gcp",
        }
    }
}

// Kubeconfig contents carry secrets, only the provider is printed.
impl fmt::Debug for ClusterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterSource::Kubeconfig(_) => f.write_str("Kubeconfig(..)"),
            ClusterSource::Aws(cfg) => f.debug_tuple("Aws").field(cfg).finish(),
            ClusterSource::Azure(cfg) => f.debug_tuple("Azure").field(cfg).finish(),
            ClusterSource::Gcp(cfg) => f.debug_tuple("Gcp").field(cfg).finish(),
        }
    }
}

/// A label whose value is the output of a periodically executed command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLabel {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// How often the command is re-run
    pub period: Duration,
    /// Last observed output
    pub result: String,
}

impl CommandLabel {
    pub fn new(command: Vec<String>, period: Duration) -> Self {
        Self {
            command,
            period,
            result: String::new(),
        }
    }
}

/// A registered Kubernetes cluster
#[derive(Clone, Debug)]
pub struct KubeCluster {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub dynamic_labels: BTreeMap<String, CommandLabel>,
    pub source: ClusterSource,
}

impl KubeCluster {
    pub fn new(name: impl Into<String>, source: ClusterSource) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            dynamic_labels: BTreeMap::new(),
            source,
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_dynamic_labels(mut self, labels: BTreeMap<String, CommandLabel>) -> Self {
        self.dynamic_labels = labels;
        self
    }

    /// Static labels merged with the last results of the dynamic ones
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut all = self.labels.clone();
        for (key, label) in &self.dynamic_labels {
            all.insert(key.clone(), label.result.clone());
        }
        all
    }

    pub fn is_kubeconfig(&self) -> bool {
        matches!(self.source, ClusterSource::Kubeconfig(_))
    }

    pub fn is_aws(&self) -> bool {
        matches!(self.source, ClusterSource::Aws(_))
    }

    pub fn is_azure(&self) -> bool {
        matches!(self.source, ClusterSource::Azure(_))
    }

    pub fn is_gcp(&self) -> bool {
        matches!(self.source, ClusterSource::Gcp(_))
    }

    pub fn aws_config(&self) -> Option<&AwsClusterConfig> {
        match &self.source {
            ClusterSource::Aws(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn azure_config(&self) -> Option<&AzureClusterConfig> {
        match &self.source {
            ClusterSource::Azure(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn gcp_config(&self) -> Option<&GcpClusterConfig> {
        match &self.source {
            ClusterSource::Gcp(cfg) => Some(cfg),
            _ => None,
        }
    }
}

// ============================================================================
// REST Configuration
// ============================================================================

/// Connection settings for a Kubernetes API server as handed out by a
/// credential source. PEM data is kept raw.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RestConfig {
    pub host: String,
    pub bearer_token: Option<String>,
    pub ca_data: Option<Vec<u8>>,
    pub client_cert_data: Option<Vec<u8>>,
    pub client_key_data: Option<Vec<u8>>,
    pub tls_server_name: Option<String>,
    pub insecure_skip_tls_verify: bool,
}

impl RestConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_ca_data(mut self, ca: Vec<u8>) -> Self {
        self.ca_data = Some(ca);
        self
    }

    pub fn with_client_cert(mut self, cert: Vec<u8>, key: Vec<u8>) -> Self {
        self.client_cert_data = Some(cert);
        self.client_key_data = Some(key);
        self
    }
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("host", &self.host)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("ca_data", &self.ca_data.as_ref().map(Vec::len))
            .field("client_cert_data", &self.client_cert_data.as_ref().map(Vec::len))
            .field("client_key_data", &self.client_key_data.as_ref().map(|_| "<redacted>"))
            .field("tls_server_name", &self.tls_server_name)
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

// ============================================================================
// Resource Matchers
// ============================================================================

/// Wildcard accepted as a selector key or value
pub const WILDCARD: &str = "*";

/// Role to assume when fetching credentials for matching AWS clusters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsMatcher {
    #[serde(default)]
    pub assume_role_arn: String,
    #[serde(default)]
    pub external_id: String,
}

/// Selects clusters by label and carries per-cloud access settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMatcher {
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub aws: AwsMatcher,
}

/// Check whether `labels` satisfy every key of `selector`.
///
/// A selector value may be a literal, `*`, or a `^...$` regular expression.
/// The selector `{"*": ["*"]}` matches everything, including unlabeled
/// resources. Invalid expressions never match.
pub fn match_labels(
    selector: &BTreeMap<String, Vec<String>>,
    labels: &BTreeMap<String, String>,
) -> bool {
    if let Some(values) = selector.get(WILDCARD) {
        if selector.len() == 1 && values.len() == 1 && values[0] == WILDCARD {
            return true;
        }
    }

    selector.iter().all(|(key, values)| {
        let Some(value) = labels.get(key) else {
            return false;
        };
        values.iter().any(|candidate| match_label_value(candidate, value))
    })
}

fn match_label_value(candidate: &str, value: &str) -> bool {
    if candidate == WILDCARD || candidate == value {
        return true;
    }
    if candidate.starts_with('^') && candidate.ends_with('$') {
        return Regex::new(candidate)
            .map(|re| re.is_match(value))
            .unwrap_or(false);
    }
    false
}

// ============================================================================
// API Resource Lookups
// ============================================================================

/// The resource addressed by a proxied request path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiResourceRequest {
    /// Plural resource name, possibly with a subresource (`pods/exec`)
    pub resource_kind: String,
    pub api_group: String,
    pub api_group_version: String,
}

impl ApiResourceRequest {
    pub fn new(
        resource_kind: impl Into<String>,
        api_group: impl Into<String>,
        api_group_version: impl Into<String>,
    ) -> Self {
        Self {
            resource_kind: resource_kind.into(),
            api_group: api_group.into(),
            api_group_version: api_group_version.into(),
        }
    }
}

/// Key of the GVK index: resource name, API group and version
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GvkKey {
    pub name: String,
    pub api_group: String,
    pub version: String,
}

impl GvkKey {
    pub fn new(
        name: impl Into<String>,
        api_group: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            api_group: api_group.into(),
            version: version.into(),
        }
    }
}

impl From<&ApiResourceRequest> for GvkKey {
    /// Subresources resolve to their parent resource.
    fn from(req: &ApiResourceRequest) -> Self {
        let name = req
            .resource_kind
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            api_group: req.api_group.clone(),
            version: req.api_group_version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_match_labels_wildcard_selector() {
        assert!(match_labels(&selector(&[("*", &["*"])]), &BTreeMap::new()));
    }

    #[test]
    fn test_match_labels_literal_and_missing_key() {
        let sel = selector(&[("env", &["prod", "staging"])]);
        assert!(match_labels(&sel, &labels(&[("env", "staging")])));
        assert!(!match_labels(&sel, &labels(&[("env", "dev")])));
        assert!(!match_labels(&sel, &labels(&[("team", "infra")])));
    }

    #[test]
    fn test_match_labels_value_wildcard_and_regex() {
        assert!(match_labels(
            &selector(&[("env", &["*"])]),
            &labels(&[("env", "anything")])
        ));
        assert!(match_labels(
            &selector(&[("region", &["^us-.*$"])]),
            &labels(&[("region", "us-west-2")])
        ));
        assert!(!match_labels(
            &selector(&[("region", &["^us-.*$"])]),
            &labels(&[("region", "eu-west-1")])
        ));
        // unterminated class never matches
        assert!(!match_labels(
            &selector(&[("region", &["^[us$"])]),
            &labels(&[("region", "us")])
        ));
    }

    #[test]
    fn test_all_labels_merges_dynamic_results() {
        let mut dynamic = BTreeMap::new();
        let mut label = CommandLabel::new(vec!["uname".into()], Duration::from_secs(60));
        label.result = "Linux".into();
        dynamic.insert("os".to_string(), label);

        let cluster = KubeCluster::new("c1", ClusterSource::Kubeconfig(String::new()))
            .with_labels(labels(&[("env", "prod")]))
            .with_dynamic_labels(dynamic);

        let all = cluster.all_labels();
        assert_eq!(all.get("env").map(String::as_str), Some("prod"));
        assert_eq!(all.get("os").map(String::as_str), Some("Linux"));
    }

    #[test]
    fn test_gvk_key_strips_subresource() {
        let req = ApiResourceRequest::new("pods/exec", "", "v1");
        assert_eq!(GvkKey::from(&req), GvkKey::new("pods", "", "v1"));
    }

    #[test]
    fn test_rest_config_debug_redacts_secrets() {
        let cfg = RestConfig::new("https://example:6443").with_bearer_token("s3cret");
        let out = format!("{:?}", cfg);
        assert!(!out.contains("s3cret"));
        assert!(out.contains("<redacted>"));
    }
}
