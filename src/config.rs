//! Gateway configuration file
//!
//! ```toml
//! [refresh]
//! period_secs = 300
//!
//! [[clusters]]
//! name = "prod"
//! kubeconfig_path = "/etc/kubegate/prod.yaml"
//! labels = { env = "prod" }
//!
//! [[clusters.dynamic_labels]]
//! name = "arch"
//! command = ["uname", "-m"]
//! period_secs = 3600
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kubegate_cache::{RefreshSettings, RenewalSettings};
use kubegate_types::{
    AwsClusterConfig, AzureClusterConfig, ClusterSource, CommandLabel, GcpClusterConfig,
    KubeCluster, ResourceMatcher,
};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub refresh: RefreshOverrides,
    #[serde(default)]
    pub renewal: RenewalOverrides,
    /// Role selection for AWS clusters
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshOverrides {
    pub period_secs: Option<u64>,
    pub backoff_step_secs: Option<u64>,
    pub attempt_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenewalOverrides {
    pub safety_margin_secs: Option<u64>,
    pub retry_interval_secs: Option<u64>,
    pub attempt_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterEntry {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub dynamic_labels: Vec<DynamicLabelEntry>,
    /// Kubeconfig file, relative paths resolve against the config file
    pub kubeconfig_path: Option<PathBuf>,
    /// Inline kubeconfig YAML
    pub kubeconfig: Option<String>,
    pub aws: Option<AwsClusterConfig>,
    pub azure: Option<AzureClusterConfig>,
    pub gcp: Option<GcpClusterConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicLabelEntry {
    pub name: String,
    pub command: Vec<String>,
    pub period_secs: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        let defaults = RefreshSettings::default();
        RefreshSettings {
            period: secs_or(self.refresh.period_secs, defaults.period),
            backoff_step: secs_or(self.refresh.backoff_step_secs, defaults.backoff_step),
            attempt_timeout: secs_or(self.refresh.attempt_timeout_secs, defaults.attempt_timeout),
        }
    }

    pub fn renewal_settings(&self) -> RenewalSettings {
        let defaults = RenewalSettings::default();
        RenewalSettings {
            safety_margin: secs_or(self.renewal.safety_margin_secs, defaults.safety_margin),
            retry_interval: secs_or(self.renewal.retry_interval_secs, defaults.retry_interval),
            attempt_timeout: secs_or(self.renewal.attempt_timeout_secs, defaults.attempt_timeout),
        }
    }
}

fn secs_or(secs: Option<u64>, default: Duration) -> Duration {
    secs.map(Duration::from_secs).unwrap_or(default)
}

impl ClusterEntry {
    /// Resolve the entry into a cluster identity. `base_dir` anchors
    /// relative kubeconfig paths.
    pub fn to_cluster(&self, base_dir: &Path) -> Result<KubeCluster> {
        let source = match (
            &self.kubeconfig_path,
            &self.kubeconfig,
            &self.aws,
            &self.azure,
            &self.gcp,
        ) {
            (Some(path), None, None, None, None) => {
                let path = base_dir.join(path);
                let raw = std::fs::read_to_string(&path).with_context(|| {
                    format!(
                        "Failed to read kubeconfig {} for cluster '{}'",
                        path.display(),
                        self.name
                    )
                })?;
                ClusterSource::Kubeconfig(raw)
            }
            (None, Some(raw), None, None, None) => ClusterSource::Kubeconfig(raw.clone()),
            (None, None, Some(aws), None, None) => ClusterSource::Aws(aws.clone()),
            (None, None, None, Some(azure), None) => ClusterSource::Azure(azure.clone()),
            (None, None, None, None, Some(gcp)) => ClusterSource::Gcp(gcp.clone()),
            _ => anyhow::bail!(
                "Cluster '{}' must set exactly one of kubeconfig_path, kubeconfig, aws, azure or gcp",
                self.name
            ),
        };

        let mut dynamic_labels = BTreeMap::new();
        for label in &self.dynamic_labels {
            if label.period_secs == 0 {
                anyhow::bail!(
                    "Dynamic label '{}' of cluster '{}' needs a positive period",
                    label.name,
                    self.name
                );
            }
            dynamic_labels.insert(
                label.name.clone(),
                CommandLabel::new(label.command.clone(), Duration::from_secs(label.period_secs)),
            );
        }

        Ok(KubeCluster::new(self.name.clone(), source)
            .with_labels(self.labels.clone())
            .with_dynamic_labels(dynamic_labels))
    }
}
