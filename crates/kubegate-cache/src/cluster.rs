//! Per-cluster details: credentials, schema snapshot and refresh lifecycle
//!
//! A [`ClusterDetails`] is created when a cluster is registered and closed
//! when it is removed. In between, a background task keeps the schema
//! snapshot fresh, backing off while the cluster is unreachable. Readers
//! only ever see whole snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubegate_k8s::{
    ApiResourceRequest, ClusterSchema, CodecTable, DiscoverySchemaBuilder, Error,
    GroupVersionKind, GvkKey, KubeCluster, KubeCredentials, RbacSupportedResources, Result,
    SchemaBuilder, StaticCredentials,
};
use kubegate_types::{ClusterSource, ResourceMatcher};

use crate::backoff::{BACKOFF_REFRESH_STEP, DEFAULT_REFRESH_PERIOD, RefreshBackoff};
use crate::clock::{Clock, SystemClock, with_timeout};
use crate::cloud::{
    CloudClients, aws_rest_config_client, azure_rest_config_client, gcp_rest_config_client,
};
use crate::dynamic_creds::{DynamicCredentials, RenewalSettings};
use crate::labels::DynamicLabels;
use crate::task::join_task;

/// Schema refresh timing
#[derive(Clone, Debug)]
pub struct RefreshSettings {
    /// Interval while the cluster is online
    pub period: Duration,
    /// Backoff increment while the cluster is offline
    pub backoff_step: Duration,
    /// Upper bound for a single schema build or version probe
    pub attempt_timeout: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            period: DEFAULT_REFRESH_PERIOD,
            backoff_step: BACKOFF_REFRESH_STEP,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RefreshSettings {
    /// Backoff policy for these settings; zero timings are rejected
    pub fn backoff(&self) -> Result<RefreshBackoff> {
        if self.attempt_timeout.is_zero() {
            return Err(Error::bad_parameter("refresh attempt timeout must be positive"));
        }
        RefreshBackoff::new(self.period, self.backoff_step)
    }
}

/// Everything needed to register a cluster
#[derive(Clone)]
pub struct ClusterDetailsConfig {
    pub cluster: KubeCluster,
    /// Pre-built credentials; when unset they are derived from the cluster source
    pub credentials: Option<Arc<dyn KubeCredentials>>,
    pub cloud_clients: CloudClients,
    /// Decide which role to assume for AWS clusters
    pub resource_matchers: Vec<ResourceMatcher>,
    pub clock: Arc<dyn Clock>,
    /// When unset each cluster gets its own [`DiscoverySchemaBuilder`]
    pub schema_builder: Option<Arc<dyn SchemaBuilder>>,
    pub refresh: RefreshSettings,
    pub renewal: RenewalSettings,
}

impl ClusterDetailsConfig {
    pub fn new(cluster: KubeCluster) -> Self {
        Self {
            cluster,
            credentials: None,
            cloud_clients: CloudClients::default(),
            resource_matchers: Vec::new(),
            clock: Arc::new(SystemClock),
            schema_builder: None,
            refresh: RefreshSettings::default(),
            renewal: RenewalSettings::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn KubeCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_cloud_clients(mut self, cloud_clients: CloudClients) -> Self {
        self.cloud_clients = cloud_clients;
        self
    }

    pub fn with_resource_matchers(mut self, matchers: Vec<ResourceMatcher>) -> Self {
        self.resource_matchers = matchers;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_schema_builder(mut self, builder: Arc<dyn SchemaBuilder>) -> Self {
        self.schema_builder = Some(builder);
        self
    }

    pub fn with_refresh(mut self, refresh: RefreshSettings) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_renewal(mut self, renewal: RenewalSettings) -> Self {
        self.renewal = renewal;
        self
    }
}

/// Credentials for a cluster: the supplied ones if any, otherwise chosen
/// from the cluster source
pub async fn get_kube_cluster_credentials(
    cfg: &ClusterDetailsConfig,
) -> Result<Arc<dyn KubeCredentials>> {
    if let Some(credentials) = &cfg.credentials {
        return Ok(Arc::clone(credentials));
    }

    let cluster = &cfg.cluster;
    let unsupported = || {
        Error::bad_parameter(format!(
            "authentication method provided for cluster {:?} not supported: no {} client configured",
            cluster.name,
            cluster.source.provider()
        ))
    };

    let client = match &cluster.source {
        ClusterSource::Kubeconfig(raw) => {
            let creds = StaticCredentials::from_kubeconfig(&cluster.name, raw).await?;
            return Ok(Arc::new(creds));
        }
        ClusterSource::Azure(_) => {
            azure_rest_config_client(cfg.cloud_clients.azure.clone().ok_or_else(unsupported)?)
        }
        ClusterSource::Aws(_) => aws_rest_config_client(
            cfg.cloud_clients.aws.clone().ok_or_else(unsupported)?,
            Arc::clone(&cfg.clock),
            cfg.resource_matchers.clone(),
        ),
        ClusterSource::Gcp(_) => {
            gcp_rest_config_client(cfg.cloud_clients.gcp.clone().ok_or_else(unsupported)?)
        }
    };

    let creds = DynamicCredentials::new(
        cluster.clone(),
        client,
        Arc::clone(&cfg.clock),
        cfg.renewal.clone(),
    )
    .await?;
    Ok(Arc::new(creds))
}

/// Mutable cluster state guarded as one unit
#[derive(Default)]
struct SchemaState {
    schema: Option<ClusterSchema>,
    version: Option<String>,
    offline: bool,
}

/// Registered cluster with its credentials and schema snapshot
pub struct ClusterDetails {
    cluster: KubeCluster,
    credentials: Arc<dyn KubeCredentials>,
    schema_builder: Arc<dyn SchemaBuilder>,
    dynamic_labels: Option<DynamicLabels>,
    state: Arc<RwLock<SchemaState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterDetails {
    /// Register a cluster.
    ///
    /// Only configuration problems fail construction. An unreachable
    /// cluster starts offline and is retried in the background.
    pub async fn new(cfg: ClusterDetailsConfig) -> Result<Self> {
        let mut backoff = cfg.refresh.backoff()?;
        cfg.renewal.validate()?;

        let credentials = get_kube_cluster_credentials(&cfg).await?;
        let schema_builder = cfg
            .schema_builder
            .clone()
            .unwrap_or_else(|| Arc::new(DiscoverySchemaBuilder::new()));

        let dynamic_labels = if cfg.cluster.dynamic_labels.is_empty() {
            None
        } else {
            let labels = DynamicLabels::new(
                &cfg.cluster.name,
                cfg.cluster.dynamic_labels.clone(),
                Arc::clone(&cfg.clock),
            );
            labels.sync().await;
            labels.start();
            Some(labels)
        };

        let refresher = Refresher {
            cluster_name: cfg.cluster.name.clone(),
            credentials: Arc::clone(&credentials),
            schema_builder: Arc::clone(&schema_builder),
            state: Arc::new(RwLock::new(SchemaState::default())),
            clock: Arc::clone(&cfg.clock),
            attempt_timeout: cfg.refresh.attempt_timeout,
        };

        match refresher.attempt().await {
            Ok((schema, version)) => {
                refresher.apply(schema, version);
            }
            Err(e) => {
                warn!(
                    cluster = %cfg.cluster.name,
                    error = %e,
                    "failed to create cluster schema, the cluster may be offline"
                );
                refresher.mark_offline();
                backoff.on_failure();
            }
        }

        let state = Arc::clone(&refresher.state);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_refresh(refresher, backoff, cancel.clone()));

        Ok(Self {
            cluster: cfg.cluster,
            credentials,
            schema_builder,
            dynamic_labels,
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.cluster.name
    }

    pub fn cluster(&self) -> &KubeCluster {
        &self.cluster
    }

    /// Static labels merged with the latest dynamic label results
    pub fn labels(&self) -> BTreeMap<String, String> {
        match &self.dynamic_labels {
            Some(dynamic) => self
                .cluster
                .clone()
                .with_dynamic_labels(dynamic.get())
                .all_labels(),
            None => self.cluster.labels.clone(),
        }
    }

    pub fn dynamic_labels(&self) -> Option<&DynamicLabels> {
        self.dynamic_labels.as_ref()
    }

    /// Last observed API server version
    pub fn cluster_version(&self) -> Option<String> {
        self.state.read().version.clone()
    }

    pub fn is_offline(&self) -> bool {
        self.state.read().offline
    }

    /// Current connection settings; fails once dynamic credentials expired
    pub fn kube_config(&self) -> Result<Arc<kube::Config>> {
        self.credentials.kube_config()
    }

    pub fn credentials(&self) -> &Arc<dyn KubeCredentials> {
        &self.credentials
    }

    /// Codec table and RBAC-supported resources of the cluster.
    ///
    /// Fails with [`Error::ClusterOffline`] while the cluster is offline;
    /// callers should treat that as temporary.
    pub fn get_cluster_supported_resources(
        &self,
    ) -> Result<(Arc<CodecTable>, Arc<RbacSupportedResources>)> {
        let state = self.state.read();
        match (&state.schema, state.offline) {
            (Some(schema), false) => Ok((
                Arc::clone(&schema.codecs),
                Arc::clone(&schema.rbac_supported),
            )),
            _ => Err(Error::ClusterOffline {
                cluster: self.cluster.name.clone(),
            }),
        }
    }

    /// Canonical GVK registered for a request path, if any
    pub fn get_object_gvk(&self, resource: &ApiResourceRequest) -> Option<GroupVersionKind> {
        let state = self.state.read();
        state.schema.as_ref()?.gvk(&GvkKey::from(resource))
    }

    /// Stop background work and release owned resources.
    ///
    /// Waits for the refresh task to exit before the dynamic labels,
    /// credentials and cached clients are closed. Safe to call repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            join_task(&self.cluster.name, "schema refresh", task).await;
        }
        if let Some(labels) = &self.dynamic_labels {
            labels.close().await;
        }
        self.credentials.close().await;
        self.schema_builder.close();
    }
}

impl Drop for ClusterDetails {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Refresh Scheduler
// ============================================================================

struct Refresher {
    cluster_name: String,
    credentials: Arc<dyn KubeCredentials>,
    schema_builder: Arc<dyn SchemaBuilder>,
    state: Arc<RwLock<SchemaState>>,
    clock: Arc<dyn Clock>,
    attempt_timeout: Duration,
}

impl Refresher {
    /// Build a schema and probe the server version. A failed version probe
    /// does not fail the attempt.
    async fn attempt(&self) -> Result<(ClusterSchema, Option<String>)> {
        let config = self.credentials.kube_config()?;
        let schema = with_timeout(
            self.clock.as_ref(),
            "build cluster schema",
            &self.cluster_name,
            self.attempt_timeout,
            self.schema_builder.build(&self.cluster_name, Arc::clone(&config)),
        )
        .await?;

        let version = match with_timeout(
            self.clock.as_ref(),
            "get server version",
            &self.cluster_name,
            self.attempt_timeout,
            self.schema_builder.server_version(&self.cluster_name, config),
        )
        .await
        {
            Ok(version) => Some(version),
            Err(e) => {
                warn!(
                    cluster = %self.cluster_name,
                    error = %e,
                    "failed to get kubernetes cluster version, the cluster may be offline"
                );
                None
            }
        };

        Ok((schema, version))
    }

    /// Swap in a fresh snapshot. Returns whether the cluster was offline.
    fn apply(&self, schema: ClusterSchema, version: Option<String>) -> bool {
        let mut state = self.state.write();
        let was_offline = state.offline;
        state.schema = Some(schema);
        if version.is_some() {
            state.version = version;
        }
        state.offline = false;
        was_offline
    }

    fn mark_offline(&self) {
        self.state.write().offline = true;
    }
}

async fn run_refresh(
    refresher: Refresher,
    mut backoff: RefreshBackoff,
    cancel: CancellationToken,
) {
    let clock = Arc::clone(&refresher.clock);
    debug!(cluster = %refresher.cluster_name, "schema refresh started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = clock.sleep(backoff.next_delay()) => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = refresher.attempt() => result,
        };

        match result {
            Ok((schema, version)) => {
                backoff.on_success();
                if refresher.apply(schema, version) {
                    info!(cluster = %refresher.cluster_name, "kubernetes cluster is back online");
                }
            }
            Err(e) => {
                backoff.on_failure();
                refresher.mark_offline();
                warn!(
                    cluster = %refresher.cluster_name,
                    error = %e,
                    next_attempt_in = ?backoff.interval(),
                    "failed to update cluster schema"
                );
            }
        }
    }
    debug!(cluster = %refresher.cluster_name, "schema refresh stopped");
}
