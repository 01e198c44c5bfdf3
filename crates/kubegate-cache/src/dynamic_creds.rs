//! Provider-issued credentials with proactive renewal
//!
//! Cloud-managed clusters hand out short-lived tokens. [`DynamicCredentials`]
//! fetches one synchronously at construction and then keeps a background
//! task renewing it ahead of expiry, so readers never wait on the provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubegate_k8s::{Error, KubeCluster, KubeCredentials, RestConfig, Result, kube_config_from_rest};

use crate::clock::{Clock, with_timeout};
use crate::task::join_task;

/// Fetches fresh REST settings and their expiry for a cluster
pub type DynamicCredsClient = Arc<
    dyn Fn(KubeCluster) -> BoxFuture<'static, Result<(RestConfig, DateTime<Utc>)>> + Send + Sync,
>;

/// Renewal timing
#[derive(Clone, Debug)]
pub struct RenewalSettings {
    /// Renew this long before the credentials expire
    pub safety_margin: Duration,
    /// Wait between attempts after a failed renewal
    pub retry_interval: Duration,
    /// Upper bound for a single fetch
    pub attempt_timeout: Duration,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(5 * 60),
            retry_interval: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RenewalSettings {
    /// Reject timings that would make renewal spin or always time out
    pub fn validate(&self) -> Result<()> {
        if self.retry_interval.is_zero() {
            return Err(Error::bad_parameter("renewal retry interval must be positive"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(Error::bad_parameter("renewal attempt timeout must be positive"));
        }
        Ok(())
    }
}

/// One successful fetch, replaced wholesale on renewal
#[derive(Clone, Debug)]
pub struct CredentialSnapshot {
    pub rest_config: RestConfig,
    pub kube_config: Arc<kube::Config>,
    pub expires_at: DateTime<Utc>,
}

/// Always-fresh credentials for a dynamic cluster
pub struct DynamicCredentials {
    cluster_name: String,
    snapshot: Arc<RwLock<CredentialSnapshot>>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DynamicCredentials {
    /// Fetch the first credentials and start the renewal task.
    ///
    /// Fails on invalid settings or if the first fetch fails: a cluster
    /// without working credentials cannot be registered.
    pub async fn new(
        cluster: KubeCluster,
        client: DynamicCredsClient,
        clock: Arc<dyn Clock>,
        settings: RenewalSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let first = fetch(&cluster, &client, clock.as_ref(), &settings).await?;
        let delay = renewal_delay(clock.now(), first.expires_at, settings.safety_margin);
        let snapshot = Arc::new(RwLock::new(first));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_renewal(RenewalTask {
            cluster: cluster.clone(),
            client,
            clock: Arc::clone(&clock),
            settings,
            snapshot: Arc::clone(&snapshot),
            cancel: cancel.clone(),
            delay,
        }));

        Ok(Self {
            cluster_name: cluster.name,
            snapshot,
            clock,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Current REST settings, or [`Error::CredentialsExpired`]
    pub fn rest_config(&self) -> Result<RestConfig> {
        Ok(self.current()?.rest_config)
    }

    /// Expiry of the credentials currently served
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.snapshot.read().expires_at
    }

    fn current(&self) -> Result<CredentialSnapshot> {
        let snapshot = self.snapshot.read();
        if self.clock.now() >= snapshot.expires_at {
            return Err(Error::CredentialsExpired {
                cluster: self.cluster_name.clone(),
                expired_at: snapshot.expires_at,
            });
        }
        Ok(snapshot.clone())
    }
}

impl KubeCredentials for DynamicCredentials {
    fn kube_config(&self) -> Result<Arc<kube::Config>> {
        Ok(self.current()?.kube_config)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cancel.cancel();
            let task = self.task.lock().take();
            if let Some(task) = task {
                join_task(&self.cluster_name, "credential renewal", task).await;
            }
        })
    }
}

impl Drop for DynamicCredentials {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Time until the next renewal: `safety_margin` before expiry, or half the
/// remaining lifetime when that is shorter than two margins
fn renewal_delay(now: DateTime<Utc>, expires_at: DateTime<Utc>, safety_margin: Duration) -> Duration {
    let lifetime = (expires_at - now).to_std().unwrap_or_default();
    if lifetime > safety_margin.saturating_mul(2) {
        lifetime - safety_margin
    } else {
        lifetime / 2
    }
}

async fn fetch(
    cluster: &KubeCluster,
    client: &DynamicCredsClient,
    clock: &dyn Clock,
    settings: &RenewalSettings,
) -> Result<CredentialSnapshot> {
    let (rest_config, expires_at) = with_timeout(
        clock,
        "fetch credentials",
        &cluster.name,
        settings.attempt_timeout,
        client(cluster.clone()),
    )
    .await?;
    let kube_config = kube_config_from_rest(&cluster.name, &rest_config).await?;

    Ok(CredentialSnapshot {
        rest_config,
        kube_config: Arc::new(kube_config),
        expires_at,
    })
}

struct RenewalTask {
    cluster: KubeCluster,
    client: DynamicCredsClient,
    clock: Arc<dyn Clock>,
    settings: RenewalSettings,
    snapshot: Arc<RwLock<CredentialSnapshot>>,
    cancel: CancellationToken,
    delay: Duration,
}

async fn run_renewal(task: RenewalTask) {
    let RenewalTask {
        cluster,
        client,
        clock,
        settings,
        snapshot,
        cancel,
        mut delay,
    } = task;

    debug!(cluster = %cluster.name, "credential renewal started");
    loop {
        // expired credentials are retried on the retry interval
        if delay.is_zero() {
            delay = settings.retry_interval;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = clock.sleep(delay) => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = fetch(&cluster, &client, clock.as_ref(), &settings) => result,
        };

        match result {
            Ok(fresh) => {
                delay = renewal_delay(clock.now(), fresh.expires_at, settings.safety_margin);
                debug!(
                    cluster = %cluster.name,
                    expires_at = %fresh.expires_at,
                    "renewed cluster credentials"
                );
                *snapshot.write() = fresh;
            }
            Err(e) => {
                delay = settings.retry_interval;
                warn!(
                    cluster = %cluster.name,
                    error = %e,
                    retry_in = ?delay,
                    "failed to renew cluster credentials"
                );
            }
        }
    }
    debug!(cluster = %cluster.name, "credential renewal stopped");
}
