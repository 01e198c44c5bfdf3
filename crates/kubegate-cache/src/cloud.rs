//! Per-cloud credential clients
//!
//! Each function here turns a cloud capability into a [`DynamicCredsClient`]
//! that [`DynamicCredentials`] calls whenever it needs fresh settings.
//!
//! [`DynamicCredentials`]: crate::DynamicCredentials

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;

use kubegate_k8s::cloud::{
    AwsClients, AwsSession, AzureClients, GcpClients, eks_token_from_presigned_url,
};
use kubegate_k8s::{Error, KubeCluster, RestConfig};
use kubegate_types::{AwsMatcher, ResourceMatcher, match_labels};

use crate::clock::{Clock, add_duration};
use crate::dynamic_creds::DynamicCredsClient;

/// Presigned STS URLs are accepted for 15 minutes; one is kept as slack.
pub const EKS_TOKEN_TTL: Duration = Duration::from_secs(14 * 60);

/// Cloud capabilities available to this gateway. A dynamic cluster whose
/// provider has no handle here cannot be registered.
#[derive(Clone, Default)]
pub struct CloudClients {
    pub aws: Option<Arc<dyn AwsClients>>,
    pub azure: Option<Arc<dyn AzureClients>>,
    pub gcp: Option<Arc<dyn GcpClients>>,
}

/// First matcher that names a role to assume and whose labels select the
/// cluster. `None` means ambient credentials are used as-is.
pub fn aws_resource_matcher_for_cluster<'a>(
    cluster: &KubeCluster,
    matchers: &'a [ResourceMatcher],
) -> Option<&'a AwsMatcher> {
    if !cluster.is_aws() {
        return None;
    }
    let labels = cluster.all_labels();
    matchers
        .iter()
        .filter(|m| !m.labels.is_empty() && !m.aws.assume_role_arn.is_empty())
        .find(|m| match_labels(&m.labels, &labels))
        .map(|m| &m.aws)
}

/// Credentials for EKS clusters: describe the cluster, then presign an STS
/// identity request as the bearer token
pub fn aws_rest_config_client(
    aws: Arc<dyn AwsClients>,
    clock: Arc<dyn Clock>,
    matchers: Vec<ResourceMatcher>,
) -> DynamicCredsClient {
    Arc::new(move |cluster: KubeCluster| {
        let aws = Arc::clone(&aws);
        let clock = Arc::clone(&clock);
        let assume_role = aws_resource_matcher_for_cluster(&cluster, &matchers).cloned();

        async move {
            let cfg = cluster.aws_config().cloned().ok_or_else(|| {
                Error::bad_parameter(format!("cluster {:?} is not an AWS cluster", cluster.name))
            })?;
            let session = AwsSession {
                region: cfg.region.clone(),
                assume_role,
            };

            let info = aws.describe_cluster(&session, &cfg.name).await?;
            let ca = STANDARD
                .decode(info.certificate_authority_data.as_bytes())
                .map_err(|e| {
                    Error::bad_parameter(format!(
                        "invalid certificate authority for cluster {:?}: {}",
                        cfg.name, e
                    ))
                })?;
            if info.endpoint.is_empty() {
                return Err(Error::bad_parameter(format!(
                    "invalid api endpoint for cluster {:?}",
                    cfg.name
                )));
            }

            let url = aws.presign_get_caller_identity(&session, &cfg.name).await?;
            let expires_at = add_duration(clock.now(), EKS_TOKEN_TTL);

            Ok((
                RestConfig::new(info.endpoint)
                    .with_bearer_token(eks_token_from_presigned_url(&url))
                    .with_ca_data(ca),
                expires_at,
            ))
        }
        .boxed()
    })
}

/// Credentials for AKS clusters
pub fn azure_rest_config_client(azure: Arc<dyn AzureClients>) -> DynamicCredsClient {
    Arc::new(move |cluster: KubeCluster| {
        let azure = Arc::clone(&azure);
        async move {
            let cfg = cluster.azure_config().ok_or_else(|| {
                Error::bad_parameter(format!("cluster {:?} is not an Azure cluster", cluster.name))
            })?;
            azure.cluster_credentials(cfg).await
        }
        .boxed()
    })
}

/// Credentials for GKE clusters
pub fn gcp_rest_config_client(gcp: Arc<dyn GcpClients>) -> DynamicCredsClient {
    Arc::new(move |cluster: KubeCluster| {
        let gcp = Arc::clone(&gcp);
        async move {
            let cfg = cluster.gcp_config().ok_or_else(|| {
                Error::bad_parameter(format!("cluster {:?} is not a GCP cluster", cluster.name))
            })?;
            gcp.cluster_rest_config(cfg).await
        }
        .boxed()
    })
}
