//! Cloud provider capabilities used to mint cluster credentials
//!
//! The SDK clients live outside this workspace. Each provider is reduced to
//! the handful of calls needed to produce a [`RestConfig`] and its expiry.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use kubegate_types::{AwsMatcher, AzureClusterConfig, GcpClusterConfig, RestConfig};

use crate::error::Result;

/// Prefix of bearer tokens accepted by the EKS authenticator
pub const EKS_TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// AWS session parameters for a single credential fetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwsSession {
    pub region: String,
    /// Role to assume on top of the ambient credentials
    pub assume_role: Option<AwsMatcher>,
}

/// Subset of `DescribeCluster` output needed to reach the API server
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EksClusterInfo {
    pub endpoint: String,
    /// Base64-encoded PEM bundle
    pub certificate_authority_data: String,
}

/// EKS and STS calls
pub trait AwsClients: Send + Sync {
    fn describe_cluster<'a>(
        &'a self,
        session: &'a AwsSession,
        cluster_name: &'a str,
    ) -> BoxFuture<'a, Result<EksClusterInfo>>;

    /// Presigned `sts:GetCallerIdentity` URL carrying the
    /// `x-k8s-aws-id: <cluster_name>` header
    fn presign_get_caller_identity<'a>(
        &'a self,
        session: &'a AwsSession,
        cluster_name: &'a str,
    ) -> BoxFuture<'a, Result<String>>;
}

/// AKS credential calls
pub trait AzureClients: Send + Sync {
    fn cluster_credentials<'a>(
        &'a self,
        cluster: &'a AzureClusterConfig,
    ) -> BoxFuture<'a, Result<(RestConfig, DateTime<Utc>)>>;
}

/// GKE credential calls
pub trait GcpClients: Send + Sync {
    fn cluster_rest_config<'a>(
        &'a self,
        cluster: &'a GcpClusterConfig,
    ) -> BoxFuture<'a, Result<(RestConfig, DateTime<Utc>)>>;
}

/// Encode a presigned STS URL as an EKS bearer token
pub fn eks_token_from_presigned_url(url: &str) -> String {
    format!("{}{}", EKS_TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eks_token_is_unpadded_url_safe() {
        let url = "https://sts.us-west-2.amazonaws.com/?Action=GetCallerIdentity&X-Amz-Expires=60";
        let token = eks_token_from_presigned_url(url);

        let encoded = token.strip_prefix(EKS_TOKEN_PREFIX).unwrap();
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert_eq!(URL_SAFE_NO_PAD.decode(encoded).unwrap(), url.as_bytes());
    }
}
