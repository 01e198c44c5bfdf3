//! Error types for cluster credentials and schema operations

use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Result type for kubegate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for kubegate operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unusable configuration (malformed kubeconfig, missing fields)
    #[error("configuration error: {0}")]
    Config(String),

    /// Parameter not supported by this gateway
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The cluster schema is unavailable because the cluster is unreachable
    #[error("kubernetes cluster {cluster:?} is offline")]
    ClusterOffline { cluster: String },

    /// A call to the cluster or its cloud provider failed
    #[error("failed to {op} for cluster {cluster:?}: {message}")]
    ConnectionProblem {
        op: &'static str,
        cluster: String,
        message: String,
    },

    /// The credentials ran out and have not been renewed yet
    #[error("credentials for kubernetes cluster {cluster:?} expired at {expired_at}")]
    CredentialsExpired {
        cluster: String,
        expired_at: DateTime<Utc>,
    },

    /// A single attempt exceeded its deadline
    #[error("timed out after {after:?} trying to {op} for cluster {cluster:?}")]
    Timeout {
        op: &'static str,
        cluster: String,
        after: Duration,
    },

    /// Object could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Kubeconfig(#[from] kube::config::KubeconfigError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Error::BadParameter(msg.into())
    }

    /// Wrap a failed upstream call with the operation and cluster name
    pub fn connection(op: &'static str, cluster: &str, err: impl Display) -> Self {
        Error::ConnectionProblem {
            op,
            cluster: cluster.to_string(),
            message: err.to_string(),
        }
    }

    /// Transient failure: the caller may retry later
    pub fn is_connection_problem(&self) -> bool {
        matches!(
            self,
            Error::ClusterOffline { .. }
                | Error::ConnectionProblem { .. }
                | Error::Timeout { .. }
                | Error::Kube(_)
        )
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Error::CredentialsExpired { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::BadParameter(_) | Error::Kubeconfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::connection("list pods", "c1", "refused").is_connection_problem());
        assert!(
            Error::ClusterOffline {
                cluster: "c1".into()
            }
            .is_connection_problem()
        );
        assert!(Error::config("bad yaml").is_config());
        assert!(Error::bad_parameter("provider").is_config());

        let expired = Error::CredentialsExpired {
            cluster: "c1".into(),
            expired_at: Utc::now(),
        };
        assert!(expired.is_expired());
        assert!(!expired.is_connection_problem());
    }

    #[test]
    fn test_connection_error_names_operation_and_cluster() {
        let err = Error::connection("discover API resources", "prod", "connection refused");
        assert_eq!(
            err.to_string(),
            "failed to discover API resources for cluster \"prod\": connection refused"
        );
    }
}
