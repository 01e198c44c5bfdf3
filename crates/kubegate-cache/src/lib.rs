//! Cluster details cache for kubegate
//!
//! Keeps, per registered cluster, the credentials needed to reach it and a
//! periodically refreshed snapshot of the resource kinds it serves.

mod backoff;
mod clock;
mod cloud;
mod cluster;
mod dynamic_creds;
mod labels;
mod task;

pub use backoff::{
    BACKOFF_REFRESH_STEP, DEFAULT_REFRESH_PERIOD, Linear, RefreshBackoff, seventh_jitter,
};
pub use clock::{Clock, FakeClock, SystemClock, add_duration};
pub use cloud::{
    CloudClients, EKS_TOKEN_TTL, aws_resource_matcher_for_cluster, aws_rest_config_client,
    azure_rest_config_client, gcp_rest_config_client,
};
pub use cluster::{
    ClusterDetails, ClusterDetailsConfig, RefreshSettings, get_kube_cluster_credentials,
};
pub use dynamic_creds::{
    CredentialSnapshot, DynamicCredentials, DynamicCredsClient, RenewalSettings,
};
pub use labels::{DEFAULT_LABEL_COMMAND_TIMEOUT, DynamicLabels};
