//! Kubeconfig handling
//!
//! Static clusters ship a kubeconfig document; dynamic clusters hand out a
//! [`RestConfig`]. Both end up as a `kube::Config` built through a
//! `Kubeconfig`, so certificate and exec handling stays inside kube.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kube::config::{
    AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
    NamedContext,
};

use kubegate_types::RestConfig;

use crate::error::{Error, Result};

/// Parse a static kubeconfig and resolve the connection settings.
///
/// When no current context is set the first context is used.
pub async fn load_static_kube_config(cluster_name: &str, raw: &str) -> Result<kube::Config> {
    let mut kubeconfig = Kubeconfig::from_yaml(raw).map_err(|e| {
        Error::config(format!(
            "unable to parse kubeconfig for cluster {:?}: {}",
            cluster_name, e
        ))
    })?;

    if kubeconfig.current_context.as_deref().unwrap_or_default().is_empty() {
        kubeconfig.current_context = kubeconfig.contexts.first().map(|c| c.name.clone());
    }

    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::config(format!(
                "unable to create client config from kubeconfig for cluster {:?}: {}",
                cluster_name, e
            ))
        })
}

/// Build a single-context kubeconfig carrying the given REST settings
pub fn kubeconfig_from_rest(cluster_name: &str, rest: &RestConfig) -> Kubeconfig {
    let name = cluster_name.to_string();

    Kubeconfig {
        clusters: vec![NamedCluster {
            name: name.clone(),
            cluster: Some(Cluster {
                server: Some(rest.host.clone()),
                certificate_authority_data: rest.ca_data.as_ref().map(|ca| STANDARD.encode(ca)),
                insecure_skip_tls_verify: rest.insecure_skip_tls_verify.then_some(true),
                tls_server_name: rest.tls_server_name.clone(),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: name.clone(),
            auth_info: Some(AuthInfo {
                token: rest.bearer_token.clone().map(Into::into),
                client_certificate_data: rest
                    .client_cert_data
                    .as_ref()
                    .map(|cert| STANDARD.encode(cert)),
                client_key_data: rest
                    .client_key_data
                    .as_ref()
                    .map(|key| STANDARD.encode(key).into()),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: name.clone(),
            context: Some(Context {
                cluster: name.clone(),
                user: Some(name.clone()),
                ..Default::default()
            }),
        }],
        current_context: Some(name),
        ..Default::default()
    }
}

/// Convert provider-issued REST settings into a `kube::Config`
pub async fn kube_config_from_rest(cluster_name: &str, rest: &RestConfig) -> Result<kube::Config> {
    if rest.host.is_empty() {
        return Err(Error::bad_parameter(format!(
            "empty API server address for cluster {:?}",
            cluster_name
        )));
    }

    kube::Config::from_custom_kubeconfig(
        kubeconfig_from_rest(cluster_name, rest),
        &KubeConfigOptions::default(),
    )
    .await
    .map_err(|e| {
        Error::config(format!(
            "invalid REST configuration for cluster {:?}: {}",
            cluster_name, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: first
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
- name: second
  cluster:
    server: https://10.0.0.2:6443
    insecure-skip-tls-verify: true
users:
- name: admin
  user:
    token: abc123
contexts:
- name: ctx-first
  context:
    cluster: first
    user: admin
- name: ctx-second
  context:
    cluster: second
    user: admin
"#;

    #[tokio::test]
    async fn test_static_kubeconfig_defaults_to_first_context() {
        let config = load_static_kube_config("c1", KUBECONFIG).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_static_kubeconfig_honours_current_context() {
        let raw = format!("{}current-context: ctx-second\n", KUBECONFIG);
        let config = load_static_kube_config("c1", &raw).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_malformed_kubeconfig_is_config_error() {
        let err = load_static_kube_config("broken", "clusters: [oops")
            .await
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_kubeconfig_from_rest_wires_context() {
        let rest = RestConfig::new("https://eks.example:443")
            .with_bearer_token("k8s-aws-v1.token")
            .with_ca_data(b"-----BEGIN CERTIFICATE-----".to_vec());
        let kubeconfig = kubeconfig_from_rest("eks-1", &rest);

        assert_eq!(kubeconfig.current_context.as_deref(), Some("eks-1"));
        let cluster = kubeconfig.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://eks.example:443"));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some(STANDARD.encode(b"-----BEGIN CERTIFICATE-----").as_str())
        );
        let auth = kubeconfig.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(auth.token.is_some());
        assert!(auth.client_key_data.is_none());
    }

    #[tokio::test]
    async fn test_kube_config_from_rest_rejects_empty_host() {
        let err = kube_config_from_rest("c1", &RestConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
    }

    #[tokio::test]
    async fn test_kube_config_from_rest_resolves_host() {
        let mut rest = RestConfig::new("https://10.1.2.3:6443").with_bearer_token("t");
        rest.insecure_skip_tls_verify = true;
        let config = kube_config_from_rest("c1", &rest).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("10.1.2.3"));
        assert!(config.accept_invalid_certs);
    }
}
