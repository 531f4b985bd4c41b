//! Render the kubeconfig file for a stack. Computable entirely from the
//! allocated API-server port and the static token; no running server
//! required.

use serde::Serialize;
use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum KubeconfigError {
    #[snafu(display("failed to render kubeconfig as YAML: {source}"))]
    Render { source: serde_yaml::Error },

    #[snafu(display("failed to write kubeconfig to {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

const CLUSTER_NAME: &str = "k8senv";
const USER_NAME: &str = "k8senv";
const CONTEXT_NAME: &str = "k8senv";

#[derive(Serialize)]
struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: &'static str,
}

#[derive(Serialize)]
struct NamedCluster {
    name: &'static str,
    cluster: Cluster,
}

#[derive(Serialize)]
struct Cluster {
    server: String,
    #[serde(rename = "insecure-skip-tls-verify")]
    insecure_skip_tls_verify: bool,
}

#[derive(Serialize)]
struct NamedUser {
    name: &'static str,
    user: User,
}

#[derive(Serialize)]
struct User {
    token: String,
}

#[derive(Serialize)]
struct NamedContext {
    name: &'static str,
    context: Context,
}

#[derive(Serialize)]
struct Context {
    cluster: &'static str,
    user: &'static str,
}

/// Render the kubeconfig YAML for an API server bound to loopback on
/// `api_port`, authenticating with `token`.
///
/// TLS verification is disabled: the launched API server always uses a
/// self-signed, no-CA ephemeral certificate, and the connection is strictly
/// loopback.
pub fn render(api_port: u16, token: &str) -> Result<String, KubeconfigError> {
    let doc = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME,
            cluster: Cluster {
                server: format!("https://127.0.0.1:{api_port}"),
                insecure_skip_tls_verify: true,
            },
        }],
        users: vec![NamedUser {
            name: USER_NAME,
            user: User {
                token: token.to_string(),
            },
        }],
        contexts: vec![NamedContext {
            name: CONTEXT_NAME,
            context: Context {
                cluster: CLUSTER_NAME,
                user: USER_NAME,
            },
        }],
        current_context: CONTEXT_NAME,
    };
    serde_yaml::to_string(&doc).context(RenderSnafu)
}

pub async fn write(path: &std::path::Path, api_port: u16, token: &str) -> Result<(), KubeconfigError> {
    let yaml = render(api_port, token)?;
    crate::config::ensure_parent_exists(path).ok();
    tokio::fs::write(path, yaml)
        .await
        .context(WriteSnafu {
            path: path.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_expected_server_url() {
        let yaml = render(6443, "tok").unwrap();
        assert!(yaml.contains("https://127.0.0.1:6443"));
        assert!(yaml.contains("insecure-skip-tls-verify: true"));
        assert!(yaml.contains("token: tok"));
    }
}
