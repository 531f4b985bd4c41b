//! Generate the small set of files the API server needs on disk before it
//! can start: the static bearer token file, the anonymous-auth-for-health-
//! endpoints config, and the ECDSA P-256 service-account signing key.

use crate::config::{StackConfig, STATIC_TOKEN_GROUP, STATIC_TOKEN_UID, STATIC_TOKEN_USER};
use p256::elliptic_curve::rand_core::OsRng;
use p256::pkcs8::EncodePrivateKey;
use rand::Rng;
use snafu::{ResultExt, Snafu};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum AuthFilesError {
    #[snafu(display("failed to create directory {path:?}: {source}"))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to set permissions on {path:?}: {source}"))]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to encode service account key as PKCS8: {source}"))]
    EncodeKey { source: p256::pkcs8::Error },

    #[snafu(display("failed to render anonymous-auth config as YAML: {source}"))]
    RenderYaml { source: serde_yaml::Error },
}

/// A freshly generated bearer token, unique per stack so that two stacks on
/// the same host never share credentials even though the group/user/uid
/// triple is fixed.
pub fn generate_token() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write `<token>,<user>,<uid>,"<group>"` with 0600 permissions.
pub async fn write_token_file(config: &StackConfig, token: &str) -> Result<(), AuthFilesError> {
    let path = config.token_file_path();
    let contents = format!(
        "{token},{STATIC_TOKEN_USER},{STATIC_TOKEN_UID},\"{STATIC_TOKEN_GROUP}\"\n"
    );
    crate::config::ensure_parent_exists(&path).context(CreateDirSnafu { path: path.clone() })?;
    tokio::fs::write(&path, contents)
        .await
        .context(WriteSnafu { path: path.clone() })?;
    set_owner_only_permissions(&path).context(PermissionsSnafu { path })?;
    Ok(())
}

#[derive(Serialize)]
struct AnonymousAuthConfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    anonymous: AnonymousSection,
}

#[derive(Serialize)]
struct AnonymousSection {
    enabled: bool,
    conditions: Vec<AnonymousCondition>,
}

#[derive(Serialize)]
struct AnonymousCondition {
    path: &'static str,
}

/// The three health paths (`/livez`, `/readyz`, `/healthz`) that must be
/// reachable without authentication, so the readiness waiter never needs a
/// token.
const ANONYMOUS_HEALTH_PATHS: [&str; 3] = ["/livez", "/readyz", "/healthz"];

pub async fn write_anonymous_auth_config(config: &StackConfig) -> Result<(), AuthFilesError> {
    let path = config.auth_config_path();
    let doc = AnonymousAuthConfig {
        api_version: "apiserver.config.k8s.io/v1beta1",
        kind: "AuthenticationConfiguration",
        anonymous: AnonymousSection {
            enabled: true,
            conditions: ANONYMOUS_HEALTH_PATHS
                .iter()
                .map(|path| AnonymousCondition { path })
                .collect(),
        },
    };
    let yaml = serde_yaml::to_string(&doc).context(RenderYamlSnafu)?;
    crate::config::ensure_parent_exists(&path).context(CreateDirSnafu { path: path.clone() })?;
    tokio::fs::write(&path, yaml)
        .await
        .context(WriteSnafu { path })?;
    Ok(())
}

/// Generate a fresh ECDSA P-256 key and write it PEM-encoded under
/// `certs/service-account.pem`. The same file is used both to sign and to
/// verify service-account tokens.
pub async fn write_service_account_key(config: &StackConfig) -> Result<(), AuthFilesError> {
    let certs_dir = config.certs_dir();
    tokio::fs::create_dir_all(&certs_dir)
        .await
        .context(CreateDirSnafu {
            path: certs_dir.clone(),
        })?;

    let secret_key = p256::SecretKey::random(&mut OsRng);
    let pem = secret_key
        .to_pkcs8_pem(Default::default())
        .context(EncodeKeySnafu)?;

    let path = config.service_account_key_path();
    tokio::fs::write(&path, pem.as_bytes())
        .await
        .context(WriteSnafu { path: path.clone() })?;
    set_owner_only_permissions(&path).context(PermissionsSnafu { path })?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;

    #[tokio::test]
    async fn token_file_has_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let config = StackConfig::new("shim", "apiserver", dir.path()).unwrap();
        let token = generate_token();
        write_token_file(&config, &token).await.unwrap();
        let contents = tokio::fs::read_to_string(config.token_file_path())
            .await
            .unwrap();
        assert_eq!(
            contents.trim(),
            format!("{token},{STATIC_TOKEN_USER},{STATIC_TOKEN_UID},\"{STATIC_TOKEN_GROUP}\"")
        );
    }

    #[tokio::test]
    async fn generated_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[tokio::test]
    async fn anonymous_config_lists_health_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = StackConfig::new("shim", "apiserver", dir.path()).unwrap();
        write_anonymous_auth_config(&config).await.unwrap();
        let contents = tokio::fs::read_to_string(config.auth_config_path())
            .await
            .unwrap();
        for path in ANONYMOUS_HEALTH_PATHS {
            assert!(contents.contains(path));
        }
    }

    #[tokio::test]
    async fn service_account_key_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = StackConfig::new("shim", "apiserver", dir.path()).unwrap();
        write_service_account_key(&config).await.unwrap();
        let contents = tokio::fs::read_to_string(config.service_account_key_path())
            .await
            .unwrap();
        assert!(contents.contains("PRIVATE KEY"));
    }
}
