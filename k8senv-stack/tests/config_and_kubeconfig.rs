use k8senv_stack::config::StackConfig;
use k8senv_stack::kubeconfig;
use std::time::Duration;

#[test]
fn empty_binary_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let result = StackConfig::new("", "apiserver", dir.path());
    assert!(result.is_err());
}

#[test]
fn zero_readiness_timeout_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = StackConfig::new("shim", "apiserver", dir.path()).unwrap();
    let result = config.with_readiness(Duration::from_millis(10), Duration::ZERO);
    assert!(result.is_err());
}

#[test]
fn layout_matches_spec_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = StackConfig::new("shim", "apiserver", dir.path()).unwrap();
    assert_eq!(config.db_path(), dir.path().join("db").join("state.db"));
    assert_eq!(config.kubeconfig_path(), dir.path().join("kubeconfig.yaml"));
    assert_eq!(config.token_file_path(), dir.path().join("token.csv"));
    assert_eq!(config.certs_dir(), dir.path().join("certs"));
}

#[tokio::test]
async fn kubeconfig_round_trips_through_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kubeconfig.yaml");
    kubeconfig::write(&path, 16443, "abc123").await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let parsed: serde_yaml::Value = serde_yaml::from_str(&contents).unwrap();
    assert_eq!(
        parsed["clusters"][0]["cluster"]["server"],
        "https://127.0.0.1:16443"
    );
    assert_eq!(parsed["users"][0]["user"]["token"], "abc123");
}
