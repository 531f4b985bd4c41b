use k8senv_cache::hash_directory;
use k8senv_cache::lock;
use tokio_util::sync::CancellationToken;

#[test]
fn hashing_is_deterministic_across_two_calls() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.yaml"), "kind: Widget\n").unwrap();

    let first = hash_directory(dir.path()).unwrap();
    let second = hash_directory(dir.path()).unwrap();
    assert_eq!(first.hash, second.hash);
}

#[tokio::test]
async fn lock_serializes_two_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("cached-abc.db.lock");

    let first = lock::acquire(&lock_path, &CancellationToken::new())
        .await
        .unwrap();

    let lock_path_clone = lock_path.clone();
    let waiter = tokio::spawn(async move {
        lock::acquire(&lock_path_clone, &CancellationToken::new())
            .await
            .unwrap()
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(first);
    let _second = waiter.await.unwrap();
}
