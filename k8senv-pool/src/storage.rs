//! Direct manipulation of the kine-backed sqlite storage file, used only
//! by the `purge` release strategy.
//!
//! This assumes kine's actual on-disk layout: a single `kine` table with
//! a `name` column holding the `/registry/...` key path. If that layout
//! changes between kine versions, [`verify_layout`] reports a distinct
//! error instead of silently deleting the wrong rows.

use k8senv_common::namespaces::is_system_namespace;
use snafu::{ResultExt, Snafu};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

const KINE_TABLE: &str = "kine";
const KINE_NAME_COLUMN: &str = "name";
const REGISTRY_PREFIX: &str = "/registry/";

#[derive(Debug, Snafu)]
pub enum StorageError {
    #[snafu(display("failed to open storage file '{path:?}': {source}"))]
    Open { path: PathBuf, source: sqlx::Error },

    #[snafu(display("storage schema did not match the expected kine layout: {detail}"))]
    UnexpectedLayout { detail: String },

    #[snafu(display("failed to query or modify storage rows: {source}"))]
    Query { source: sqlx::Error },
}

async fn connect(db_path: &Path) -> Result<SqlitePool, StorageError> {
    let url = format!("sqlite://{}", db_path.display());
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .context(OpenSnafu {
            path: db_path.to_path_buf(),
        })
}

async fn verify_layout(pool: &SqlitePool) -> Result<(), StorageError> {
    let columns = sqlx::query(&format!("PRAGMA table_info({KINE_TABLE})"))
        .fetch_all(pool)
        .await
        .context(QuerySnafu)?;

    let has_name_column = columns.iter().any(|row| {
        row.try_get::<String, _>("name")
            .map(|name| name == KINE_NAME_COLUMN)
            .unwrap_or(false)
    });

    if columns.is_empty() || !has_name_column {
        return UnexpectedLayoutSnafu {
            detail: format!(
                "table '{KINE_TABLE}' is missing or has no '{KINE_NAME_COLUMN}' column"
            ),
        }
        .fail();
    }
    Ok(())
}

/// A `/registry/...` key is preserved rather than purged if any of its
/// path segments names a system namespace. This mirrors the storage-key
/// layout the control-plane API server is assumed to use (namespace as a
/// path segment) but is an assumption, not a verified contract.
fn is_user_key(name: &str) -> bool {
    name.starts_with(REGISTRY_PREFIX) && !name.split('/').any(is_system_namespace)
}

async fn registry_keys(pool: &SqlitePool) -> Result<Vec<String>, StorageError> {
    let rows = sqlx::query(&format!(
        "SELECT {KINE_NAME_COLUMN} FROM {KINE_TABLE} WHERE {KINE_NAME_COLUMN} LIKE ?"
    ))
    .bind(format!("{REGISTRY_PREFIX}%"))
    .fetch_all(pool)
    .await
    .context(QuerySnafu)?;

    Ok(rows
        .iter()
        .filter_map(|row| row.try_get::<String, _>(KINE_NAME_COLUMN).ok())
        .collect())
}

/// True if the storage file holds at least one key outside the system
/// namespace prefixes. The `purge` strategy uses this as a fast path to
/// skip stopping and restarting the stack when there is nothing to clean.
pub async fn has_user_keys(db_path: &Path) -> Result<bool, StorageError> {
    let pool = connect(db_path).await?;
    verify_layout(&pool).await?;
    let keys = registry_keys(&pool).await?;
    pool.close().await;
    Ok(keys.iter().any(|key| is_user_key(key)))
}

/// Delete every row whose key falls outside the system namespace
/// prefixes. Must only be called while the stack that owns `db_path` is
/// stopped. Returns the number of rows deleted.
pub async fn purge_user_keys(db_path: &Path) -> Result<u64, StorageError> {
    let pool = connect(db_path).await?;
    verify_layout(&pool).await?;
    let keys = registry_keys(&pool).await?;

    let mut deleted = 0u64;
    for key in keys.iter().filter(|key| is_user_key(key)) {
        sqlx::query(&format!(
            "DELETE FROM {KINE_TABLE} WHERE {KINE_NAME_COLUMN} = ?"
        ))
        .bind(key)
        .execute(&pool)
        .await
        .context(QuerySnafu)?;
        deleted += 1;
    }
    pool.close().await;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_namespace_segment_is_preserved() {
        assert!(!is_user_key("/registry/pods/kube-system/coredns-abc"));
    }

    #[test]
    fn user_namespace_segment_is_purged() {
        assert!(is_user_key("/registry/pods/ns-a/widget-1"));
    }

    #[test]
    fn non_registry_keys_are_never_purged() {
        assert!(!is_user_key("/compact_rev_key"));
    }

    #[test]
    fn cluster_scoped_namespace_object_itself_is_preserved() {
        assert!(!is_user_key("/registry/namespaces/default"));
    }

    #[test]
    fn cluster_scoped_user_namespace_object_is_purged() {
        assert!(is_user_key("/registry/namespaces/ns-a"));
    }
}
