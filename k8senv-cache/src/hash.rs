//! Content-addressed hashing of a manifest directory.
//!
//! The key is a 64-bit truncation of a SHA-256 digest over every
//! `.yaml`/`.yml` file under the input directory, sorted by relative path,
//! with each (path, contents) pair separated by explicit NUL bytes so that
//! e.g. `("a", "bc")` and `("ab", "c")` never collide.

use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Above this many manifest files we refuse to hash: the cache is meant for
/// a bounded set of CRDs and seed resources, not arbitrary directories.
pub const MAX_MANIFEST_FILES: usize = 4096;

#[derive(Debug, Snafu)]
pub enum HashError {
    #[snafu(display("failed to walk manifest directory {path:?}: {source}"))]
    Walk {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to read manifest file {path:?}: {source}"))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("manifest directory {path:?} contains no .yaml/.yml files"))]
    NoManifests { path: PathBuf },

    #[snafu(display(
        "manifest directory {path:?} contains {count} files, exceeding the cap of {cap}"
    ))]
    TooManyManifests {
        path: PathBuf,
        count: usize,
        cap: usize,
    },
}

/// A manifest file's contents, keyed by path relative to the input
/// directory, read once during hashing and handed back so the apply step
/// never re-reads disk.
pub struct HashedManifests {
    pub hash: String,
    pub files: BTreeMap<PathBuf, String>,
}

/// Hash every `.yaml`/`.yml` file (case-insensitive extension) under `dir`.
pub fn hash_directory(dir: &Path) -> Result<HashedManifests, HashError> {
    let mut files = BTreeMap::new();
    collect_manifest_files(dir, dir, &mut files)?;

    if files.is_empty() {
        return NoManifestsSnafu {
            path: dir.to_path_buf(),
        }
        .fail();
    }
    if files.len() > MAX_MANIFEST_FILES {
        return TooManyManifestsSnafu {
            path: dir.to_path_buf(),
            count: files.len(),
            cap: MAX_MANIFEST_FILES,
        }
        .fail();
    }

    let mut hasher = Sha256::new();
    for (relative_path, contents) in &files {
        hasher.update(relative_path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(contents.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let truncated = &digest[..8];
    let hash = truncated.iter().map(|b| format!("{b:02x}")).collect();

    Ok(HashedManifests { hash, files })
}

fn collect_manifest_files(
    root: &Path,
    dir: &Path,
    out: &mut BTreeMap<PathBuf, String>,
) -> Result<(), HashError> {
    let entries = std::fs::read_dir(dir).context(WalkSnafu {
        path: dir.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry.context(WalkSnafu {
            path: dir.to_path_buf(),
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_manifest_files(root, &path, out)?;
            continue;
        }
        if !is_manifest_file(&path) {
            continue;
        }
        let contents = std::fs::read_to_string(&path).context(ReadFileSnafu {
            path: path.clone(),
        })?;
        let relative = path
            .strip_prefix(root)
            .expect("path was walked from root")
            .to_path_buf();
        out.insert(relative, contents);
    }
    Ok(())
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn identical_contents_hash_identically() {
        let dir1 = tempfile::tempdir().unwrap();
        write_file(dir1.path(), "a.yaml", "kind: Foo\n");
        let dir2 = tempfile::tempdir().unwrap();
        write_file(dir2.path(), "a.yaml", "kind: Foo\n");

        let h1 = hash_directory(dir1.path()).unwrap();
        let h2 = hash_directory(dir2.path()).unwrap();
        assert_eq!(h1.hash, h2.hash);
    }

    #[test]
    fn different_contents_hash_differently() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.yaml", "kind: Foo\n");
        let h1 = hash_directory(dir.path()).unwrap();
        write_file(dir.path(), "a.yaml", "kind: Bar\n");
        let h2 = hash_directory(dir.path()).unwrap();
        assert_ne!(h1.hash, h2.hash);
    }

    #[test]
    fn path_content_boundary_does_not_collide() {
        let dir1 = tempfile::tempdir().unwrap();
        write_file(dir1.path(), "a.yaml", "bc");
        let dir2 = tempfile::tempdir().unwrap();
        write_file(dir2.path(), "ab.yaml", "c");

        let h1 = hash_directory(dir1.path()).unwrap();
        let h2 = hash_directory(dir2.path()).unwrap();
        assert_ne!(h1.hash, h2.hash);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            hash_directory(dir.path()),
            Err(HashError::NoManifests { .. })
        ));
    }

    #[test]
    fn non_yaml_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "readme.txt", "not a manifest");
        assert!(matches!(
            hash_directory(dir.path()),
            Err(HashError::NoManifests { .. })
        ));
    }

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.yaml", "kind: Foo\n");
        let hashed = hash_directory(dir.path()).unwrap();
        assert_eq!(hashed.hash.len(), 16);
        assert!(hashed.hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
