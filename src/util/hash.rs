//! # Task-directory hashing for the type-generation collaborator.
//!
//! The external codegen tool regenerates TypeScript-style type definitions
//! whenever the executor manifests change. The queue's part of that contract
//! is a stable digest over the admitted manifests, recorded in a fixed file
//! ([`TYPES_HASH_FILE`]) inside the task directory — the filename is never
//! taken from callers.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::QueueError;
use crate::executors::admissible;

/// Fixed name of the recorded-digest file inside the task directory.
pub const TYPES_HASH_FILE: &str = ".anqueue-types.hash";

/// SHA-256 over the admitted manifest files (name + content), hex-encoded.
///
/// Files are visited in sorted name order so the digest is stable across
/// platforms and directory iteration orders.
pub fn task_dir_digest(dir: &Path) -> Result<String, QueueError> {
    let entries = fs::read_dir(dir).map_err(|source| QueueError::TaskDirectory {
        path: dir.display().to_string(),
        source,
    })?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|name| admissible(name))
        .collect();
    names.sort_unstable();

    let mut hasher = Sha256::new();
    for name in names {
        let body = fs::read(dir.join(&name)).map_err(|source| QueueError::TaskDirectory {
            path: dir.display().to_string(),
            source,
        })?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&body);
        hasher.update([0u8]);
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// The digest recorded by the last check, if any.
pub fn read_recorded_digest(dir: &Path) -> Option<String> {
    let body = fs::read_to_string(dir.join(TYPES_HASH_FILE)).ok()?;
    let trimmed = body.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Records the digest for the next check.
pub fn record_digest(dir: &Path, digest: &str) -> std::io::Result<()> {
    fs::write(dir.join(TYPES_HASH_FILE), format!("{digest}\n"))
}

/// True when the manifests changed since the last recorded digest.
///
/// Always records the current digest, so the next check compares against
/// this run.
pub fn types_hash_changed(dir: &Path) -> Result<bool, QueueError> {
    let current = task_dir_digest(dir)?;
    let changed = read_recorded_digest(dir).as_deref() != Some(current.as_str());
    if changed {
        record_digest(dir, &current).map_err(|source| QueueError::TaskDirectory {
            path: dir.display().to_string(),
            source,
        })?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), r#"{"entry_point": "b"}"#).unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"entry_point": "a"}"#).unwrap();

        let first = task_dir_digest(dir.path()).unwrap();
        let second = task_dir_digest(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn digest_ignores_excluded_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"entry_point": "a"}"#).unwrap();
        let base = task_dir_digest(dir.path()).unwrap();

        std::fs::write(dir.path().join("a.test.json"), "ignored").unwrap();
        std::fs::write(dir.path().join(".hidden.json"), "ignored").unwrap();
        assert_eq!(task_dir_digest(dir.path()).unwrap(), base);

        std::fs::write(dir.path().join("b.json"), r#"{"entry_point": "b"}"#).unwrap();
        assert_ne!(task_dir_digest(dir.path()).unwrap(), base);
    }

    #[test]
    fn change_detection_records_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"entry_point": "a"}"#).unwrap();

        // First check: nothing recorded yet.
        assert!(types_hash_changed(dir.path()).unwrap());
        // Unchanged directory: stable.
        assert!(!types_hash_changed(dir.path()).unwrap());

        std::fs::write(dir.path().join("a.json"), r#"{"entry_point": "a2"}"#).unwrap();
        assert!(types_hash_changed(dir.path()).unwrap());
        assert!(!types_hash_changed(dir.path()).unwrap());

        assert!(read_recorded_digest(dir.path()).is_some());
    }
}
