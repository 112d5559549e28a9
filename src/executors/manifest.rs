//! # Executor manifest discovery.
//!
//! The task directory binds executor types to implementations: one JSON
//! manifest per executor, the filename stem is the task `type`, and the
//! manifest's `entry_point` names a factory registered in the
//! [`ExecutorSet`](crate::ExecutorSet).
//!
//! ```text
//! tasks/
//!   image.json          → type "image",  {"entry_point": "image-resizer"}
//!   email.json          → type "email",  {"entry_point": "smtp-sender"}
//!   email.test.json     → ignored (test segment)
//!   email.copy.json     → ignored (copy segment)
//!   .draft.json         → ignored (hidden)
//! ```
//!
//! ## Rules
//! - The scan is non-recursive; only regular files are considered.
//! - Admission is by name: `.json` extension, not hidden, and no `test` or
//!   `copy` dot-segment anywhere in the name.
//! - Results are ordered by type so registration is deterministic.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Manifest body binding a task type to a registered factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorManifest {
    /// Name of the factory registered in the [`ExecutorSet`](crate::ExecutorSet).
    pub entry_point: String,
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One admitted manifest file, parsed.
#[derive(Debug, Clone)]
pub(crate) struct DiscoveredExecutor {
    /// Executor type (filename stem).
    pub task_type: String,
    /// Path of the manifest file.
    pub path: PathBuf,
    /// Parsed manifest body.
    pub manifest: ExecutorManifest,
}

/// Result of scanning a task directory.
#[derive(Debug, Default)]
pub(crate) struct ScanOutcome {
    /// Admitted and parsed manifests, ordered by type.
    pub executors: Vec<DiscoveredExecutor>,
    /// Admitted files whose manifest failed to parse, with the reason.
    pub rejected: Vec<(PathBuf, String)>,
}

/// True when a file name is admitted by the discovery rules.
pub(crate) fn admissible(file_name: &str) -> bool {
    if file_name.starts_with('.') {
        return false;
    }
    let mut segments = file_name.split('.');
    let Some(_stem) = segments.next() else {
        return false;
    };
    let rest: Vec<&str> = segments.collect();
    match rest.last() {
        Some(&"json") => {}
        _ => return false,
    }
    !rest.iter().any(|seg| *seg == "test" || *seg == "copy")
}

/// Scans `dir` (non-recursive) for executor manifests.
pub(crate) fn scan(dir: &Path) -> Result<ScanOutcome, QueueError> {
    let entries = fs::read_dir(dir).map_err(|source| QueueError::TaskDirectory {
        path: dir.display().to_string(),
        source,
    })?;

    let mut outcome = ScanOutcome::default();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !admissible(name) {
            continue;
        }
        let task_type = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };
        match fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|body| serde_json::from_str::<ExecutorManifest>(&body).map_err(|e| e.to_string()))
        {
            Ok(manifest) => outcome.executors.push(DiscoveredExecutor {
                task_type,
                path,
                manifest,
            }),
            Err(reason) => outcome.rejected.push((path, reason)),
        }
    }

    outcome.executors.sort_by(|a, b| a.task_type.cmp(&b.task_type));
    Ok(outcome)
}
