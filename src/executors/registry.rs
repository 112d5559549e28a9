//! # Executor registry: discovery, validation, indexing.
//!
//! The [`ExecutorRegistry`] pairs manifest files discovered in the task
//! directory with factories registered in an [`ExecutorSet`], validates each
//! constructed executor, and indexes them by task type for the dispatcher and
//! the worker runtimes.
//!
//! ## Architecture
//! ```text
//! ExecutorSet (code)             task_dir (filesystem)
//!   "image-resizer" → factory      image.json {entry_point: "image-resizer"}
//!   "smtp-sender"   → factory      email.json {entry_point: "smtp-sender"}
//!            │                            │
//!            └────────── initialize ──────┘
//!                           │
//!            per discovered manifest:
//!              resolve factory → construct with type
//!              → probe retry_schema / validation_schema
//!              → sanitize validators against a synthetic task
//!              → index under the filename stem
//! ```
//!
//! ## Rules
//! - `initialize` is idempotent; the second call is a no-op.
//! - Validators that panic on the synthetic probe task are dropped; each
//!   removal is recorded and, on the controller, warned about.
//! - A schema that sanitizes to empty while the raw schema was non-empty is
//!   warned about on the controller.
//! - Registration logs are emitted on the controller only, keeping worker
//!   output quiet.
//! - The raw (unsanitized) schema stays reachable via
//!   [`raw_validation_schema`](ExecutorRegistry::raw_validation_schema).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::executors::executor::{Executor, Validator};
use crate::executors::manifest;
use crate::tasks::Task;

/// Factory constructing an executor for a given task type.
pub type ExecutorFactory = Arc<dyn Fn(&str) -> Arc<dyn Executor> + Send + Sync>;

/// Which side of the controller/worker split is loading executors.
///
/// Controllers log registrations and sanitization warnings; workers stay
/// quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryRole {
    /// The queue controller; registration is logged.
    Controller,
    /// A worker runtime; loading is silent.
    Worker,
}

/// Code-registered executor factories, keyed by entry point.
///
/// ```
/// use std::sync::Arc;
/// use anqueue::{ExecutorSet, Executor};
/// # use anqueue::{Task, TaskResult, ExecError};
/// # use async_trait::async_trait;
/// # struct Noop(String);
/// # #[async_trait]
/// # impl Executor for Noop {
/// #     fn task_type(&self) -> &str { &self.0 }
/// #     async fn exec(&self, _t: &Task) -> Result<TaskResult, ExecError> {
/// #         Ok(TaskResult::processed())
/// #     }
/// # }
///
/// let mut set = ExecutorSet::new();
/// set.register("noop", |task_type| Arc::new(Noop(task_type.to_string())));
/// assert!(set.contains("noop"));
/// ```
#[derive(Clone, Default)]
pub struct ExecutorSet {
    factories: HashMap<String, ExecutorFactory>,
}

impl ExecutorSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under an entry-point name.
    ///
    /// The factory receives the task type (the manifest's filename stem) and
    /// returns the constructed executor. Re-registering a name replaces the
    /// previous factory.
    pub fn register<F, E>(&mut self, entry_point: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Arc<E> + Send + Sync + 'static,
        E: Executor,
    {
        self.factories.insert(
            entry_point.into(),
            Arc::new(move |task_type| factory(task_type) as Arc<dyn Executor>),
        );
        self
    }

    /// True when an entry point is registered.
    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories.contains_key(entry_point)
    }

    /// Number of registered entry points.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True when no entry points are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn factory(&self, entry_point: &str) -> Option<&ExecutorFactory> {
        self.factories.get(entry_point)
    }
}

/// One validated, indexed executor.
struct RegistryEntry {
    executor: Arc<dyn Executor>,
    schema: Vec<Validator>,
    raw_schema: Vec<Validator>,
    removed: Vec<String>,
    retry_patterns: Vec<String>,
}

/// Discovers, validates, and indexes executors by task type.
pub struct ExecutorRegistry {
    task_dir: PathBuf,
    set: ExecutorSet,
    role: RegistryRole,
    entries: OnceLock<HashMap<String, RegistryEntry>>,
}

impl ExecutorRegistry {
    /// Creates a registry over `task_dir` with the given factories.
    pub fn new(task_dir: impl AsRef<Path>, set: ExecutorSet, role: RegistryRole) -> Self {
        Self {
            task_dir: task_dir.as_ref().to_path_buf(),
            set,
            role,
            entries: OnceLock::new(),
        }
    }

    /// Scans the task directory and indexes every admissible executor.
    ///
    /// Idempotent: once initialized, further calls return immediately.
    pub fn initialize(&self) -> Result<(), QueueError> {
        if self.entries.get().is_some() {
            return Ok(());
        }
        let outcome = manifest::scan(&self.task_dir)?;
        let controller = self.role == RegistryRole::Controller;

        if controller {
            for (path, reason) in &outcome.rejected {
                warn!(path = %path.display(), %reason, "skipping unparsable executor manifest");
            }
        }

        let mut entries = HashMap::with_capacity(outcome.executors.len());
        for discovered in outcome.executors {
            let task_type = discovered.task_type;
            let Some(factory) = self.set.factory(&discovered.manifest.entry_point) else {
                if controller {
                    warn!(
                        %task_type,
                        entry_point = %discovered.manifest.entry_point,
                        "no factory registered for manifest entry point; skipping"
                    );
                }
                continue;
            };
            let executor = factory(&task_type);

            // Probe both schemas once; a panicking schema disqualifies the
            // whole module.
            let schemas = catch_unwind(AssertUnwindSafe(|| {
                (executor.retry_schema(), executor.validation_schema())
            }));
            let (retry_patterns, raw_schema) = match schemas {
                Ok(pair) => pair,
                Err(_) => {
                    if controller {
                        warn!(%task_type, "executor schema probe panicked; skipping");
                    }
                    continue;
                }
            };

            let (schema, removed) = sanitize_schema(&task_type, &raw_schema);
            if controller {
                for removal in &removed {
                    warn!(%task_type, %removal, "dropped misbehaving validator");
                }
                if schema.is_empty() && !raw_schema.is_empty() {
                    warn!(
                        %task_type,
                        raw = raw_schema.len(),
                        "validation schema is empty after sanitization"
                    );
                }
                info!(
                    %task_type,
                    validators = schema.len(),
                    retry_patterns = retry_patterns.len(),
                    "registered executor"
                );
            }

            entries.insert(
                task_type,
                RegistryEntry {
                    executor,
                    schema,
                    raw_schema,
                    removed,
                    retry_patterns,
                },
            );
        }

        if self.entries.set(entries).is_err() {
            debug!("executor registry initialized concurrently; keeping first index");
        }
        Ok(())
    }

    /// True once `initialize` has completed.
    pub fn is_initialized(&self) -> bool {
        self.entries.get().is_some()
    }

    /// Looks up the executor for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Executor>> {
        self.entry(task_type).map(|e| Arc::clone(&e.executor))
    }

    /// The sanitized validation schema for a task type.
    pub fn validation_schema(&self, task_type: &str) -> Option<Vec<Validator>> {
        self.entry(task_type).map(|e| e.schema.clone())
    }

    /// The raw (pre-sanitization) validation schema for a task type.
    pub fn raw_validation_schema(&self, task_type: &str) -> Option<Vec<Validator>> {
        self.entry(task_type).map(|e| e.raw_schema.clone())
    }

    /// Reasons recorded for validators dropped during sanitization.
    pub fn removed_validators(&self, task_type: &str) -> Option<Vec<String>> {
        self.entry(task_type).map(|e| e.removed.clone())
    }

    /// The retry patterns probed at registration.
    pub fn retry_patterns(&self, task_type: &str) -> Option<Vec<String>> {
        self.entry(task_type).map(|e| e.retry_patterns.clone())
    }

    /// True when an executor is indexed for the type.
    pub fn contains(&self, task_type: &str) -> bool {
        self.entry(task_type).is_some()
    }

    /// All registered task types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .get()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        types.sort_unstable();
        types
    }

    /// Number of registered executors.
    pub fn len(&self) -> usize {
        self.entries.get().map(|m| m.len()).unwrap_or(0)
    }

    /// True when no executors are registered (or before initialization).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The directory this registry scans.
    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    fn entry(&self, task_type: &str) -> Option<&RegistryEntry> {
        self.entries.get().and_then(|m| m.get(task_type))
    }
}

/// Drops validators that panic on a synthetic probe task.
///
/// Returns the sanitized schema and one removal record per dropped entry.
fn sanitize_schema(task_type: &str, raw: &[Validator]) -> (Vec<Validator>, Vec<String>) {
    let probe = Task::synthetic(task_type);
    let mut kept = Vec::with_capacity(raw.len());
    let mut removed = Vec::new();
    for (idx, validator) in raw.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| validator.check(&probe))) {
            Ok(_) => kept.push(validator.clone()),
            Err(_) => removed.push(format!(
                "validator '{}' (#{idx}) panicked on probe task",
                validator.name()
            )),
        }
    }
    (kept, removed)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::ExecError;
    use crate::tasks::TaskResult;

    struct Probe {
        task_type: String,
        validators: Vec<Validator>,
    }

    #[async_trait]
    impl Executor for Probe {
        fn task_type(&self) -> &str {
            &self.task_type
        }

        fn validation_schema(&self) -> Vec<Validator> {
            self.validators.clone()
        }

        fn retry_schema(&self) -> Vec<String> {
            vec!["retryable".into()]
        }

        async fn exec(&self, _task: &Task) -> Result<TaskResult, ExecError> {
            Ok(TaskResult::processed())
        }
    }

    fn write_manifest(dir: &Path, task_type: &str, entry_point: &str) {
        std::fs::write(
            dir.join(format!("{task_type}.json")),
            serde_json::json!({"entry_point": entry_point}).to_string(),
        )
        .unwrap();
    }

    fn probe_set(validators: Vec<Validator>) -> ExecutorSet {
        let mut set = ExecutorSet::new();
        set.register("probe", move |task_type| {
            Arc::new(Probe {
                task_type: task_type.to_string(),
                validators: validators.clone(),
            })
        });
        set
    }

    #[test]
    fn initialize_indexes_by_stem_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "resize", "probe");
        write_manifest(dir.path(), "encode", "probe");

        let registry = ExecutorRegistry::new(dir.path(), probe_set(vec![]), RegistryRole::Controller);
        registry.initialize().unwrap();
        registry.initialize().unwrap();

        assert_eq!(registry.types(), vec!["encode", "resize"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("resize").unwrap().task_type(), "resize");
        assert_eq!(
            registry.retry_patterns("encode").unwrap(),
            vec!["retryable".to_string()]
        );
    }

    #[test]
    fn unknown_entry_point_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "resize", "missing-factory");

        let registry = ExecutorRegistry::new(dir.path(), probe_set(vec![]), RegistryRole::Controller);
        registry.initialize().unwrap();
        assert!(registry.is_empty());
        assert!(!registry.contains("resize"));
    }

    #[test]
    fn sanitization_drops_panicking_validators() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "resize", "probe");

        let validators = vec![
            Validator::new("fine", |_t: &Task| true),
            Validator::new("explodes", |_t: &Task| panic!("boom")),
        ];
        let registry =
            ExecutorRegistry::new(dir.path(), probe_set(validators), RegistryRole::Controller);
        registry.initialize().unwrap();

        let schema = registry.validation_schema("resize").unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0].name(), "fine");

        let raw = registry.raw_validation_schema("resize").unwrap();
        assert_eq!(raw.len(), 2);

        let removed = registry.removed_validators("resize").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].contains("explodes"));
    }

    #[test]
    fn worker_role_loads_quietly() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "resize", "probe");

        let registry = ExecutorRegistry::new(dir.path(), probe_set(vec![]), RegistryRole::Worker);
        registry.initialize().unwrap();
        assert!(registry.contains("resize"));
    }
}
