//! Non-core glue: task-directory hashing for the external type-generation
//! collaborator.

mod hash;

pub use hash::{read_recorded_digest, record_digest, task_dir_digest, TYPES_HASH_FILE};

pub(crate) use hash::types_hash_changed;
