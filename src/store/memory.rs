//! # In-memory reference adapter.
//!
//! [`MemoryAdapter`] implements the [`StoreAdapter`] contract over a plain
//! map. It backs the test suite and is a usable default for applications
//! that want persistence semantics (sync recovery, completed-row eviction)
//! without an external database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::AdapterError;
use crate::store::adapter::{RowFilter, StoreAdapter, TaskRow};

/// Map-backed [`StoreAdapter`].
#[derive(Default)]
pub struct MemoryAdapter {
    rows: RwLock<HashMap<String, TaskRow>>,
}

impl MemoryAdapter {
    /// Creates an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// True when no rows are stored.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Seeds a row directly, bypassing uniqueness checks. Test helper.
    pub async fn seed(&self, row: TaskRow) {
        self.rows.write().await.insert(row.uid.clone(), row);
    }
}

#[async_trait]
impl StoreAdapter for MemoryAdapter {
    async fn find_first(&self, filter: &RowFilter) -> Result<Option<TaskRow>, AdapterError> {
        Ok(self.find_many(filter).await?.into_iter().next())
    }

    async fn find_many(&self, filter: &RowFilter) -> Result<Vec<TaskRow>, AdapterError> {
        let rows = self.rows.read().await;
        let mut matched: Vec<TaskRow> = rows.values().filter(|r| filter.matches(r)).cloned().collect();
        matched.sort_by(|a, b| a.uid.cmp(&b.uid));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn create(&self, row: TaskRow) -> Result<TaskRow, AdapterError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&row.uid) {
            return Err(AdapterError::UniqueViolation {
                uid: row.uid.clone(),
            });
        }
        rows.insert(row.uid.clone(), row.clone());
        Ok(row)
    }

    async fn update(&self, uid: &str, row: TaskRow) -> Result<TaskRow, AdapterError> {
        let mut rows = self.rows.write().await;
        if !rows.contains_key(uid) {
            return Err(AdapterError::Backend {
                message: format!("row '{uid}' not found"),
            });
        }
        rows.insert(uid.to_string(), row.clone());
        Ok(row)
    }

    async fn delete(&self, uid: &str) -> Result<bool, AdapterError> {
        Ok(self.rows.write().await.remove(uid).is_some())
    }

    async fn upsert(
        &self,
        uid: &str,
        update: TaskRow,
        create: TaskRow,
    ) -> Result<TaskRow, AdapterError> {
        let mut rows = self.rows.write().await;
        let row = if rows.contains_key(uid) { update } else { create };
        rows.insert(uid.to_string(), row.clone());
        Ok(row)
    }
}
