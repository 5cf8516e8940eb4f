use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use coach_core::model::{ContentNode, ExecStatus, ExecutionRecord, NodeId, NodeKind, UserId};
use coach_core::query::{MatchSpec, Stage};

use crate::pipeline;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Partial update applied to every node matching a specification.
///
/// Unset fields are left untouched. This backs the soft-delete cascade and
/// the old-version flagging done by publish.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub is_deleted: Option<bool>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_old_version: Option<bool>,
}

impl NodePatch {
    /// Marks matching nodes soft-deleted at the given time.
    #[must_use]
    pub fn soft_delete(at: DateTime<Utc>) -> Self {
        Self {
            is_deleted: Some(true),
            deleted_at: Some(at),
            is_old_version: None,
        }
    }

    /// Flags matching program versions as superseded.
    #[must_use]
    pub fn flag_old_version() -> Self {
        Self {
            is_deleted: None,
            deleted_at: None,
            is_old_version: Some(true),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_deleted.is_none() && self.deleted_at.is_none() && self.is_old_version.is_none()
    }

    fn apply(&self, node: &mut ContentNode) {
        if let Some(deleted) = self.is_deleted {
            node.is_deleted = deleted;
        }
        if let Some(at) = self.deleted_at {
            node.deleted_at = Some(at);
        }
        if let Some(old) = self.is_old_version {
            node.is_old_version = old;
        }
    }
}

/// Repository contract over the shared content tree.
///
/// Content documents are authored elsewhere; this interface reads them,
/// soft-deletes them, and version-bumps them, nothing more. `get` returns
/// soft-deleted nodes as well; deletion and visibility policy belong to
/// the callers, who need to see deleted rows for cleanup.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Fetch a node by id regardless of its deletion state.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the lookup fails.
    async fn get(&self, id: &NodeId) -> Result<Option<ContentNode>, StorageError>;

    /// Execute a compiled stage list and materialize the matching nodes.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` for unknown field names, or
    /// other storage errors.
    async fn find(&self, stages: &[Stage]) -> Result<Vec<ContentNode>, StorageError>;

    /// Count the nodes matching a specification.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` for unknown field names, or
    /// other storage errors.
    async fn count(&self, spec: &MatchSpec) -> Result<u64, StorageError>;

    /// Persist or update a node.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the node cannot be stored.
    async fn upsert(&self, node: &ContentNode) -> Result<(), StorageError>;

    /// Apply a patch to every matching node, returning how many changed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the update fails.
    async fn update_many(&self, spec: &MatchSpec, patch: &NodePatch) -> Result<u64, StorageError>;

    /// Hard-delete every matching node, returning how many were removed.
    ///
    /// Used only by the retention purge of expired soft-deleted nodes.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    async fn delete_where(&self, spec: &MatchSpec) -> Result<u64, StorageError>;
}

/// Repository contract for per-user execution records.
///
/// Records are keyed by `(user, target kind, target id)` and owned
/// exclusively by the progress engine.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Fetch one record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the lookup fails.
    async fn get(
        &self,
        user: &UserId,
        kind: NodeKind,
        target: &NodeId,
    ) -> Result<Option<ExecutionRecord>, StorageError>;

    /// Persist or replace a record (rollup status writes).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the record cannot be stored.
    async fn upsert(&self, record: &ExecutionRecord) -> Result<(), StorageError>;

    /// Write-once completion: promotes a missing or active record to done.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` when a done record already exists,
    /// making a concurrent duplicate submission lose deterministically.
    async fn mark_done_once(&self, record: &ExecutionRecord) -> Result<(), StorageError>;

    /// Count done records of the given kind under one parent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the count fails.
    async fn count_done(
        &self,
        user: &UserId,
        kind: NodeKind,
        parent: &NodeId,
    ) -> Result<u64, StorageError>;

    /// Fetch the records for the listed targets; missing targets are simply
    /// absent from the result.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the lookup fails.
    async fn list_for_targets(
        &self,
        user: &UserId,
        kind: NodeKind,
        targets: &[NodeId],
    ) -> Result<Vec<ExecutionRecord>, StorageError>;

    /// Hard-delete every record one user holds for a program: the program
    /// row itself, its session rows, and the exercise rows under the given
    /// sessions. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    async fn delete_for_program(
        &self,
        user: &UserId,
        program: &NodeId,
        sessions: &[NodeId],
    ) -> Result<u64, StorageError>;
}

type ExecKey = (UserId, NodeKind, NodeId);

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    nodes: Arc<Mutex<HashMap<NodeId, ContentNode>>>,
    records: Arc<Mutex<HashMap<ExecKey, ExecutionRecord>>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Result<Vec<ContentNode>, StorageError> {
        let guard = self
            .nodes
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut nodes: Vec<_> = guard.values().cloned().collect();
        // Deterministic base order before any sort stage runs.
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}

#[async_trait]
impl ContentRepository for InMemoryRepository {
    async fn get(&self, id: &NodeId) -> Result<Option<ContentNode>, StorageError> {
        let guard = self
            .nodes
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn find(&self, stages: &[Stage]) -> Result<Vec<ContentNode>, StorageError> {
        pipeline::apply_stages(self.snapshot()?, stages)
    }

    async fn count(&self, spec: &MatchSpec) -> Result<u64, StorageError> {
        let mut total = 0_u64;
        for node in self.snapshot()? {
            if pipeline::eval_match(&node, spec)? {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn upsert(&self, node: &ContentNode) -> Result<(), StorageError> {
        let mut guard = self
            .nodes
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn update_many(&self, spec: &MatchSpec, patch: &NodePatch) -> Result<u64, StorageError> {
        let mut guard = self
            .nodes
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut changed = 0_u64;
        for node in guard.values_mut() {
            if pipeline::eval_match(node, spec)? {
                patch.apply(node);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_where(&self, spec: &MatchSpec) -> Result<u64, StorageError> {
        let mut guard = self
            .nodes
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut doomed = Vec::new();
        for (id, node) in guard.iter() {
            if pipeline::eval_match(node, spec)? {
                doomed.push(id.clone());
            }
        }
        for id in &doomed {
            guard.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn get(
        &self,
        user: &UserId,
        kind: NodeKind,
        target: &NodeId,
    ) -> Result<Option<ExecutionRecord>, StorageError> {
        let guard = self
            .records
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard
            .get(&(user.clone(), kind, target.clone()))
            .cloned())
    }

    async fn upsert(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let key = (
            record.user_id.clone(),
            record.target_kind,
            record.target_id.clone(),
        );
        guard.insert(key, record.clone());
        Ok(())
    }

    async fn mark_done_once(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let key = (
            record.user_id.clone(),
            record.target_kind,
            record.target_id.clone(),
        );
        if let Some(existing) = guard.get(&key) {
            if existing.status == ExecStatus::Done {
                return Err(StorageError::Conflict);
            }
        }
        let mut done = record.clone();
        done.status = ExecStatus::Done;
        guard.insert(key, done);
        Ok(())
    }

    async fn count_done(
        &self,
        user: &UserId,
        kind: NodeKind,
        parent: &NodeId,
    ) -> Result<u64, StorageError> {
        let guard = self
            .records
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard
            .values()
            .filter(|r| {
                r.user_id == *user
                    && r.target_kind == kind
                    && r.parent_id == *parent
                    && r.status == ExecStatus::Done
            })
            .count() as u64)
    }

    async fn list_for_targets(
        &self,
        user: &UserId,
        kind: NodeKind,
        targets: &[NodeId],
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let guard = self
            .records
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut found = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(record) = guard.get(&(user.clone(), kind, target.clone())) {
                found.push(record.clone());
            }
        }
        Ok(found)
    }

    async fn delete_for_program(
        &self,
        user: &UserId,
        program: &NodeId,
        sessions: &[NodeId],
    ) -> Result<u64, StorageError> {
        let mut guard = self
            .records
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let before = guard.len();
        guard.retain(|(owner, _, _), record| {
            if owner != user {
                return true;
            }
            let in_scope = record.target_id == *program
                || record.parent_id == *program
                || sessions.contains(&record.parent_id);
            !in_scope
        });
        Ok((before - guard.len()) as u64)
    }
}

/// Aggregates the content and execution repositories behind trait objects
/// for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub content: Arc<dyn ContentRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let content: Arc<dyn ContentRepository> = Arc::new(repo.clone());
        let executions: Arc<dyn ExecutionRepository> = Arc::new(repo);
        Self {
            content,
            executions,
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
