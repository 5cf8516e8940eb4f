use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use coach_core::Clock;
use coach_core::model::{ContentNode, NodeId, NodeKind, UserId};
use coach_core::query::{Expr, MatchSpec, Scalar, fields};
use storage::repository::{ContentRepository, NodePatch, StorageError};

use crate::error::PublishError;

/// Publishes program versions, serializing writers per lineage.
///
/// A publish counts the live versions in a lineage and then writes twice:
/// it flags the priors superseded and inserts the successor. Two concurrent
/// publishes of the same lineage would race on that count, so the
/// per-lineage async mutex makes the whole sequence single-writer; distinct
/// lineages proceed independently.
#[derive(Clone)]
pub struct PublishService {
    clock: Clock,
    content: Arc<dyn ContentRepository>,
    locks: Arc<Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PublishService {
    #[must_use]
    pub fn new(clock: Clock, content: Arc<dyn ContentRepository>) -> Self {
        Self {
            clock,
            content,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lineage_lock(&self, lineage: &NodeId) -> Result<Arc<tokio::sync::Mutex<()>>, PublishError> {
        let mut registry = self
            .locks
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(registry
            .entry(lineage.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Publishes a new live version of the given program.
    ///
    /// Counts the existing versions in the lineage, flags every one of them
    /// superseded, and inserts a fresh program node with `version = count +
    /// 1`. Only the program node is version-bumped; session and exercise
    /// content stays with the authoring layer.
    ///
    /// # Errors
    ///
    /// Returns `PublishError::NotFound` when the source is absent, deleted,
    /// not a program, or not visible to the caller, and
    /// `PublishError::Storage` on repository failures.
    pub async fn publish(
        &self,
        user: &UserId,
        source_id: &NodeId,
    ) -> Result<ContentNode, PublishError> {
        let source = self
            .content
            .get(source_id)
            .await?
            .ok_or(PublishError::NotFound)?;
        if source.kind != NodeKind::Program || source.is_deleted || !source.is_visible_to(user) {
            return Err(PublishError::NotFound);
        }

        let lineage = source.lineage_root().clone();
        let lock = self.lineage_lock(&lineage)?;
        let _guard = lock.lock().await;

        // Live versions of this lineage: program nodes pointing at the
        // lineage root that carry a version number.
        let versions_spec = MatchSpec::new()
            .field(fields::KIND, NodeKind::Program.as_str())
            .field(fields::VERSION, Expr::Gte(Scalar::Int(1)))
            .any_field(fields::PARENT_PROGRAM_ID, &lineage)
            .any_field(fields::LIB_PROGRAM_ID, &lineage);

        let existing = self.content.count(&versions_spec).await?;
        self.content
            .update_many(&versions_spec, &NodePatch::flag_old_version())
            .await?;

        let version = i64::try_from(existing)
            .map_err(|_| StorageError::Serialization("version overflow".into()))?
            + 1;
        let now = self.clock.now();

        let mut published = ContentNode::program(
            NodeId::generate(),
            source.name.clone(),
            source.created_by.clone(),
            source.order,
            now,
        )?;
        published.share_with = source.share_with;
        published.is_public = source.is_public;
        published.version = Some(version);
        published.lib_program_id = Some(lineage.clone());
        self.content.upsert(&published).await?;

        info!(lineage = %lineage, version, "published program version");
        Ok(published)
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
