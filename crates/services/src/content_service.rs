use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use coach_core::Clock;
use coach_core::model::{ContentNode, NodeId, NodeKind, UserId};
use coach_core::query::{Expr, MatchSpec, Page, Query, Scalar, SortSpec, fields};
use storage::repository::{ContentRepository, NodePatch};

use crate::config::ServiceConfig;
use crate::error::ContentError;

/// Read-side of the content tree plus the two writes the core owns:
/// soft-delete (with downward cascade) and the retention purge.
#[derive(Clone)]
pub struct ContentService {
    clock: Clock,
    config: ServiceConfig,
    content: Arc<dyn ContentRepository>,
}

impl ContentService {
    #[must_use]
    pub fn new(clock: Clock, config: ServiceConfig, content: Arc<dyn ContentRepository>) -> Self {
        Self {
            clock,
            config,
            content,
        }
    }

    /// Match spec selecting the live, visible children of a node.
    ///
    /// Every children listing and every rollup denominator goes through
    /// this one spec, so the two can never disagree on visibility.
    fn children_match(user: &UserId, parent: &ContentNode, child_kind: NodeKind) -> MatchSpec {
        MatchSpec::new()
            .field(fields::KIND, child_kind.as_str())
            .field(fields::PARENT_ID, &parent.id)
            .field(fields::IS_DELETED, false)
            .visible_to(user)
    }

    /// Fetch a node the caller is allowed to see.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::NotFound` when the node is absent,
    /// soft-deleted, or not visible to the caller.
    pub async fn visible(&self, user: &UserId, id: &NodeId) -> Result<ContentNode, ContentError> {
        let node = self.content.get(id).await?.ok_or(ContentError::NotFound)?;
        if node.is_deleted || !node.is_visible_to(user) {
            return Err(ContentError::NotFound);
        }
        Ok(node)
    }

    /// Like [`ContentService::visible`] but tolerates soft-deleted nodes;
    /// cleanup operations must keep working after content is deleted.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::NotFound` when the node is absent or not
    /// visible to the caller.
    pub async fn visible_even_deleted(
        &self,
        user: &UserId,
        id: &NodeId,
    ) -> Result<ContentNode, ContentError> {
        let node = self.content.get(id).await?.ok_or(ContentError::NotFound)?;
        if !node.is_visible_to(user) {
            return Err(ContentError::NotFound);
        }
        Ok(node)
    }

    /// All live children of a node visible to the user, in sibling order.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::Storage` on repository failures.
    pub async fn visible_children(
        &self,
        user: &UserId,
        parent: &ContentNode,
    ) -> Result<Vec<ContentNode>, ContentError> {
        let Some(child_kind) = parent.kind.child() else {
            return Ok(Vec::new());
        };
        let stages = Query::new(Self::children_match(user, parent, child_kind))
            .sort(SortSpec::Asc(fields::ORDER.to_owned()))
            .into_stages();
        Ok(self.content.find(&stages).await?)
    }

    /// One page of live visible children, in sibling order.
    ///
    /// The page limit is cumulative (page 2 of size 10 can surface up to 20
    /// rows); see [`Page::cumulative_limit`].
    ///
    /// # Errors
    ///
    /// Returns `ContentError::Storage` on repository failures.
    pub async fn children_page(
        &self,
        user: &UserId,
        parent: &ContentNode,
        page: Page,
    ) -> Result<Vec<ContentNode>, ContentError> {
        let Some(child_kind) = parent.kind.child() else {
            return Ok(Vec::new());
        };
        let stages = Query::new(Self::children_match(user, parent, child_kind))
            .sort(SortSpec::Asc(fields::ORDER.to_owned()))
            .page(page)
            .into_stages();
        Ok(self.content.find(&stages).await?)
    }

    /// Count of live children visible to the user.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::Storage` on repository failures.
    pub async fn count_visible_children(
        &self,
        user: &UserId,
        parent: &ContentNode,
    ) -> Result<u64, ContentError> {
        let Some(child_kind) = parent.kind.child() else {
            return Ok(0);
        };
        Ok(self
            .content
            .count(&Self::children_match(user, parent, child_kind))
            .await?)
    }

    /// Child ids with no deletion or visibility filter.
    ///
    /// Structural read for cleanup paths that must reach rows whose content
    /// is already gone for regular readers.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::Storage` on repository failures.
    pub async fn all_child_ids(
        &self,
        parent: &NodeId,
        kind: NodeKind,
    ) -> Result<Vec<NodeId>, ContentError> {
        let stages = Query::new(
            MatchSpec::new()
                .field(fields::KIND, kind.as_str())
                .field(fields::PARENT_ID, parent),
        )
        .into_stages();
        Ok(self
            .content
            .find(&stages)
            .await?
            .into_iter()
            .map(|node| node.id)
            .collect())
    }

    /// The session after `current` in its program: minimal `order` strictly
    /// greater than the current one, ties broken by id. `None` when the
    /// program has no further session, which is a normal terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::Storage` on repository failures.
    pub async fn next_session(
        &self,
        user: &UserId,
        current: &ContentNode,
    ) -> Result<Option<ContentNode>, ContentError> {
        let Some(program_id) = current.parent_id.as_ref() else {
            return Ok(None);
        };
        let spec = MatchSpec::new()
            .field(fields::KIND, NodeKind::Session.as_str())
            .field(fields::PARENT_ID, program_id)
            .field(fields::IS_DELETED, false)
            .field(fields::ORDER, Expr::Gt(Scalar::Int(current.order)))
            .visible_to(user);
        let stages = Query::new(spec)
            .sort(SortSpec::Asc(fields::ORDER.to_owned()))
            .page(Page::new(1, 1))
            .into_stages();
        Ok(self.content.find(&stages).await?.into_iter().next())
    }

    /// Soft-deletes a node and cascades downward.
    ///
    /// The cascade is best-effort bulk updates, not a transaction: a
    /// failure mid-way leaves some descendants unmarked. Readers tolerate
    /// that because children are only reachable through their parent.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::NotFound` for missing/invisible targets and
    /// `ContentError::Storage` on repository failures.
    pub async fn soft_delete(&self, user: &UserId, id: &NodeId) -> Result<(), ContentError> {
        let node = self.visible(user, id).await?;
        let now = self.clock.now();
        let patch = NodePatch::soft_delete(now);

        self.content
            .update_many(&MatchSpec::new().field(fields::ID, &node.id), &patch)
            .await?;

        match node.kind {
            NodeKind::Program => {
                let session_ids = self.all_child_ids(&node.id, NodeKind::Session).await?;
                self.content
                    .update_many(
                        &MatchSpec::new()
                            .field(fields::KIND, NodeKind::Session.as_str())
                            .field(fields::PARENT_ID, &node.id),
                        &patch,
                    )
                    .await?;
                if !session_ids.is_empty() {
                    let parents: Vec<Scalar> = session_ids.iter().map(Scalar::from).collect();
                    self.content
                        .update_many(
                            &MatchSpec::new()
                                .field(fields::KIND, NodeKind::Exercise.as_str())
                                .field(fields::PARENT_ID, parents),
                            &patch,
                        )
                        .await?;
                }
            }
            NodeKind::Session => {
                self.content
                    .update_many(
                        &MatchSpec::new()
                            .field(fields::KIND, NodeKind::Exercise.as_str())
                            .field(fields::PARENT_ID, &node.id),
                        &patch,
                    )
                    .await?;
            }
            NodeKind::Exercise => {}
        }

        info!(node = %node.id, kind = %node.kind, "soft-deleted content node");
        Ok(())
    }

    /// Hard-deletes nodes whose soft-delete is older than the retention
    /// window. Returns how many rows were removed.
    ///
    /// # Errors
    ///
    /// Returns `ContentError::Storage` on repository failures.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, ContentError> {
        let cutoff = now - Duration::days(self.config.deleted_retention_days);
        let spec = MatchSpec::new()
            .field(fields::IS_DELETED, true)
            .field(fields::DELETED_AT, Expr::Lte(Scalar::Time(cutoff)));
        let removed = self.content.delete_where(&spec).await?;
        if removed > 0 {
            info!(removed, "purged expired soft-deleted nodes");
        }
        Ok(removed)
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
