use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use coach_core::Clock;
use coach_core::model::{
    ContentNode, ExecStatus, ExecutionRecord, NodeId, NodeKind, ProgressState, UserId,
    annotate_ready,
};
use coach_core::query::Page;
use storage::repository::{ExecutionRepository, StorageError};

use super::rollup::refresh_parent_status;
use crate::config::ServiceConfig;
use crate::content_service::ContentService;
use crate::error::ProgressError;

/// Result of completing an exercise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub is_session_done: bool,
    pub is_program_done: bool,
    /// The session to move to once the current one closed; `None` while the
    /// session is still open or when the program has no further session.
    pub next_session_id: Option<NodeId>,
}

/// A content node paired with the caller's display state.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeProgress {
    pub node: ContentNode,
    pub state: ProgressState,
}

/// The per-user progress engine: sequencing, completion, rollups, and
/// progress-annotated listings over the content tree.
#[derive(Clone)]
pub struct ProgressService {
    clock: Clock,
    config: ServiceConfig,
    content: ContentService,
    executions: Arc<dyn ExecutionRepository>,
}

impl ProgressService {
    #[must_use]
    pub fn new(
        clock: Clock,
        config: ServiceConfig,
        content: ContentService,
        executions: Arc<dyn ExecutionRepository>,
    ) -> Self {
        Self {
            clock,
            config,
            content,
            executions,
        }
    }

    /// Marks an exercise done for the user and rolls the completion up the
    /// tree.
    ///
    /// The three writes (exercise record, session rollup, program rollup)
    /// run strictly in sequence because each rollup counts records written
    /// by the step before it. A storage failure part-way aborts the request;
    /// retrying is safe since rollups recompute from counts.
    ///
    /// # Errors
    ///
    /// - `ProgressError::NotFound`: exercise, session, or program absent,
    ///   soft-deleted, or not visible to the user.
    /// - `ProgressError::AlreadyDone`: the exercise already has a done
    ///   record (also covers a concurrent duplicate submission).
    /// - `ProgressError::OutOfSequence`: the preceding visible sibling is
    ///   not done yet.
    /// - `ProgressError::Storage`: repository failure.
    pub async fn run_exercise(
        &self,
        user: &UserId,
        exercise_id: &NodeId,
    ) -> Result<RunOutcome, ProgressError> {
        let exercise = self.content.visible(user, exercise_id).await?;
        if exercise.kind != NodeKind::Exercise {
            return Err(ProgressError::NotFound);
        }
        let session_id = exercise.parent_id.clone().ok_or(ProgressError::NotFound)?;
        let session = self.content.visible(user, &session_id).await?;
        let program_id = session.parent_id.clone().ok_or(ProgressError::NotFound)?;
        let program = self.content.visible(user, &program_id).await?;

        // Re-marking a done exercise is rejected before gating runs, so the
        // caller learns the real reason.
        if let Some(existing) = self
            .executions
            .get(user, NodeKind::Exercise, &exercise.id)
            .await?
        {
            if existing.status == ExecStatus::Done {
                return Err(ProgressError::AlreadyDone);
            }
        }

        self.check_gate(user, &session, &exercise).await?;

        let now = self.clock.now();
        let record = ExecutionRecord::new(
            user.clone(),
            NodeKind::Exercise,
            exercise.id.clone(),
            session.id.clone(),
            ExecStatus::Done,
            now,
        );
        // Write-once completion: a duplicate that slipped past the read
        // above loses here instead of double-counting.
        match self.executions.mark_done_once(&record).await {
            Ok(()) => {}
            Err(StorageError::Conflict) => return Err(ProgressError::AlreadyDone),
            Err(e) => return Err(e.into()),
        }

        let session_status = refresh_parent_status(
            &self.content,
            self.executions.as_ref(),
            user,
            &session,
            &program.id,
            now,
        )
        .await?;
        // Program records carry their own id as parent so clear-execution
        // can select every level with one program key.
        let program_status = refresh_parent_status(
            &self.content,
            self.executions.as_ref(),
            user,
            &program,
            &program.id,
            now,
        )
        .await?;

        let is_session_done = session_status == ExecStatus::Done;
        let is_program_done = program_status == ExecStatus::Done;
        let next_session_id = if is_session_done {
            self.content
                .next_session(user, &session)
                .await?
                .map(|node| node.id)
        } else {
            None
        };

        info!(
            user = %user,
            exercise = %exercise.id,
            is_session_done,
            is_program_done,
            "exercise completed"
        );

        Ok(RunOutcome {
            is_session_done,
            is_program_done,
            next_session_id,
        })
    }

    /// Sequencing gate: within the visible sibling list the exercise right
    /// before the target must already be done, unless the target is first.
    async fn check_gate(
        &self,
        user: &UserId,
        session: &ContentNode,
        exercise: &ContentNode,
    ) -> Result<(), ProgressError> {
        let siblings = self.content.visible_children(user, session).await?;
        let position = siblings
            .iter()
            .position(|node| node.id == exercise.id)
            .ok_or(ProgressError::NotFound)?;
        if position == 0 {
            return Ok(());
        }

        let previous = &siblings[position - 1];
        let previous_done = self
            .executions
            .get(user, NodeKind::Exercise, &previous.id)
            .await?
            .is_some_and(|record| record.status == ExecStatus::Done);
        if previous_done {
            Ok(())
        } else {
            Err(ProgressError::OutOfSequence)
        }
    }

    /// The user's display state for one target; `ToDo` when no record
    /// exists yet.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::NotFound` for absent/deleted/invisible
    /// targets, or `ProgressError::Storage` on repository failures.
    pub async fn get_progress(
        &self,
        user: &UserId,
        kind: NodeKind,
        target: &NodeId,
    ) -> Result<ProgressState, ProgressError> {
        let node = self.content.visible(user, target).await?;
        if node.kind != kind {
            return Err(ProgressError::NotFound);
        }
        let state = self
            .executions
            .get(user, kind, target)
            .await?
            .map_or(ProgressState::ToDo, |record| record.status.into());
        Ok(state)
    }

    /// Hard-deletes every execution record the user holds for a program.
    ///
    /// Works on soft-deleted programs too, since record cleanup must
    /// outlive the content, and collects session ids regardless of their
    /// deletion state so orphaned exercise records go as well.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::NotFound` for absent/invisible programs, or
    /// `ProgressError::Storage` on repository failures.
    pub async fn clear_execution(
        &self,
        user: &UserId,
        program_id: &NodeId,
    ) -> Result<(), ProgressError> {
        let program = self.content.visible_even_deleted(user, program_id).await?;
        if program.kind != NodeKind::Program {
            return Err(ProgressError::NotFound);
        }
        let session_ids = self
            .content
            .all_child_ids(&program.id, NodeKind::Session)
            .await?;
        let removed = self
            .executions
            .delete_for_program(user, &program.id, &session_ids)
            .await?;
        info!(user = %user, program = %program.id, removed, "cleared execution records");
        Ok(())
    }

    /// One page of a node's children with the caller's display states,
    /// `Ready` annotation applied over the sibling order.
    ///
    /// Page semantics follow the compiled pipeline: the limit is cumulative,
    /// so pages past the first can carry more than one page of rows.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::NotFound` for absent/deleted/invisible
    /// parents, or `ProgressError::Storage` on repository failures.
    pub async fn list_with_progress(
        &self,
        user: &UserId,
        parent_id: &NodeId,
        page_number: u32,
    ) -> Result<Vec<NodeProgress>, ProgressError> {
        let parent = self.content.visible(user, parent_id).await?;
        let Some(child_kind) = parent.kind.child() else {
            return Err(ProgressError::NotFound);
        };

        let page = Page::new(page_number, self.config.default_page_size);
        let nodes = self.content.children_page(user, &parent, page).await?;

        let ids: Vec<NodeId> = nodes.iter().map(|node| node.id.clone()).collect();
        let records = self
            .executions
            .list_for_targets(user, child_kind, &ids)
            .await?;
        let by_target: HashMap<&NodeId, ExecStatus> = records
            .iter()
            .map(|record| (&record.target_id, record.status))
            .collect();

        let mut states: Vec<ProgressState> = nodes
            .iter()
            .map(|node| {
                by_target
                    .get(&node.id)
                    .map_or(ProgressState::ToDo, |status| (*status).into())
            })
            .collect();
        annotate_ready(&mut states);

        Ok(nodes
            .into_iter()
            .zip(states)
            .map(|(node, state)| NodeProgress { node, state })
            .collect())
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
