use chrono::{DateTime, Utc};
use tracing::debug;

use coach_core::model::{ContentNode, ExecStatus, ExecutionRecord, NodeId, UserId};
use storage::repository::ExecutionRepository;

use crate::content_service::ContentService;
use crate::error::ProgressError;

/// Recomputes one parent's status from its children and upserts the record.
///
/// Done iff every live child visible to the user has a done record under
/// this parent; the denominator uses the same visibility predicate as every
/// listing, via `ContentService`. The write is a full recompute, never an
/// increment, so re-running after a failed request converges to the same
/// state.
pub(crate) async fn refresh_parent_status(
    content: &ContentService,
    executions: &dyn ExecutionRepository,
    user: &UserId,
    parent: &ContentNode,
    record_parent: &NodeId,
    now: DateTime<Utc>,
) -> Result<ExecStatus, ProgressError> {
    let Some(child_kind) = parent.kind.child() else {
        return Err(ProgressError::NotFound);
    };

    let visible_total = content.count_visible_children(user, parent).await?;
    let done = executions.count_done(user, child_kind, &parent.id).await?;
    let status = if visible_total > 0 && done == visible_total {
        ExecStatus::Done
    } else {
        ExecStatus::Active
    };

    executions
        .upsert(&ExecutionRecord::new(
            user.clone(),
            parent.kind,
            parent.id.clone(),
            record_parent.clone(),
            status,
            now,
        ))
        .await?;

    debug!(
        parent = %parent.id,
        done,
        visible_total,
        status = status.as_str(),
        "rolled up parent status"
    );
    Ok(status)
}
