use chrono::{DateTime, Utc};

use crate::model::ids::{NodeId, UserId};
use crate::model::node::NodeKind;

/// Persisted status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Active,
    Done,
}

impl ExecStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Active => "ACTIVE",
            ExecStatus::Done => "DONE",
        }
    }
}

/// Per-user, per-target progress row.
///
/// At most one record exists per `(user_id, target_kind, target_id)`; writes
/// are upserts, never appends. Records are only removed by an explicit
/// clear-execution operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub user_id: UserId,
    pub target_kind: NodeKind,
    pub target_id: NodeId,
    pub parent_id: NodeId,
    pub status: ExecStatus,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    #[must_use]
    pub fn new(
        user_id: UserId,
        target_kind: NodeKind,
        target_id: NodeId,
        parent_id: NodeId,
        status: ExecStatus,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            target_kind,
            target_id,
            parent_id,
            status,
            updated_at,
        }
    }
}

/// Display state of a target for one user.
///
/// `ToDo` is virtual (no record exists) and `Ready` is derived at read time
/// over a sibling-ordered list; neither is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    ToDo,
    Active,
    Done,
    Ready,
}

impl From<ExecStatus> for ProgressState {
    fn from(status: ExecStatus) -> Self {
        match status {
            ExecStatus::Active => ProgressState::Active,
            ExecStatus::Done => ProgressState::Done,
        }
    }
}

/// Applies the `Ready` annotation to a sibling-ordered list of states.
///
/// The item directly after the last `Done` sibling is shown as `Ready`.
/// When nothing is `Done` yet the list is left untouched; the first item
/// keeps whatever state was computed for it independently.
pub fn annotate_ready(states: &mut [ProgressState]) {
    let last_done = states
        .iter()
        .rposition(|state| *state == ProgressState::Done);
    if let Some(idx) = last_done {
        if let Some(next) = states.get_mut(idx + 1) {
            *next = ProgressState::Ready;
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use ProgressState::{Active, Done, Ready, ToDo};

    #[test]
    fn ready_follows_the_last_done_item() {
        let mut states = [Done, Done, ToDo, ToDo];
        annotate_ready(&mut states);
        assert_eq!(states, [Done, Done, Ready, ToDo]);
    }

    #[test]
    fn ready_replaces_active_state_for_display() {
        let mut states = [Done, Active, ToDo];
        annotate_ready(&mut states);
        assert_eq!(states, [Done, Ready, ToDo]);
    }

    #[test]
    fn no_done_means_no_ready() {
        let mut states = [ToDo, Active, ToDo];
        annotate_ready(&mut states);
        assert_eq!(states, [ToDo, Active, ToDo]);
    }

    #[test]
    fn all_done_leaves_nothing_to_mark() {
        let mut states = [Done, Done];
        annotate_ready(&mut states);
        assert_eq!(states, [Done, Done]);
    }

    #[test]
    fn gaps_before_the_last_done_are_ignored() {
        // Sparse completion can occur when visibility changed after the
        // fact; only the position after the last Done is highlighted.
        let mut states = [Done, ToDo, Done, ToDo, ToDo];
        annotate_ready(&mut states);
        assert_eq!(states, [Done, ToDo, Done, Ready, ToDo]);
    }

    #[test]
    fn empty_list_is_a_no_op() {
        let mut states: [ProgressState; 0] = [];
        annotate_ready(&mut states);
    }

    #[test]
    fn status_maps_into_display_state() {
        assert_eq!(ProgressState::from(ExecStatus::Active), Active);
        assert_eq!(ProgressState::from(ExecStatus::Done), Done);
    }
}
