use rand::Rng;

use coach_core::model::{
    ContentNode, ExecStatus, ExecutionRecord, NodeId, NodeKind, ProgressState, ShareScope, UserId,
};
use coach_core::time::{fixed_clock, fixed_now};
use services::{ContentService, ProgressError, ProgressService, ServiceConfig};
use storage::repository::Storage;

fn user(name: &str) -> UserId {
    UserId::new(name)
}

fn services_over(storage: &Storage) -> (ContentService, ProgressService) {
    let config = ServiceConfig::default();
    let content = ContentService::new(fixed_clock(), config, storage.content.clone());
    let progress = ProgressService::new(
        fixed_clock(),
        config,
        content.clone(),
        storage.executions.clone(),
    );
    (content, progress)
}

async fn upsert(storage: &Storage, node: &ContentNode) {
    storage.content.upsert(node).await.unwrap();
}

async fn seed_program(storage: &Storage, id: &str, owner: &str, shared: bool) -> ContentNode {
    let mut node = ContentNode::program(
        NodeId::new(id),
        format!("Program {id}"),
        user(owner),
        1,
        fixed_now(),
    )
    .unwrap();
    if shared {
        node.share_with = ShareScope::All;
    }
    upsert(storage, &node).await;
    node
}

async fn seed_session(
    storage: &Storage,
    id: &str,
    program: &str,
    order: i64,
    owner: &str,
    shared: bool,
) -> ContentNode {
    let mut node = ContentNode::session(
        NodeId::new(id),
        NodeId::new(program),
        format!("Session {id}"),
        user(owner),
        order,
        fixed_now(),
    )
    .unwrap();
    if shared {
        node.share_with = ShareScope::All;
    }
    upsert(storage, &node).await;
    node
}

async fn seed_exercise(
    storage: &Storage,
    id: &str,
    session: &str,
    order: i64,
    owner: &str,
    shared: bool,
) -> ContentNode {
    let mut node = ContentNode::exercise(
        NodeId::new(id),
        NodeId::new(session),
        format!("Exercise {id}"),
        user(owner),
        order,
        fixed_now(),
    )
    .unwrap();
    if shared {
        node.share_with = ShareScope::All;
    }
    upsert(storage, &node).await;
    node
}

#[tokio::test]
async fn full_progression_over_sqlite() {
    let storage = Storage::sqlite("sqlite:file:memdb_progress_flow?mode=memory&cache=shared")
        .await
        .expect("sqlite storage");
    let (_, progress) = services_over(&storage);
    let alice = user("alice");

    seed_program(&storage, "p1", "alice", false).await;
    seed_session(&storage, "s1", "p1", 1, "alice", false).await;
    seed_session(&storage, "s2", "p1", 3, "alice", false).await;
    seed_session(&storage, "s3", "p1", 5, "alice", false).await;
    seed_exercise(&storage, "a1", "s1", 1, "alice", false).await;
    seed_exercise(&storage, "a2", "s1", 2, "alice", false).await;
    seed_exercise(&storage, "b1", "s2", 1, "alice", false).await;
    seed_exercise(&storage, "c1", "s3", 1, "alice", false).await;

    // Skipping ahead within a session is rejected.
    let err = progress
        .run_exercise(&alice, &NodeId::new("a2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressError::OutOfSequence));

    let first = progress
        .run_exercise(&alice, &NodeId::new("a1"))
        .await
        .unwrap();
    assert!(!first.is_session_done);
    assert!(first.next_session_id.is_none());

    let s1_done = progress
        .run_exercise(&alice, &NodeId::new("a2"))
        .await
        .unwrap();
    assert!(s1_done.is_session_done);
    assert!(!s1_done.is_program_done);
    assert_eq!(s1_done.next_session_id, Some(NodeId::new("s2")));

    let s2_done = progress
        .run_exercise(&alice, &NodeId::new("b1"))
        .await
        .unwrap();
    assert_eq!(s2_done.next_session_id, Some(NodeId::new("s3")));

    let finished = progress
        .run_exercise(&alice, &NodeId::new("c1"))
        .await
        .unwrap();
    assert!(finished.is_session_done);
    assert!(finished.is_program_done);
    assert!(finished.next_session_id.is_none());

    let state = progress
        .get_progress(&alice, NodeKind::Program, &NodeId::new("p1"))
        .await
        .unwrap();
    assert_eq!(state, ProgressState::Done);

    // Re-running any exercise after completion stays rejected.
    let err = progress
        .run_exercise(&alice, &NodeId::new("a1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressError::AlreadyDone));

    progress
        .clear_execution(&alice, &NodeId::new("p1"))
        .await
        .unwrap();
    let state = progress
        .get_progress(&alice, NodeKind::Program, &NodeId::new("p1"))
        .await
        .unwrap();
    assert_eq!(state, ProgressState::ToDo);
}

#[tokio::test]
async fn rollup_matches_the_oracle_over_random_trees() {
    let mut rng = rand::rng();

    for trial in 0..25 {
        let storage = Storage::in_memory();
        let (_, progress) = services_over(&storage);
        let bob = user("bob");

        seed_program(&storage, "p1", "alice", true).await;
        seed_session(&storage, "s1", "p1", 1, "alice", true).await;

        let visible_total: i64 = rng.random_range(1..=8);
        for i in 1..=visible_total {
            seed_exercise(&storage, &format!("e{i}"), "s1", i, "alice", true).await;
        }
        // Interleave private exercises of another owner; they must affect
        // neither gating nor the rollup denominator for bob.
        let hidden: i64 = rng.random_range(0..=3);
        for i in 0..hidden {
            seed_exercise(&storage, &format!("h{i}"), "s1", i * 3 + 1, "carol", false).await;
        }

        let completed: i64 = rng.random_range(0..=visible_total);
        for i in 1..=completed {
            progress
                .run_exercise(&bob, &NodeId::new(format!("e{i}")))
                .await
                .unwrap();
        }

        let state = progress
            .get_progress(&bob, NodeKind::Session, &NodeId::new("s1"))
            .await
            .unwrap();
        let expected = if completed == 0 {
            ProgressState::ToDo
        } else if completed == visible_total {
            ProgressState::Done
        } else {
            ProgressState::Active
        };
        assert_eq!(
            state, expected,
            "trial {trial}: {completed}/{visible_total} completed, {hidden} hidden"
        );
    }
}

#[tokio::test]
async fn compiled_counts_match_the_manual_visibility_filter() {
    let mut rng = rand::rng();

    for trial in 0..25 {
        let storage = Storage::in_memory();
        let (content, _) = services_over(&storage);
        let caller = user("alice");

        seed_program(&storage, "p1", "alice", true).await;
        let session = seed_session(&storage, "s1", "p1", 1, "alice", true).await;

        let mut seeded = Vec::new();
        for i in 0..rng.random_range(1..=12) {
            let owner = if rng.random_bool(0.5) { "alice" } else { "bob" };
            let shared = rng.random_bool(0.5);
            let mut node =
                seed_exercise(&storage, &format!("e{i:02}"), "s1", i, owner, shared).await;
            if rng.random_bool(0.2) {
                node.is_deleted = true;
                node.deleted_at = Some(fixed_now());
                upsert(&storage, &node).await;
            }
            seeded.push(node);
        }

        let expected = seeded
            .iter()
            .filter(|n| !n.is_deleted && n.is_visible_to(&caller))
            .count();

        let counted = content
            .count_visible_children(&caller, &session)
            .await
            .unwrap();
        let listed = content.visible_children(&caller, &session).await.unwrap();

        assert_eq!(counted as usize, expected, "trial {trial}: count diverged");
        assert_eq!(listed.len(), expected, "trial {trial}: listing diverged");
        assert!(listed.iter().all(|n| n.is_visible_to(&caller)));
    }
}

#[tokio::test]
async fn rollup_recomputes_over_records_it_did_not_write() {
    // Simulates recovery from a request that wrote the exercise record but
    // died before the rollups: the next completion recounts everything.
    let storage = Storage::in_memory();
    let (_, progress) = services_over(&storage);
    let alice = user("alice");

    seed_program(&storage, "p1", "alice", false).await;
    seed_session(&storage, "s1", "p1", 1, "alice", false).await;
    seed_exercise(&storage, "e1", "s1", 1, "alice", false).await;
    seed_exercise(&storage, "e2", "s1", 2, "alice", false).await;

    // e1's record exists but no session/program rollup ever ran.
    storage
        .executions
        .mark_done_once(&ExecutionRecord::new(
            alice.clone(),
            NodeKind::Exercise,
            NodeId::new("e1"),
            NodeId::new("s1"),
            ExecStatus::Done,
            fixed_now(),
        ))
        .await
        .unwrap();
    let state = progress
        .get_progress(&alice, NodeKind::Session, &NodeId::new("s1"))
        .await
        .unwrap();
    assert_eq!(state, ProgressState::ToDo);

    let outcome = progress
        .run_exercise(&alice, &NodeId::new("e2"))
        .await
        .unwrap();
    assert!(outcome.is_session_done);
    assert!(outcome.is_program_done);
}

#[tokio::test]
async fn deleting_a_session_shrinks_the_program_denominator() {
    let storage = Storage::in_memory();
    let (content, progress) = services_over(&storage);
    let alice = user("alice");

    seed_program(&storage, "p1", "alice", false).await;
    seed_session(&storage, "s1", "p1", 1, "alice", false).await;
    seed_session(&storage, "s2", "p1", 2, "alice", false).await;
    seed_exercise(&storage, "a1", "s1", 1, "alice", false).await;
    seed_exercise(&storage, "b1", "s2", 1, "alice", false).await;

    let done = progress
        .run_exercise(&alice, &NodeId::new("a1"))
        .await
        .unwrap();
    assert!(done.is_session_done);
    assert!(!done.is_program_done);

    // With s2 gone, s1 alone no longer satisfies the program count until a
    // rollup recomputes, and the deleted session stops being listed at all.
    content
        .soft_delete(&alice, &NodeId::new("s2"))
        .await
        .unwrap();
    let sessions = progress
        .list_with_progress(&alice, &NodeId::new("p1"), 1)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].node.id, NodeId::new("s1"));
    assert_eq!(sessions[0].state, ProgressState::Done);

    let err = progress
        .run_exercise(&alice, &NodeId::new("b1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProgressError::NotFound));
}

#[tokio::test]
async fn ready_annotation_walks_the_session_list() {
    let storage = Storage::in_memory();
    let (_, progress) = services_over(&storage);
    let alice = user("alice");

    seed_program(&storage, "p1", "alice", false).await;
    seed_session(&storage, "s1", "p1", 1, "alice", false).await;
    seed_session(&storage, "s2", "p1", 2, "alice", false).await;
    seed_session(&storage, "s3", "p1", 3, "alice", false).await;
    seed_exercise(&storage, "a1", "s1", 1, "alice", false).await;
    seed_exercise(&storage, "b1", "s2", 1, "alice", false).await;

    // Nothing done yet: no session is Ready.
    let listed = progress
        .list_with_progress(&alice, &NodeId::new("p1"), 1)
        .await
        .unwrap();
    let states: Vec<_> = listed.iter().map(|i| i.state).collect();
    assert_eq!(
        states,
        [ProgressState::ToDo, ProgressState::ToDo, ProgressState::ToDo]
    );

    progress
        .run_exercise(&alice, &NodeId::new("a1"))
        .await
        .unwrap();
    let listed = progress
        .list_with_progress(&alice, &NodeId::new("p1"), 1)
        .await
        .unwrap();
    let states: Vec<_> = listed.iter().map(|i| i.state).collect();
    assert_eq!(
        states,
        [
            ProgressState::Done,
            ProgressState::Ready,
            ProgressState::ToDo
        ]
    );
}
