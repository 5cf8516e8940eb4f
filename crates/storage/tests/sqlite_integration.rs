use chrono::Duration;
use rand::Rng;

use coach_core::model::{
    ContentNode, ExecStatus, ExecutionRecord, NodeId, NodeKind, ShareScope, UserId,
};
use coach_core::query::{Expr, MatchSpec, Page, Query, Scalar, SortSpec, fields};
use coach_core::time::fixed_now;
use storage::repository::{ContentRepository, ExecutionRepository, NodePatch, StorageError};
use storage::sqlite::SqliteRepository;

fn user(name: &str) -> UserId {
    UserId::new(name)
}

fn program(id: &str, owner: &str) -> ContentNode {
    ContentNode::program(
        NodeId::new(id),
        format!("Program {id}"),
        user(owner),
        1,
        fixed_now(),
    )
    .unwrap()
}

fn exercise(id: &str, session: &str, order: i64, owner: &str) -> ContentNode {
    ContentNode::exercise(
        NodeId::new(id),
        NodeId::new(session),
        format!("Exercise {id}"),
        user(owner),
        order,
        fixed_now(),
    )
    .unwrap()
}

fn done_record(user_name: &str, kind: NodeKind, target: &str, parent: &str) -> ExecutionRecord {
    ExecutionRecord::new(
        user(user_name),
        kind,
        NodeId::new(target),
        NodeId::new(parent),
        ExecStatus::Done,
        fixed_now(),
    )
}

async fn connect(name: &str) -> SqliteRepository {
    let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

#[tokio::test]
async fn sqlite_roundtrip_preserves_every_field() {
    let repo = connect("memdb_roundtrip").await;

    let mut node = program("p1", "alice");
    node.share_with = ShareScope::All;
    node.is_public = true;
    node.version = Some(2);
    node.is_old_version = true;
    node.parent_program_id = Some(NodeId::new("p0"));
    node.lib_program_id = Some(NodeId::new("lib0"));
    node.deleted_at = Some(fixed_now() - Duration::days(1));
    node.is_deleted = true;
    ContentRepository::upsert(&repo, &node).await.unwrap();

    let fetched = ContentRepository::get(&repo, &node.id)
        .await
        .unwrap()
        .expect("node present");
    assert_eq!(fetched, node);
}

#[tokio::test]
async fn sqlite_upsert_keeps_original_created_at() {
    let repo = connect("memdb_created_at").await;

    let node = program("p1", "alice");
    ContentRepository::upsert(&repo, &node).await.unwrap();

    let mut renamed = node.clone();
    renamed.name = "Renamed".to_owned();
    renamed.created_at = fixed_now() + Duration::days(5);
    ContentRepository::upsert(&repo, &renamed).await.unwrap();

    let fetched = ContentRepository::get(&repo, &node.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.name, "Renamed");
    assert_eq!(fetched.created_at, node.created_at);
}

#[tokio::test]
async fn sqlite_pipeline_filters_sorts_and_paginates() {
    let repo = connect("memdb_pipeline").await;

    for i in 1..=30 {
        ContentRepository::upsert(&repo, &exercise(&format!("e{i:02}"), "s1", i, "alice"))
            .await
            .unwrap();
    }
    // Noise outside the session under test.
    ContentRepository::upsert(&repo, &exercise("other", "s2", 1, "alice"))
        .await
        .unwrap();

    let stages = Query::new(
        MatchSpec::new()
            .field(fields::KIND, "exercise")
            .field(fields::PARENT_ID, &NodeId::new("s1"))
            .field(fields::IS_DELETED, false),
    )
    .sort(SortSpec::Asc(fields::ORDER.to_owned()))
    .page(Page::new(2, 10))
    .into_stages();

    let found = repo.find(&stages).await.unwrap();
    // Cumulative limit: page 2 of size 10 returns rows 11..=30.
    assert_eq!(found.len(), 20);
    assert_eq!(found[0].id, NodeId::new("e11"));
    assert_eq!(found[19].id, NodeId::new("e30"));
}

#[tokio::test]
async fn sqlite_count_agrees_with_the_visibility_predicate() {
    let repo = connect("memdb_visibility").await;
    let mut rng = rand::rng();

    let caller = user("alice");
    let mut nodes = Vec::new();
    for i in 0..40 {
        let owner = if rng.random_bool(0.5) { "alice" } else { "bob" };
        let mut node = exercise(&format!("e{i:02}"), "s1", i, owner);
        if rng.random_bool(0.5) {
            node.share_with = ShareScope::All;
        }
        if rng.random_bool(0.2) {
            node.is_deleted = true;
            node.deleted_at = Some(fixed_now());
        }
        ContentRepository::upsert(&repo, &node).await.unwrap();
        nodes.push(node);
    }

    let spec = MatchSpec::new()
        .field(fields::KIND, "exercise")
        .field(fields::PARENT_ID, &NodeId::new("s1"))
        .field(fields::IS_DELETED, false)
        .visible_to(&caller);

    let counted = repo.count(&spec).await.unwrap();
    let expected = nodes
        .iter()
        .filter(|n| !n.is_deleted && n.is_visible_to(&caller))
        .count() as u64;
    assert_eq!(counted, expected);

    let listed = repo
        .find(&Query::new(spec).into_stages())
        .await
        .unwrap();
    assert_eq!(listed.len() as u64, expected);
}

#[tokio::test]
async fn sqlite_update_many_and_purge() {
    let repo = connect("memdb_purge").await;

    ContentRepository::upsert(&repo, &program("p1", "alice")).await.unwrap();
    ContentRepository::upsert(&repo, &program("p2", "alice")).await.unwrap();

    let expired_at = fixed_now() - Duration::days(60);
    let changed = repo
        .update_many(
            &MatchSpec::new().field(fields::ID, &NodeId::new("p1")),
            &NodePatch::soft_delete(expired_at),
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let cutoff = fixed_now() - Duration::days(30);
    let removed = repo
        .delete_where(
            &MatchSpec::new()
                .field(fields::IS_DELETED, true)
                .field(fields::DELETED_AT, Expr::Lte(Scalar::Time(cutoff))),
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert!(
        ContentRepository::get(&repo, &NodeId::new("p1"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        ContentRepository::get(&repo, &NodeId::new("p2"))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn sqlite_mark_done_once_is_write_once() {
    let repo = connect("memdb_once").await;

    let record = done_record("alice", NodeKind::Exercise, "e1", "s1");
    repo.mark_done_once(&record).await.unwrap();
    let err = repo.mark_done_once(&record).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    // An active record is promoted rather than conflicting.
    let mut active = done_record("alice", NodeKind::Session, "s1", "p1");
    active.status = ExecStatus::Active;
    ExecutionRepository::upsert(&repo, &active).await.unwrap();
    repo.mark_done_once(&active).await.unwrap();
    let stored = ExecutionRepository::get(&repo, &user("alice"), NodeKind::Session, &NodeId::new("s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ExecStatus::Done);
}

#[tokio::test]
async fn sqlite_counts_and_lists_execution_records() {
    let repo = connect("memdb_exec").await;

    for (target, parent) in [("e1", "s1"), ("e2", "s1"), ("e3", "s2")] {
        repo.mark_done_once(&done_record("alice", NodeKind::Exercise, target, parent))
            .await
            .unwrap();
    }
    repo.mark_done_once(&done_record("bob", NodeKind::Exercise, "e1", "s1"))
        .await
        .unwrap();

    let count = repo
        .count_done(&user("alice"), NodeKind::Exercise, &NodeId::new("s1"))
        .await
        .unwrap();
    assert_eq!(count, 2);

    let targets = [NodeId::new("e1"), NodeId::new("e2"), NodeId::new("missing")];
    let listed = repo
        .list_for_targets(&user("alice"), NodeKind::Exercise, &targets)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn sqlite_delete_for_program_clears_all_levels() {
    let repo = connect("memdb_clear").await;

    repo.mark_done_once(&done_record("alice", NodeKind::Program, "p1", "p1"))
        .await
        .unwrap();
    repo.mark_done_once(&done_record("alice", NodeKind::Session, "s1", "p1"))
        .await
        .unwrap();
    repo.mark_done_once(&done_record("alice", NodeKind::Exercise, "e1", "s1"))
        .await
        .unwrap();
    // Same structure for bob must survive alice's reset.
    repo.mark_done_once(&done_record("bob", NodeKind::Exercise, "e1", "s1"))
        .await
        .unwrap();

    let removed = repo
        .delete_for_program(&user("alice"), &NodeId::new("p1"), &[NodeId::new("s1")])
        .await
        .unwrap();
    assert_eq!(removed, 3);

    let alice_record =
        ExecutionRepository::get(&repo, &user("alice"), NodeKind::Exercise, &NodeId::new("e1"))
            .await
            .unwrap();
    assert!(alice_record.is_none());
    let bob_record =
        ExecutionRepository::get(&repo, &user("bob"), NodeKind::Exercise, &NodeId::new("e1"))
            .await
            .unwrap();
    assert!(bob_record.is_some());
}
