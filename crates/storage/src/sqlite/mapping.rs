use coach_core::model::{
    ContentNode, ExecStatus, ExecutionRecord, NodeId, NodeKind, ShareScope, UserId,
};
use sqlx::Row;

use crate::repository::StorageError;

fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Column list matching `map_node_row`; keep the two in sync.
pub(crate) const NODE_COLUMNS: &str = "id, kind, name, parent_id, position, created_by, \
     share_with, is_public, is_deleted, deleted_at, version, is_old_version, \
     parent_program_id, lib_program_id, created_at";

pub(crate) const EXEC_COLUMNS: &str =
    "user_id, target_kind, target_id, parent_id, status, updated_at";

pub(crate) fn parse_node_kind(s: &str) -> Result<NodeKind, StorageError> {
    match s {
        "program" => Ok(NodeKind::Program),
        "session" => Ok(NodeKind::Session),
        "exercise" => Ok(NodeKind::Exercise),
        _ => Err(StorageError::Serialization(format!("invalid kind: {s}"))),
    }
}

pub(crate) fn parse_share_scope(s: &str) -> Result<ShareScope, StorageError> {
    match s {
        "ALL" => Ok(ShareScope::All),
        "OWNER" => Ok(ShareScope::Owner),
        _ => Err(StorageError::Serialization(format!(
            "invalid share scope: {s}"
        ))),
    }
}

pub(crate) fn parse_exec_status(s: &str) -> Result<ExecStatus, StorageError> {
    match s {
        "ACTIVE" => Ok(ExecStatus::Active),
        "DONE" => Ok(ExecStatus::Done),
        _ => Err(StorageError::Serialization(format!("invalid status: {s}"))),
    }
}

pub(crate) fn map_node_row(row: &sqlx::sqlite::SqliteRow) -> Result<ContentNode, StorageError> {
    let kind_str: String = row.try_get("kind").map_err(ser)?;
    let share_str: String = row.try_get("share_with").map_err(ser)?;

    let node = ContentNode {
        id: NodeId::new(row.try_get::<String, _>("id").map_err(ser)?),
        kind: parse_node_kind(kind_str.as_str())?,
        name: row.try_get("name").map_err(ser)?,
        parent_id: row
            .try_get::<Option<String>, _>("parent_id")
            .map_err(ser)?
            .map(NodeId::new),
        order: row.try_get("position").map_err(ser)?,
        created_by: UserId::new(row.try_get::<String, _>("created_by").map_err(ser)?),
        share_with: parse_share_scope(share_str.as_str())?,
        is_public: row.try_get("is_public").map_err(ser)?,
        is_deleted: row.try_get("is_deleted").map_err(ser)?,
        deleted_at: row.try_get("deleted_at").map_err(ser)?,
        version: row.try_get("version").map_err(ser)?,
        is_old_version: row.try_get("is_old_version").map_err(ser)?,
        parent_program_id: row
            .try_get::<Option<String>, _>("parent_program_id")
            .map_err(ser)?
            .map(NodeId::new),
        lib_program_id: row
            .try_get::<Option<String>, _>("lib_program_id")
            .map_err(ser)?
            .map(NodeId::new),
        created_at: row.try_get("created_at").map_err(ser)?,
    };
    node.validate().map_err(ser)?;
    Ok(node)
}

pub(crate) fn map_execution_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ExecutionRecord, StorageError> {
    let kind_str: String = row.try_get("target_kind").map_err(ser)?;
    let status_str: String = row.try_get("status").map_err(ser)?;

    Ok(ExecutionRecord {
        user_id: UserId::new(row.try_get::<String, _>("user_id").map_err(ser)?),
        target_kind: parse_node_kind(kind_str.as_str())?,
        target_id: NodeId::new(row.try_get::<String, _>("target_id").map_err(ser)?),
        parent_id: NodeId::new(row.try_get::<String, _>("parent_id").map_err(ser)?),
        status: parse_exec_status(status_str.as_str())?,
        updated_at: row.try_get("updated_at").map_err(ser)?,
    })
}
