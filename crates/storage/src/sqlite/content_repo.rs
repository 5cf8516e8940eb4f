use coach_core::model::{ContentNode, NodeId};
use coach_core::query::{MatchSpec, Scalar, Stage};
use sqlx::Row;

use super::mapping::{NODE_COLUMNS, map_node_row};
use super::query::{bind_scalar, render_match, render_stages};
use super::SqliteRepository;
use crate::repository::{ContentRepository, NodePatch, StorageError};

fn conn(e: sqlx::Error) -> StorageError {
    StorageError::Connection(e.to_string())
}

#[async_trait::async_trait]
impl ContentRepository for SqliteRepository {
    async fn get(&self, id: &NodeId) -> Result<Option<ContentNode>, StorageError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM content_nodes WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(conn)?;
        row.as_ref().map(map_node_row).transpose()
    }

    async fn find(&self, stages: &[Stage]) -> Result<Vec<ContentNode>, StorageError> {
        let rendered = render_stages(stages)?;
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM content_nodes{}{}{}",
            rendered.where_sql, rendered.order_sql, rendered.limit_sql
        );

        let mut q = sqlx::query(&sql);
        for scalar in &rendered.binds {
            q = bind_scalar(q, scalar);
        }
        let rows = q.fetch_all(self.pool()).await.map_err(conn)?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            nodes.push(map_node_row(row)?);
        }
        Ok(nodes)
    }

    async fn count(&self, spec: &MatchSpec) -> Result<u64, StorageError> {
        let mut binds = Vec::new();
        let clause = render_match(spec, &mut binds)?;
        let sql = match clause {
            Some(body) => format!("SELECT COUNT(*) FROM content_nodes WHERE {body}"),
            None => "SELECT COUNT(*) FROM content_nodes".to_owned(),
        };

        let mut q = sqlx::query(&sql);
        for scalar in &binds {
            q = bind_scalar(q, scalar);
        }
        let row = q.fetch_one(self.pool()).await.map_err(conn)?;
        let total: i64 = row.try_get(0).map_err(conn)?;
        u64::try_from(total)
            .map_err(|_| StorageError::Serialization(format!("negative count: {total}")))
    }

    async fn upsert(&self, node: &ContentNode) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO content_nodes (
                id, kind, name, parent_id, position, created_by, share_with,
                is_public, is_deleted, deleted_at, version, is_old_version,
                parent_program_id, lib_program_id, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                -- keep created_at from the original insert; only update mutable fields
                kind = excluded.kind,
                name = excluded.name,
                parent_id = excluded.parent_id,
                position = excluded.position,
                created_by = excluded.created_by,
                share_with = excluded.share_with,
                is_public = excluded.is_public,
                is_deleted = excluded.is_deleted,
                deleted_at = excluded.deleted_at,
                version = excluded.version,
                is_old_version = excluded.is_old_version,
                parent_program_id = excluded.parent_program_id,
                lib_program_id = excluded.lib_program_id
            ",
        )
        .bind(node.id.as_str())
        .bind(node.kind.as_str())
        .bind(node.name.as_str())
        .bind(node.parent_id.as_ref().map(|id| id.as_str().to_owned()))
        .bind(node.order)
        .bind(node.created_by.as_str())
        .bind(node.share_with.as_str())
        .bind(node.is_public)
        .bind(node.is_deleted)
        .bind(node.deleted_at)
        .bind(node.version)
        .bind(node.is_old_version)
        .bind(
            node.parent_program_id
                .as_ref()
                .map(|id| id.as_str().to_owned()),
        )
        .bind(node.lib_program_id.as_ref().map(|id| id.as_str().to_owned()))
        .bind(node.created_at)
        .execute(self.pool())
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn update_many(&self, spec: &MatchSpec, patch: &NodePatch) -> Result<u64, StorageError> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut binds: Vec<Scalar> = Vec::new();
        let mut sets = Vec::new();
        if let Some(deleted) = patch.is_deleted {
            binds.push(Scalar::Bool(deleted));
            sets.push(format!("is_deleted = ?{}", binds.len()));
        }
        if let Some(at) = patch.deleted_at {
            binds.push(Scalar::Time(at));
            sets.push(format!("deleted_at = ?{}", binds.len()));
        }
        if let Some(old) = patch.is_old_version {
            binds.push(Scalar::Bool(old));
            sets.push(format!("is_old_version = ?{}", binds.len()));
        }

        let clause = render_match(spec, &mut binds)?;
        let sql = match clause {
            Some(body) => format!(
                "UPDATE content_nodes SET {} WHERE {body}",
                sets.join(", ")
            ),
            None => format!("UPDATE content_nodes SET {}", sets.join(", ")),
        };

        let mut q = sqlx::query(&sql);
        for scalar in &binds {
            q = bind_scalar(q, scalar);
        }
        let result = q.execute(self.pool()).await.map_err(conn)?;
        Ok(result.rows_affected())
    }

    async fn delete_where(&self, spec: &MatchSpec) -> Result<u64, StorageError> {
        let mut binds = Vec::new();
        let clause = render_match(spec, &mut binds)?;
        let sql = match clause {
            Some(body) => format!("DELETE FROM content_nodes WHERE {body}"),
            None => "DELETE FROM content_nodes".to_owned(),
        };

        let mut q = sqlx::query(&sql);
        for scalar in &binds {
            q = bind_scalar(q, scalar);
        }
        let result = q.execute(self.pool()).await.map_err(conn)?;
        Ok(result.rows_affected())
    }
}
