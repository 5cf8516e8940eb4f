use coach_core::model::{ExecStatus, ExecutionRecord, NodeId, NodeKind, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{EXEC_COLUMNS, map_execution_row};
use crate::repository::{ExecutionRepository, StorageError};

fn conn(e: sqlx::Error) -> StorageError {
    StorageError::Connection(e.to_string())
}

#[async_trait::async_trait]
impl ExecutionRepository for SqliteRepository {
    async fn get(
        &self,
        user: &UserId,
        kind: NodeKind,
        target: &NodeId,
    ) -> Result<Option<ExecutionRecord>, StorageError> {
        let sql = format!(
            "SELECT {EXEC_COLUMNS} FROM execution_records \
             WHERE user_id = ?1 AND target_kind = ?2 AND target_id = ?3"
        );
        let row = sqlx::query(&sql)
            .bind(user.as_str())
            .bind(kind.as_str())
            .bind(target.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(conn)?;
        row.as_ref().map(map_execution_row).transpose()
    }

    async fn upsert(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO execution_records (
                user_id, target_kind, target_id, parent_id, status, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, target_kind, target_id) DO UPDATE SET
                parent_id = excluded.parent_id,
                status = excluded.status,
                updated_at = excluded.updated_at
            ",
        )
        .bind(record.user_id.as_str())
        .bind(record.target_kind.as_str())
        .bind(record.target_id.as_str())
        .bind(record.parent_id.as_str())
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .execute(self.pool())
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn mark_done_once(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        // Conditional upsert: the update arm refuses to touch a row that is
        // already done, so a duplicate completion affects zero rows and is
        // reported as a conflict. This closes the check-then-act window
        // between reading the record and writing it.
        let result = sqlx::query(
            r"
            INSERT INTO execution_records (
                user_id, target_kind, target_id, parent_id, status, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, target_kind, target_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            WHERE execution_records.status <> 'DONE'
            ",
        )
        .bind(record.user_id.as_str())
        .bind(record.target_kind.as_str())
        .bind(record.target_id.as_str())
        .bind(record.parent_id.as_str())
        .bind(ExecStatus::Done.as_str())
        .bind(record.updated_at)
        .execute(self.pool())
        .await
        .map_err(conn)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }
        Ok(())
    }

    async fn count_done(
        &self,
        user: &UserId,
        kind: NodeKind,
        parent: &NodeId,
    ) -> Result<u64, StorageError> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) FROM execution_records
            WHERE user_id = ?1 AND target_kind = ?2 AND parent_id = ?3 AND status = 'DONE'
            ",
        )
        .bind(user.as_str())
        .bind(kind.as_str())
        .bind(parent.as_str())
        .fetch_one(self.pool())
        .await
        .map_err(conn)?;

        let total: i64 = row.try_get(0).map_err(conn)?;
        u64::try_from(total)
            .map_err(|_| StorageError::Serialization(format!("negative count: {total}")))
    }

    async fn list_for_targets(
        &self,
        user: &UserId,
        kind: NodeKind,
        targets: &[NodeId],
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {EXEC_COLUMNS} FROM execution_records \
             WHERE user_id = ?1 AND target_kind = ?2 AND target_id IN ("
        );
        for i in 0..targets.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            sql.push_str(&(i + 3).to_string());
        }
        sql.push(')');

        let mut q = sqlx::query(&sql).bind(user.as_str()).bind(kind.as_str());
        for target in targets {
            q = q.bind(target.as_str());
        }

        let rows = q.fetch_all(self.pool()).await.map_err(conn)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(map_execution_row(row)?);
        }
        Ok(records)
    }

    async fn delete_for_program(
        &self,
        user: &UserId,
        program: &NodeId,
        sessions: &[NodeId],
    ) -> Result<u64, StorageError> {
        let mut sql = String::from(
            "DELETE FROM execution_records \
             WHERE user_id = ?1 AND (target_id = ?2 OR parent_id = ?2",
        );
        if !sessions.is_empty() {
            sql.push_str(" OR parent_id IN (");
            for i in 0..sessions.len() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push('?');
                sql.push_str(&(i + 3).to_string());
            }
            sql.push(')');
        }
        sql.push(')');

        let mut q = sqlx::query(&sql).bind(user.as_str()).bind(program.as_str());
        for session in sessions {
            q = q.bind(session.as_str());
        }

        let result = q.execute(self.pool()).await.map_err(conn)?;
        Ok(result.rows_affected())
    }
}
