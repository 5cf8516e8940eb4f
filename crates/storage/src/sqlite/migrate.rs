use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates the content-node table, the per-user execution-record table, and
/// the indexes the pipeline queries rely on.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS content_nodes (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL CHECK (kind IN ('program', 'session', 'exercise')),
                    name TEXT NOT NULL,
                    parent_id TEXT,
                    position INTEGER NOT NULL,
                    created_by TEXT NOT NULL,
                    share_with TEXT NOT NULL CHECK (share_with IN ('ALL', 'OWNER')),
                    is_public INTEGER NOT NULL DEFAULT 0,
                    is_deleted INTEGER NOT NULL DEFAULT 0,
                    deleted_at TEXT,
                    version INTEGER,
                    is_old_version INTEGER NOT NULL DEFAULT 0,
                    parent_program_id TEXT,
                    lib_program_id TEXT,
                    created_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS execution_records (
                    user_id TEXT NOT NULL,
                    target_kind TEXT NOT NULL CHECK (target_kind IN ('program', 'session', 'exercise')),
                    target_id TEXT NOT NULL,
                    parent_id TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('ACTIVE', 'DONE')),
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, target_kind, target_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_content_nodes_parent
                    ON content_nodes (kind, parent_id, position);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_content_nodes_lineage
                    ON content_nodes (lib_program_id, parent_program_id);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_execution_records_parent
                    ON execution_records (user_id, target_kind, parent_id, status);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
