use crate::error::DbError;
use crate::models::TaskConfigRow;
use sqlx::SqlitePool;
use syncd_core::TaskConfig;

#[derive(Clone)]
pub struct TaskConfigRepository {
    pool: SqlitePool,
}

impl TaskConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces the config stored under its name. A replaced row
    /// keeps its original position in [`find_all`](Self::find_all).
    pub async fn upsert(&self, conf: &TaskConfig) -> Result<(), DbError> {
        let row = TaskConfigRow::from_domain(conf)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (name, config, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.name)
        .bind(&row.config)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<TaskConfig>, DbError> {
        let row: Option<TaskConfigRow> = sqlx::query_as(
            r#"
            SELECT name, config, created_at, updated_at
            FROM tasks
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_domain()).transpose()
    }

    pub async fn find_all(&self) -> Result<Vec<TaskConfig>, DbError> {
        let rows: Vec<TaskConfigRow> = sqlx::query_as(
            r#"
            SELECT name, config, created_at, updated_at
            FROM tasks
            ORDER BY rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    pub async fn delete(&self, name: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM tasks WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
