use crate::error::DbError;
use crate::models::EventRow;
use sqlx::SqlitePool;
use syncd_core::Event;

#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends an event and evicts the task's oldest events beyond `limit`.
    pub async fn insert_bounded(&self, event: &Event, limit: usize) -> Result<(), DbError> {
        let row = EventRow::from_domain(event)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO task_events (id, task_name, success, start_time, end_time, error_message, providers, services, source)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.task_name)
        .bind(row.success)
        .bind(row.start_time)
        .bind(row.end_time)
        .bind(&row.error_message)
        .bind(&row.providers)
        .bind(&row.services)
        .bind(&row.source)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM task_events
            WHERE task_name = ?
              AND seq NOT IN (
                SELECT seq FROM task_events WHERE task_name = ? ORDER BY seq DESC LIMIT ?
              )
            "#,
        )
        .bind(&row.task_name)
        .bind(&row.task_name)
        .bind(limit as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Events for a task, newest first.
    pub async fn find_by_task(&self, task_name: &str) -> Result<Vec<Event>, DbError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, task_name, success, start_time, end_time, error_message, providers, services, source
            FROM task_events
            WHERE task_name = ?
            ORDER BY seq DESC
            "#,
        )
        .bind(task_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_domain()).collect()
    }

    pub async fn delete_by_task(&self, task_name: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM task_events WHERE task_name = ?")
            .bind(task_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
