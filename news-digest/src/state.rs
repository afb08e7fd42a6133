use crate::step::StepStore;
use crate::types::{DigestError, Result, StepResult, WorkflowRun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

/// SQLite-backed step store. Step results survive a process restart, so a
/// run re-entered under the same id replays instead of repeating side effects.
pub struct SqliteStepStore {
    db: SqlitePool,
}

impl SqliteStepStore {
    /// `sqlite::memory:` keeps everything in one connection for the pool's lifetime.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");

        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            // Closing the only connection would drop the database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let db = pool_options.connect_with(options).await?;

        let store = Self { db };
        store.setup_schema().await?;
        info!("Step store ready at {}", database_url);
        Ok(store)
    }

    pub async fn setup_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_runs (
                run_id TEXT PRIMARY KEY,
                workflow TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_results (
                run_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                status TEXT NOT NULL,
                value TEXT,
                error_message TEXT,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (run_id, step_name)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn step_results(&self, run_id: Uuid) -> Result<Vec<StepResult>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_name, attempts, status, value, error_message, completed_at
            FROM step_results
            WHERE run_id = ?
            ORDER BY step_name
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(step_from_row).collect()
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| DigestError::General(format!("Invalid run id '{}': {}", value, e)))
}

fn step_from_row(row: &SqliteRow) -> Result<StepResult> {
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;
    let value: Option<String> = row.try_get("value")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(StepResult {
        run_id: parse_uuid(&run_id)?,
        step_name: row.try_get("step_name")?,
        attempts: attempts as u32,
        status: status.parse()?,
        value: value.map(|v| serde_json::from_str(&v)).transpose()?,
        error_message: row.try_get("error_message")?,
        completed_at: row.try_get::<DateTime<Utc>, _>("completed_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun> {
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;

    Ok(WorkflowRun {
        run_id: parse_uuid(&run_id)?,
        workflow: row.try_get("workflow")?,
        status: status.parse()?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl StepStore for SqliteStepStore {
    async fn load_step(&self, run_id: Uuid, step_name: &str) -> Result<Option<StepResult>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, step_name, attempts, status, value, error_message, completed_at
            FROM step_results
            WHERE run_id = ? AND step_name = ?
            "#,
        )
        .bind(run_id.to_string())
        .bind(step_name)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn save_step(&self, result: &StepResult) -> Result<()> {
        let value = result.value.as_ref().map(serde_json::to_string).transpose()?;

        // A succeeded row is final
        sqlx::query(
            r#"
            INSERT INTO step_results (run_id, step_name, attempts, status, value, error_message, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id, step_name) DO UPDATE SET
                attempts = EXCLUDED.attempts,
                status = EXCLUDED.status,
                value = EXCLUDED.value,
                error_message = EXCLUDED.error_message,
                completed_at = EXCLUDED.completed_at
            WHERE step_results.status <> 'succeeded'
            "#,
        )
        .bind(result.run_id.to_string())
        .bind(&result.step_name)
        .bind(result.attempts as i64)
        .bind(result.status.as_str())
        .bind(value)
        .bind(&result.error_message)
        .bind(result.completed_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query(
            "SELECT run_id, workflow, status, started_at, finished_at, error FROM workflow_runs WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, workflow, status, started_at, finished_at, error)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id) DO UPDATE SET
                status = EXCLUDED.status,
                finished_at = EXCLUDED.finished_at,
                error = EXCLUDED.error
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.error)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
