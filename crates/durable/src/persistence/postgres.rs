//! PostgreSQL implementation of WorkflowEventStore
//!
//! Runs, histories and task queues live in the tables created by the
//! migrations under `crates/durable/migrations`, so in-flight runs outlive
//! the worker process:
//! - Run-id deduplication via a partial unique index on in-flight runs
//! - Optimistic concurrency on history appends via sequence numbers
//! - Task claiming with `FOR UPDATE SKIP LOCKED`
//! - Claim leases refreshed by heartbeats and reclaimed when stale

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::reliability::{RetryDecision, RetryPolicy};
use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowError, WorkflowEvent};

const RUN_COLUMNS: &str = "execution_id, run_id, workflow_type, task_queue, status, attempt, \
                           input, retry_policy, result, error, created_at, updated_at";

/// How often `create_run` retries when the in-flight run it collided with
/// finished before it could be read back
const CREATE_RUN_ATTEMPTS: usize = 3;

/// PostgreSQL implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use benchflow_durable::persistence::PostgresWorkflowEventStore;
///
/// let store = PostgresWorkflowEventStore::connect("postgres://localhost/benchflow", 10).await?;
/// let executor = WorkflowExecutor::new(store);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(database)?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        info!("Workflow store schema is up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn in_flight_run(&self, run_id: &str) -> Result<Option<RunInfo>, StoreError> {
        sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM durable_runs \
             WHERE run_id = $1 AND status IN ('pending', 'running')"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .map(|row| run_from_row(&row))
        .transpose()
    }
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn create_run(&self, run: NewRun) -> Result<CreateRunOutcome, StoreError> {
        let retry_policy = run.retry_policy.as_ref().map(to_json).transpose()?;

        for _ in 0..CREATE_RUN_ATTEMPTS {
            let inserted = sqlx::query(&format!(
                "INSERT INTO durable_runs \
                     (execution_id, run_id, workflow_type, task_queue, input, retry_policy) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (run_id) WHERE status IN ('pending', 'running') DO NOTHING \
                 RETURNING {RUN_COLUMNS}"
            ))
            .bind(Uuid::now_v7())
            .bind(&run.run_id)
            .bind(&run.workflow_type)
            .bind(&run.task_queue)
            .bind(&run.input)
            .bind(&retry_policy)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;

            if let Some(row) = inserted {
                let info = run_from_row(&row)?;
                debug!(execution_id = %info.execution_id, "created run");
                return Ok(CreateRunOutcome::Created(info));
            }

            // Lost to an in-flight run; it may finish before we read it
            if let Some(existing) = self.in_flight_run(&run.run_id).await? {
                return Ok(CreateRunOutcome::Existing(existing));
            }
        }

        Err(StoreError::Database(format!(
            "run {} kept changing state while being submitted",
            run.run_id
        )))
    }

    #[instrument(skip(self))]
    async fn get_run(&self, execution_id: Uuid) -> Result<RunInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM durable_runs WHERE execution_id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn latest_run(&self, run_id: &str) -> Result<RunInfo, StoreError> {
        // v7 execution ids sort by creation time
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM durable_runs \
             WHERE run_id = $1 ORDER BY execution_id DESC LIMIT 1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn begin_attempt(&self, execution_id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_runs
            SET attempt = attempt + 1,
                status = 'running',
                updated_at = NOW()
            WHERE execution_id = $1
            RETURNING attempt
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        Ok(row.try_get::<i32, _>("attempt").map_err(database)? as u32)
    }

    #[instrument(skip(self, result, error))]
    async fn update_run_status(
        &self,
        execution_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error.as_ref().map(to_json).transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE durable_runs
            SET status = $2,
                result = $3,
                error = $4,
                updated_at = NOW()
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.to_string())
        .bind(&result)
        .bind(&error_json)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        debug!(%execution_id, %status, "updated run status");
        Ok(())
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        execution_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        // The run row serializes concurrent appends to one history
        sqlx::query("SELECT 1 FROM durable_runs WHERE execution_id = $1 FOR UPDATE")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(database)?
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS next_seq FROM durable_events WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(database)?;
        let current_sequence = row.try_get::<i64, _>("next_seq").map_err(database)? as i32;

        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let recorded_at = Utc::now();
        let mut new_sequence = current_sequence;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO durable_events (execution_id, sequence_num, event_type, event_data, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(execution_id)
            .bind(new_sequence)
            .bind(event.kind())
            .bind(to_json(&event)?)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

            new_sequence += 1;
        }

        sqlx::query("UPDATE durable_runs SET updated_at = $2 WHERE execution_id = $1")
            .bind(execution_id)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

        tx.commit().await.map_err(database)?;

        debug!(%execution_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, execution_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, recorded_at, event_data
            FROM durable_events
            WHERE execution_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(%execution_id, error = %e, "Failed to load events");
            database(e)
        })?;

        if rows.is_empty() {
            // Distinguish an empty history from an unknown execution
            self.get_run(execution_id).await?;
        }

        rows.iter()
            .map(|row| -> Result<HistoryEvent, StoreError> {
                Ok(HistoryEvent {
                    sequence: row.try_get("sequence_num").map_err(database)?,
                    recorded_at: row.try_get("recorded_at").map_err(database)?,
                    event: from_json(row.try_get("event_data").map_err(database)?)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, task), fields(run_id = %task.run_id, task_queue = %task.task_queue))]
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let (kind, activity_id, activity_type, input, options, max_attempts) = match &task.kind {
            TaskKind::Workflow => ("workflow", None, None, None, None, 1),
            TaskKind::Activity {
                activity_id,
                activity_type,
                input,
                options,
            } => (
                "activity",
                Some(activity_id.as_str()),
                Some(activity_type.as_str()),
                Some(input.clone()),
                Some(to_json(options)?),
                options.retry_policy.max_attempts,
            ),
        };

        sqlx::query(
            r#"
            INSERT INTO durable_tasks (
                id, execution_id, run_id, task_queue, kind,
                activity_id, activity_type, input, options, max_attempts, visible_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    NOW() + ($11::BIGINT * INTERVAL '1 millisecond'))
            "#,
        )
        .bind(task_id)
        .bind(task.execution_id)
        .bind(&task.run_id)
        .bind(&task.task_queue)
        .bind(kind)
        .bind(activity_id)
        .bind(activity_type)
        .bind(&input)
        .bind(&options)
        .bind(max_attempts as i32)
        .bind(millis(task.delay))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to enqueue task");
            database(e)
        })?;

        debug!(%task_id, kind, "enqueued task");
        Ok(task_id)
    }

    #[instrument(skip(self))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM durable_tasks
                WHERE status = 'pending'
                  AND task_queue = $1
                  AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_tasks t
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.execution_id, t.run_id, t.task_queue, t.kind,
                      t.activity_id, t.activity_type, t.input, t.options,
                      t.attempt, t.max_attempts
            "#,
        )
        .bind(task_queue)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to claim tasks");
            database(e)
        })?;

        let mut claimed = rows
            .iter()
            .map(claimed_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // UPDATE ... RETURNING does not keep the CTE's order
        claimed.sort_by_key(|task| task.id);

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn complete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM durable_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(database)?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        debug!(%task_id, "completed task");
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        let row = sqlx::query(
            "SELECT kind, attempt, options FROM durable_tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database)?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let kind: String = row.try_get("kind").map_err(database)?;
        let attempt = row.try_get::<i32, _>("attempt").map_err(database)? as u32;
        let decision = if kind == "activity" {
            let options: ActivityOptions =
                from_json(row.try_get("options").map_err(database)?)?;
            options.retry_policy.decide(attempt, error)
        } else {
            RetryDecision::NonRetryable
        };

        let outcome = match decision {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                sqlx::query(
                    r#"
                    UPDATE durable_tasks
                    SET status = 'pending',
                        claimed_by = NULL,
                        claimed_at = NULL,
                        heartbeat_at = NULL,
                        last_error = $2,
                        visible_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond')
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(to_json(error)?)
                .bind(millis(delay))
                .execute(&mut *tx)
                .await
                .map_err(database)?;

                debug!(%task_id, next_attempt, "task will retry");
                TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                }
            }
            RetryDecision::NonRetryable | RetryDecision::Exhausted => {
                sqlx::query("DELETE FROM durable_tasks WHERE id = $1")
                    .bind(task_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(database)?;

                if decision == RetryDecision::Exhausted {
                    TaskFailureOutcome::Exhausted
                } else {
                    TaskFailureOutcome::NonRetryable
                }
            }
        };

        tx.commit().await.map_err(database)?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let extended = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET heartbeat_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;

        if extended.is_some() {
            return Ok(true);
        }

        // No longer ours: either reclaimed or gone altogether
        sqlx::query("SELECT 1 FROM durable_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .map(|_| false)
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                visible_at = NOW()
            WHERE status = 'claimed'
              AND heartbeat_at <= NOW() - ($1::BIGINT * INTERVAL '1 millisecond')
            RETURNING id
            "#,
        )
        .bind(millis(stale_threshold))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to reclaim stale tasks");
            database(e)
        })?;

        let reclaimed = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id").map_err(database))
            .collect::<Result<Vec<Uuid>, _>>()?;

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale tasks");
        }
        Ok(reclaimed)
    }
}

// Helper functions

fn database(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn parse_run_status(status: &str) -> Result<RunStatus, StoreError> {
    match status {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        _ => Err(StoreError::Database(format!("unknown run status: {status}"))),
    }
}

fn run_from_row(row: &PgRow) -> Result<RunInfo, StoreError> {
    let status: String = row.try_get("status").map_err(database)?;
    let retry_policy: Option<serde_json::Value> = row.try_get("retry_policy").map_err(database)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(database)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(database)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(database)?;

    Ok(RunInfo {
        execution_id: row.try_get("execution_id").map_err(database)?,
        run_id: row.try_get("run_id").map_err(database)?,
        workflow_type: row.try_get("workflow_type").map_err(database)?,
        task_queue: row.try_get("task_queue").map_err(database)?,
        status: parse_run_status(&status)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(database)? as u32,
        input: row.try_get("input").map_err(database)?,
        retry_policy: retry_policy.map(from_json::<RetryPolicy>).transpose()?,
        result: row.try_get("result").map_err(database)?,
        error: error.map(from_json::<WorkflowError>).transpose()?,
        created_at,
        updated_at,
    })
}

fn claimed_from_row(row: &PgRow) -> Result<ClaimedTask, StoreError> {
    let kind: String = row.try_get("kind").map_err(database)?;
    let kind = match kind.as_str() {
        "workflow" => TaskKind::Workflow,
        "activity" => {
            let activity_id: Option<String> = row.try_get("activity_id").map_err(database)?;
            let activity_type: Option<String> = row.try_get("activity_type").map_err(database)?;
            let input: Option<serde_json::Value> = row.try_get("input").map_err(database)?;
            let options: Option<serde_json::Value> = row.try_get("options").map_err(database)?;
            match (activity_id, activity_type, options) {
                (Some(activity_id), Some(activity_type), Some(options)) => TaskKind::Activity {
                    activity_id,
                    activity_type,
                    input: input.unwrap_or(serde_json::Value::Null),
                    options: from_json(options)?,
                },
                _ => {
                    return Err(StoreError::Database(
                        "activity task is missing its activity columns".to_string(),
                    ))
                }
            }
        }
        other => return Err(StoreError::Database(format!("unknown task kind: {other}"))),
    };

    Ok(ClaimedTask {
        id: row.try_get("id").map_err(database)?,
        execution_id: row.try_get("execution_id").map_err(database)?,
        run_id: row.try_get("run_id").map_err(database)?,
        task_queue: row.try_get("task_queue").map_err(database)?,
        kind,
        attempt: row.try_get::<i32, _>("attempt").map_err(database)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(database)? as u32,
    })
}
