//! Postgres-backed `link_analyser::PriorityQueue`.
//!
//! Grounded on the teacher's `Job::claim_jobs` (`kernel/jobs/job.rs`): a `FOR UPDATE SKIP
//! LOCKED` CTE that atomically claims the next ready rows and marks them leased in the same
//! statement, so two workers racing `lease()` never receive the same job. `fail()`'s backoff
//! reuses `link_analyser::queue::backoff_for_attempt`, the same formula the crate's in-memory
//! reference queue uses, so both implementations retry on an identical schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use link_analyser::domain::{LinkKind, Priority};
use link_analyser::queue::{backoff_for_attempt, EnqueueOutcome, Lease, QueueStats, MAX_ATTEMPTS};
use link_analyser::{BackendUnavailable, Job, PriorityQueue};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::kernel::ServerKernel;

pub struct PostgresQueue {
    kernel: Arc<ServerKernel>,
}

impl PostgresQueue {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    fn pool(&self) -> &PgPool {
        &self.kernel.db_pool
    }
}

fn err(e: impl std::fmt::Display) -> BackendUnavailable {
    BackendUnavailable(e.to_string())
}

fn kind_str(kind: LinkKind) -> &'static str {
    match kind {
        LinkKind::Batch => "batch",
        LinkKind::Sheet => "sheet",
    }
}

fn kind_from_str(s: &str) -> LinkKind {
    match s {
        "sheet" => LinkKind::Sheet,
        _ => LinkKind::Batch,
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Job {
    Job {
        job_id: row.get("job_id"),
        kind: kind_from_str(row.get("kind")),
        user_id: row.get("user_id"),
        project_id: row.get("project_id"),
        link_id: row.get("link_id"),
        sheet_id: row.get("sheet_id"),
        source_url: row.get("source_url"),
        target_domain: row.get("target_domain"),
        priority: Priority(row.get::<i16, _>("priority") as u8),
        attempts: row.get("attempts"),
        enqueued_at: row.get("enqueued_at"),
    }
}

#[async_trait]
impl PriorityQueue for PostgresQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, BackendUnavailable> {
        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                job_id, kind, user_id, project_id, link_id, sheet_id, source_url,
                target_domain, priority, attempts, enqueued_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.job_id)
        .bind(kind_str(job.kind))
        .bind(job.user_id)
        .bind(job.project_id)
        .bind(job.link_id)
        .bind(job.sheet_id)
        .bind(&job.source_url)
        .bind(&job.target_domain)
        .bind(job.priority.0 as i16)
        .bind(job.attempts)
        .bind(job.enqueued_at)
        .execute(self.pool())
        .await
        .map_err(err)?;

        Ok(if result.rows_affected() == 0 {
            EnqueueOutcome::Duplicate
        } else {
            EnqueueOutcome::Created
        })
    }

    async fn lease(
        &self,
        max: usize,
        lease_duration: Duration,
    ) -> Result<Vec<Lease>, BackendUnavailable> {
        let lease_ms = lease_duration.as_millis() as i64;
        let rows = sqlx::query(
            r#"
            WITH ready AS (
                SELECT job_id
                FROM queue_jobs
                WHERE dead_lettered_at IS NULL
                  AND (not_before IS NULL OR not_before <= NOW())
                  AND (lease_id IS NULL OR lease_expires_at <= NOW())
                ORDER BY priority ASC, enqueued_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET lease_id = gen_random_uuid(),
                lease_expires_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
                not_before = NULL
            WHERE job_id IN (SELECT job_id FROM ready)
            RETURNING job_id, kind, user_id, project_id, link_id, sheet_id, source_url,
                      target_domain, priority, attempts, enqueued_at, lease_id, lease_expires_at
            "#,
        )
        .bind(max as i64)
        .bind(lease_ms)
        .fetch_all(self.pool())
        .await
        .map_err(err)?;

        Ok(rows
            .iter()
            .map(|row| Lease {
                job: row_to_job(row),
                lease_id: row.get("lease_id"),
                lease_expires_at: row.get("lease_expires_at"),
            })
            .collect())
    }

    async fn complete(&self, lease_id: Uuid) -> Result<(), BackendUnavailable> {
        sqlx::query("DELETE FROM queue_jobs WHERE lease_id = $1")
            .bind(lease_id)
            .execute(self.pool())
            .await
            .map_err(err)?;
        Ok(())
    }

    async fn fail(&self, lease_id: Uuid, _reason: &str) -> Result<(), BackendUnavailable> {
        let row = sqlx::query("SELECT job_id, attempts FROM queue_jobs WHERE lease_id = $1")
            .bind(lease_id)
            .fetch_optional(self.pool())
            .await
            .map_err(err)?;
        let Some(row) = row else {
            // Lease already expired and reaped — fail silently (spec §4.1).
            return Ok(());
        };
        let job_id: Uuid = row.get("job_id");
        let attempts: i32 = row.get::<i32, _>("attempts") + 1;

        if attempts > MAX_ATTEMPTS {
            sqlx::query(
                "UPDATE queue_jobs SET attempts = $1, lease_id = NULL, dead_lettered_at = NOW() WHERE job_id = $2",
            )
            .bind(attempts)
            .bind(job_id)
            .execute(self.pool())
            .await
            .map_err(err)?;
        } else {
            let backoff = backoff_for_attempt(attempts);
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET attempts = $1, lease_id = NULL, lease_expires_at = NULL,
                    not_before = NOW() + ($2 || ' milliseconds')::INTERVAL
                WHERE job_id = $3
                "#,
            )
            .bind(attempts)
            .bind(backoff.as_millis() as i64)
            .bind(job_id)
            .execute(self.pool())
            .await
            .map_err(err)?;
        }
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<usize, BackendUnavailable> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET lease_id = NULL, lease_expires_at = NULL
            WHERE lease_id IS NOT NULL AND lease_expires_at <= NOW()
            "#,
        )
        .execute(self.pool())
        .await
        .map_err(err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn dead_letters(&self) -> Result<Vec<Job>, BackendUnavailable> {
        let rows = sqlx::query(
            "SELECT * FROM queue_jobs WHERE dead_lettered_at IS NOT NULL ORDER BY dead_lettered_at DESC LIMIT 50",
        )
        .fetch_all(self.pool())
        .await
        .map_err(err)?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn list_by_project(&self, project_id: Uuid) -> Result<Vec<Job>, BackendUnavailable> {
        let rows = sqlx::query("SELECT * FROM queue_jobs WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(self.pool())
            .await
            .map_err(err)?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn stats(&self) -> Result<QueueStats, BackendUnavailable> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE dead_lettered_at IS NULL AND lease_id IS NULL) AS waiting,
                COUNT(*) FILTER (WHERE dead_lettered_at IS NULL AND lease_id IS NOT NULL) AS leased,
                COUNT(*) FILTER (WHERE dead_lettered_at IS NOT NULL) AS dead_lettered
            FROM queue_jobs
            "#,
        )
        .fetch_one(self.pool())
        .await
        .map_err(err)?;
        Ok(QueueStats {
            waiting: row.get::<i64, _>("waiting") as usize,
            leased: row.get::<i64, _>("leased") as usize,
            dead_lettered: row.get::<i64, _>("dead_lettered") as usize,
        })
    }

    async fn has_outstanding(
        &self,
        project_id: Uuid,
        kind: LinkKind,
    ) -> Result<bool, BackendUnavailable> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM queue_jobs
                WHERE project_id = $1 AND kind = $2 AND dead_lettered_at IS NULL
            ) AS outstanding
            "#,
        )
        .bind(project_id)
        .bind(kind_str(kind))
        .fetch_one(self.pool())
        .await
        .map_err(err)?;
        Ok(row.get("outstanding"))
    }
}

