use super::queue::UnitQueue;
use super::types::{
    ClaimedUnit, EnqueueOutcome, EnqueueRequest, LeaseRecovery, UnitFailure, UnitStatus,
};
use crate::error::QueueError;
use crate::ids::dedupe_hash_hex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// `dispatch_units` table claimed with `FOR UPDATE SKIP LOCKED`, safe for many worker processes.
#[derive(Debug, Clone)]
pub struct PgUnitQueue {
    db: PgPool,
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: Uuid,
    kind: String,
    payload: SqlJson<serde_json::Value>,
    attempts: i32,
    max_attempts: i32,
}

impl PgUnitQueue {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn status_of(&self, id: Uuid) -> Result<Option<String>, QueueError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM dispatch_units WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(status)
    }
}

#[async_trait]
impl UnitQueue for PgUnitQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, QueueError> {
        let dedupe_key = request
            .dedupe_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let dedupe_hash = dedupe_key.map(dedupe_hash_hex);

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO dispatch_units (
                id, kind, payload, status, dedupe_key, dedupe_hash, attempts, max_attempts,
                available_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, $7, now(), now(), now())
            ON CONFLICT (dedupe_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.kind.trim())
        .bind(SqlJson(&request.payload))
        .bind(UnitStatus::Pending.as_str())
        .bind(dedupe_key)
        .bind(dedupe_hash.as_deref())
        .bind(request.max_attempts.max(1))
        .fetch_optional(&self.db)
        .await?;

        if let Some(id) = inserted {
            return Ok(EnqueueOutcome { id, created: true });
        }

        // Conflict: only possible when a dedupe hash was supplied.
        let existing: Uuid = sqlx::query_scalar(
            r#"
            SELECT id
            FROM dispatch_units
            WHERE dedupe_hash = $1
            LIMIT 1
            "#,
        )
        .bind(dedupe_hash.as_deref())
        .fetch_one(&self.db)
        .await?;
        Ok(EnqueueOutcome {
            id: existing,
            created: false,
        })
    }

    async fn claim_next(&self) -> Result<Option<ClaimedUnit>, QueueError> {
        let claimed: Option<ClaimedRow> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT id
                FROM dispatch_units
                WHERE status = $1
                  AND available_at <= now()
                ORDER BY available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE dispatch_units
            SET status = $2,
                attempts = attempts + 1,
                started_at = now(),
                updated_at = now()
            WHERE id IN (SELECT id FROM next)
            RETURNING id, kind, payload, attempts, max_attempts
            "#,
        )
        .bind(UnitStatus::Pending.as_str())
        .bind(UnitStatus::Running.as_str())
        .fetch_optional(&self.db)
        .await?;

        Ok(claimed.map(|row| ClaimedUnit {
            id: row.id,
            kind: row.kind,
            payload: row.payload.0,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
        }))
    }

    async fn mark_completed(
        &self,
        claimed: &ClaimedUnit,
        result_status: &str,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_units
            SET status = $3,
                result_status = $4,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
              AND attempts = $2
              AND status = $5
            "#,
        )
        .bind(claimed.id)
        .bind(claimed.attempts)
        .bind(UnitStatus::Completed.as_str())
        .bind(result_status)
        .bind(UnitStatus::Running.as_str())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        claimed: &ClaimedUnit,
        failure: &UnitFailure,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, QueueError> {
        let result = match retry_at {
            Some(retry_at) => {
                sqlx::query(
                    r#"
                    UPDATE dispatch_units
                    SET status = $3,
                        last_error = $4,
                        available_at = $5,
                        started_at = NULL,
                        updated_at = now()
                    WHERE id = $1
                      AND attempts = $2
                      AND status = $6
                    "#,
                )
                .bind(claimed.id)
                .bind(claimed.attempts)
                .bind(UnitStatus::Pending.as_str())
                .bind(SqlJson(failure))
                .bind(retry_at)
                .bind(UnitStatus::Running.as_str())
                .execute(&self.db)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE dispatch_units
                    SET status = $3,
                        last_error = $4,
                        completed_at = now(),
                        updated_at = now()
                    WHERE id = $1
                      AND attempts = $2
                      AND status = $5
                    "#,
                )
                .bind(claimed.id)
                .bind(claimed.attempts)
                .bind(UnitStatus::Failed.as_str())
                .bind(SqlJson(failure))
                .bind(UnitStatus::Running.as_str())
                .execute(&self.db)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<LeaseRecovery, QueueError> {
        let lease_seconds = i64::try_from(lease.as_secs()).unwrap_or(i64::MAX);
        let statuses: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE dispatch_units
            SET status = CASE WHEN attempts >= max_attempts THEN $2 ELSE $1 END,
                last_error = CASE WHEN attempts >= max_attempts THEN $4 ELSE last_error END,
                completed_at = CASE WHEN attempts >= max_attempts THEN now() ELSE completed_at END,
                available_at = now(),
                started_at = NULL,
                updated_at = now()
            WHERE status = $3
              AND started_at < now() - make_interval(secs => $5)
            RETURNING status
            "#,
        )
        .bind(UnitStatus::Pending.as_str())
        .bind(UnitStatus::Failed.as_str())
        .bind(UnitStatus::Running.as_str())
        .bind(SqlJson(UnitFailure::lease_expired(lease)))
        .bind(lease_seconds as f64)
        .fetch_all(&self.db)
        .await?;

        let failed = statuses
            .iter()
            .filter(|status| status.as_str() == UnitStatus::Failed.as_str())
            .count() as u64;
        Ok(LeaseRecovery {
            requeued: statuses.len() as u64 - failed,
            failed,
        })
    }
}
