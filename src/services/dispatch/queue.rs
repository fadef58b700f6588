use super::types::{
    ClaimedUnit, DispatchUnit, EnqueueOutcome, EnqueueRequest, LeaseRecovery, UnitFailure,
};
use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Storage behind the dispatcher. Claims must be exclusive across every consumer of the same
/// backing store; delivery is at-least-once.
#[async_trait]
pub trait UnitQueue: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, QueueError>;

    async fn claim_next(&self) -> Result<Option<ClaimedUnit>, QueueError>;

    /// Settling only applies while `claimed` is still the unit's current claim; `false` means
    /// the lease was recovered in the meantime and the result was dropped.
    async fn mark_completed(
        &self,
        claimed: &ClaimedUnit,
        result_status: &str,
    ) -> Result<bool, QueueError>;

    /// `retry_at = None` makes the failure final.
    async fn mark_failed(
        &self,
        claimed: &ClaimedUnit,
        failure: &UnitFailure,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, QueueError>;

    /// Units whose claim is older than `lease` go back to pending, or to failed when that claim
    /// was their last attempt.
    async fn requeue_stale(&self, lease: Duration) -> Result<LeaseRecovery, QueueError>;
}

/// Enqueue handle shared by the scheduler, the fan-out step and the CLI.
#[derive(Clone)]
pub struct DispatchClient {
    queue: Arc<dyn UnitQueue>,
    max_attempts: i32,
}

impl DispatchClient {
    pub fn new(queue: Arc<dyn UnitQueue>, max_attempts: i32) -> Self {
        Self {
            queue,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn queue(&self) -> &Arc<dyn UnitQueue> {
        &self.queue
    }

    pub async fn enqueue(&self, unit: &DispatchUnit) -> Result<EnqueueOutcome, QueueError> {
        let request = EnqueueRequest {
            kind: unit.kind().to_string(),
            payload: serde_json::to_value(unit)?,
            dedupe_key: Some(unit.dedupe_key()),
            max_attempts: self.max_attempts,
        };
        let outcome = self.queue.enqueue(request).await?;
        tracing::debug!(
            unit_id = %outcome.id,
            kind = unit.kind(),
            created = outcome.created,
            "dispatch unit enqueued"
        );
        Ok(outcome)
    }
}
