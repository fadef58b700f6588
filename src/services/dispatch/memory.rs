use super::queue::UnitQueue;
use super::types::{
    ClaimedUnit, EnqueueOutcome, EnqueueRequest, LeaseRecovery, UnitFailure, UnitStatus,
};
use crate::error::QueueError;
use crate::ids::dedupe_hash_hex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-process queue with the same claim, dedupe and retry semantics as [`super::PgUnitQueue`].
/// Backs `--inline` runs and tests; state dies with the process.
#[derive(Default)]
pub struct MemoryUnitQueue {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    units: Vec<MemoryUnit>,
    dedupe: HashMap<String, Uuid>,
}

/// Inspection copy of a stored unit.
#[derive(Debug, Clone)]
pub struct MemoryUnit {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: UnitStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<UnitFailure>,
    pub result_status: Option<String>,
}

impl MemoryUnitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<MemoryUnit> {
        self.state.lock().await.units.clone()
    }
}

#[async_trait]
impl UnitQueue for MemoryUnitQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let dedupe_hash = request
            .dedupe_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(dedupe_hash_hex);

        if let Some(hash) = dedupe_hash.as_ref() {
            if let Some(existing) = state.dedupe.get(hash) {
                return Ok(EnqueueOutcome {
                    id: *existing,
                    created: false,
                });
            }
        }

        let id = Uuid::new_v4();
        state.units.push(MemoryUnit {
            id,
            kind: request.kind.trim().to_string(),
            payload: request.payload,
            status: UnitStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.max(1),
            available_at: Utc::now(),
            started_at: None,
            last_error: None,
            result_status: None,
        });
        if let Some(hash) = dedupe_hash {
            state.dedupe.insert(hash, id);
        }
        Ok(EnqueueOutcome { id, created: true })
    }

    async fn claim_next(&self) -> Result<Option<ClaimedUnit>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        // Vec order is creation order, so min_by_key keeps the oldest among equal times.
        let next = state
            .units
            .iter_mut()
            .filter(|unit| unit.status == UnitStatus::Pending && unit.available_at <= now)
            .min_by_key(|unit| unit.available_at);
        let Some(unit) = next else {
            return Ok(None);
        };
        unit.status = UnitStatus::Running;
        unit.attempts += 1;
        unit.started_at = Some(now);
        Ok(Some(ClaimedUnit {
            id: unit.id,
            kind: unit.kind.clone(),
            payload: unit.payload.clone(),
            attempts: unit.attempts,
            max_attempts: unit.max_attempts,
        }))
    }

    async fn mark_completed(
        &self,
        claimed: &ClaimedUnit,
        result_status: &str,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(unit) = state.current_claim(claimed) else {
            return Ok(false);
        };
        unit.status = UnitStatus::Completed;
        unit.result_status = Some(result_status.to_string());
        Ok(true)
    }

    async fn mark_failed(
        &self,
        claimed: &ClaimedUnit,
        failure: &UnitFailure,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(unit) = state.current_claim(claimed) else {
            return Ok(false);
        };
        unit.last_error = Some(failure.clone());
        match retry_at {
            Some(retry_at) => {
                unit.status = UnitStatus::Pending;
                unit.available_at = retry_at;
                unit.started_at = None;
            }
            None => unit.status = UnitStatus::Failed,
        }
        Ok(true)
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<LeaseRecovery, QueueError> {
        let mut state = self.state.lock().await;
        let Ok(lease_span) = chrono::Duration::from_std(lease) else {
            return Ok(LeaseRecovery::default());
        };
        let now = Utc::now();
        let mut recovery = LeaseRecovery::default();
        for unit in state.units.iter_mut() {
            let expired = unit
                .started_at
                .map(|started| started + lease_span < now)
                .unwrap_or(false);
            if unit.status != UnitStatus::Running || !expired {
                continue;
            }
            unit.started_at = None;
            if unit.attempts >= unit.max_attempts {
                unit.status = UnitStatus::Failed;
                unit.last_error = Some(UnitFailure::lease_expired(lease));
                recovery.failed += 1;
            } else {
                unit.status = UnitStatus::Pending;
                unit.available_at = now;
                recovery.requeued += 1;
            }
        }
        Ok(recovery)
    }
}

impl MemoryState {
    fn current_claim(&mut self, claimed: &ClaimedUnit) -> Option<&mut MemoryUnit> {
        self.units.iter_mut().find(|unit| {
            unit.id == claimed.id
                && unit.status == UnitStatus::Running
                && unit.attempts == claimed.attempts
        })
    }
}
