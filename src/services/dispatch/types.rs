use crate::ids::instant_key;
use crate::models::{ProfileKind, SensorSnapshot};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable payload. Immutable once enqueued; handlers re-derive everything else from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchUnit {
    RunProfile {
        profile: ProfileKind,
        scheduled_for: DateTime<Utc>,
        run_date: NaiveDate,
    },
    AnalyzeSensor {
        profile: ProfileKind,
        scheduled_for: DateTime<Utc>,
        run_date: NaiveDate,
        sensor: SensorSnapshot,
    },
}

impl DispatchUnit {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchUnit::RunProfile { .. } => "run_profile",
            DispatchUnit::AnalyzeSensor { .. } => "analyze_sensor",
        }
    }

    pub fn profile(&self) -> ProfileKind {
        match self {
            DispatchUnit::RunProfile { profile, .. } | DispatchUnit::AnalyzeSensor { profile, .. } => {
                *profile
            }
        }
    }

    /// Two enqueues with the same key collapse into one unit.
    pub fn dedupe_key(&self) -> String {
        match self {
            DispatchUnit::RunProfile {
                profile,
                scheduled_for,
                ..
            } => format!("run_profile:{}:{}", profile, instant_key(*scheduled_for)),
            DispatchUnit::AnalyzeSensor {
                profile,
                scheduled_for,
                sensor,
                ..
            } => format!(
                "analyze_sensor:{}:{}:{}",
                profile,
                instant_key(*scheduled_for),
                sensor.id
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub kind: String,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct ClaimedUnit {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
}

/// Outcome of one lease sweep: units handed back for another attempt, and units whose final
/// attempt expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseRecovery {
    pub requeued: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl UnitFailure {
    pub fn lease_expired(lease: std::time::Duration) -> Self {
        Self::permanent(
            "lease_expired",
            format!("final attempt held its claim past the {}s lease", lease.as_secs()),
        )
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}
