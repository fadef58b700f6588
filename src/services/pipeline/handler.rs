use super::fanout::ProfileFanOut;
use super::sensor::AnalysisPipeline;
use crate::services::dispatch::{DispatchUnit, UnitFailure, UnitHandler};
use async_trait::async_trait;
use std::sync::Arc;

/// Routes dispatch units to fan-out or per-sensor analysis.
pub struct MonitorHandler {
    pipeline: Arc<AnalysisPipeline>,
    fan_out: ProfileFanOut,
}

impl MonitorHandler {
    pub fn new(pipeline: Arc<AnalysisPipeline>, fan_out: ProfileFanOut) -> Self {
        Self { pipeline, fan_out }
    }
}

#[async_trait]
impl UnitHandler for MonitorHandler {
    async fn handle(&self, unit: DispatchUnit) -> Result<String, UnitFailure> {
        let result = match &unit {
            DispatchUnit::RunProfile {
                profile,
                scheduled_for,
                run_date,
            } => self
                .fan_out
                .fan_out(*profile, *scheduled_for, *run_date)
                .await
                .map(|_| "fanned_out"),
            DispatchUnit::AnalyzeSensor {
                profile,
                run_date,
                sensor,
                ..
            } => self
                .pipeline
                .run_sensor(*profile, *run_date, sensor)
                .await
                .map(|outcome| outcome.as_str()),
        };
        result.map(str::to_string).map_err(|err| {
            tracing::warn!(
                profile = %unit.profile(),
                code = err.code(),
                error = %err,
                "unit execution failed"
            );
            UnitFailure::retryable(err.code(), err.to_string())
        })
    }
}
