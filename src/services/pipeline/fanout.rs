use crate::error::PipelineError;
use crate::models::ProfileKind;
use crate::services::catalog::RelationalCatalog;
use crate::services::dispatch::{DispatchClient, DispatchUnit};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutSummary {
    pub sensors: usize,
    pub created: usize,
}

/// Turns one profile run into one child unit per associated sensor.
#[derive(Clone)]
pub struct ProfileFanOut {
    catalog: Arc<dyn RelationalCatalog>,
    client: DispatchClient,
}

impl ProfileFanOut {
    pub fn new(catalog: Arc<dyn RelationalCatalog>, client: DispatchClient) -> Self {
        Self { catalog, client }
    }

    /// Every child is enqueued before this returns. Redelivery of the same run finds the
    /// existing children through their dedupe keys.
    pub async fn fan_out(
        &self,
        profile: ProfileKind,
        scheduled_for: DateTime<Utc>,
        run_date: NaiveDate,
    ) -> Result<FanOutSummary, PipelineError> {
        let sensors = self.catalog.sensors_for_profile(profile).await?;
        let mut summary = FanOutSummary {
            sensors: sensors.len(),
            created: 0,
        };
        for sensor in sensors {
            let unit = DispatchUnit::AnalyzeSensor {
                profile,
                scheduled_for,
                run_date,
                sensor,
            };
            if self.client.enqueue(&unit).await?.created {
                summary.created += 1;
            }
        }
        tracing::info!(
            profile = %profile,
            sensors = summary.sensors,
            created = summary.created,
            "profile fanned out"
        );
        Ok(summary)
    }
}
