use crate::error::PipelineError;
use crate::ids::notification_key;
use crate::models::{ProfileKind, Reading, SensorSnapshot};
use crate::services::analysis_backend::AnalysisBackend;
use crate::services::catalog::RelationalCatalog;
use crate::services::notifications::{compose_alert, NotificationLedger, NotificationSink};
use crate::services::timeseries::TimeSeriesReader;
use chrono::{NaiveDate, SecondsFormat};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorOutcome {
    NoSourceAddress,
    EmptyWindow,
    Safe,
    OwnerMissing,
    AlreadyNotified,
    Notified,
    NotificationFailed,
}

impl SensorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorOutcome::NoSourceAddress => "no_source_address",
            SensorOutcome::EmptyWindow => "empty_window",
            SensorOutcome::Safe => "safe",
            SensorOutcome::OwnerMissing => "owner_missing",
            SensorOutcome::AlreadyNotified => "already_notified",
            SensorOutcome::Notified => "notified",
            SensorOutcome::NotificationFailed => "notification_failed",
        }
    }
}

/// Oldest first, one reading per line.
pub fn summarize_readings(readings: &[Reading]) -> String {
    readings
        .iter()
        .rev()
        .map(|reading| {
            format!(
                "{} - {} - {:.2}",
                reading.source_address,
                reading.time.to_rfc3339_opts(SecondsFormat::Secs, true),
                reading.temperature
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct AnalysisPipeline {
    reader: Arc<dyn TimeSeriesReader>,
    catalog: Arc<dyn RelationalCatalog>,
    backend: Arc<dyn AnalysisBackend>,
    sink: Arc<dyn NotificationSink>,
    ledger: Option<Arc<dyn NotificationLedger>>,
    window: Duration,
}

impl AnalysisPipeline {
    pub fn new(
        reader: Arc<dyn TimeSeriesReader>,
        catalog: Arc<dyn RelationalCatalog>,
        backend: Arc<dyn AnalysisBackend>,
        sink: Arc<dyn NotificationSink>,
        window: Duration,
    ) -> Self {
        Self {
            reader,
            catalog,
            backend,
            sink,
            ledger: None,
            window,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn NotificationLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Runs one sensor for one profile. Errors are the unit-fatal ones; every other ending
    /// is an outcome.
    pub async fn run_sensor(
        &self,
        profile: ProfileKind,
        run_date: NaiveDate,
        sensor: &SensorSnapshot,
    ) -> Result<SensorOutcome, PipelineError> {
        let Some(source_address) = sensor
            .source_address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            tracing::info!(sensor_id = sensor.id, "sensor has no source address; skipping");
            return Ok(SensorOutcome::NoSourceAddress);
        };

        let readings = self.reader.query(source_address, self.window).await?;
        if readings.is_empty() {
            tracing::info!(sensor_id = sensor.id, source_address, "no readings in window; nothing to do");
            return Ok(SensorOutcome::EmptyWindow);
        }

        let summary = summarize_readings(&readings);
        let verdict = self.backend.analyze(profile, &summary).await?;
        tracing::info!(
            sensor_id = sensor.id,
            readings = readings.len(),
            assessment = verdict.assessment.as_str(),
            "analysis verdict received"
        );
        if !verdict.is_risk() {
            return Ok(SensorOutcome::Safe);
        }

        let Some(owner) = self.catalog.user_for_sensor(sensor.id).await? else {
            tracing::warn!(sensor_id = sensor.id, "risk verdict but sensor has no owner; skipping");
            return Ok(SensorOutcome::OwnerMissing);
        };

        let key = notification_key(sensor.id, profile, run_date);
        if let Some(ledger) = self.ledger.as_ref() {
            if !ledger.try_claim(&key).await? {
                tracing::info!(sensor_id = sensor.id, key = %key, "alert already sent for this run");
                return Ok(SensorOutcome::AlreadyNotified);
            }
        }

        let message = compose_alert(profile, sensor, &verdict.message, &owner);
        match self.sink.send(&message).await {
            Ok(()) => {
                tracing::info!(sensor_id = sensor.id, user_id = owner.id, "alert sent");
                Ok(SensorOutcome::Notified)
            }
            Err(err) => {
                tracing::error!(
                    sensor_id = sensor.id,
                    user_id = owner.id,
                    error = %err,
                    "alert delivery failed"
                );
                if let Some(ledger) = self.ledger.as_ref() {
                    if let Err(err) = ledger.release(&key).await {
                        tracing::warn!(key = %key, error = %err, "failed to release alert key");
                    }
                }
                Ok(SensorOutcome::NotificationFailed)
            }
        }
    }
}
