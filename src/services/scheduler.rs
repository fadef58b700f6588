use crate::config::MonitorConfig;
use crate::error::QueueError;
use crate::models::ProfileKind;
use crate::services::dispatch::{DispatchClient, DispatchUnit, EnqueueOutcome};
use crate::time::{parse_cron, ScheduleZone};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ScheduledTrigger {
    pub profile: ProfileKind,
    pub cron: String,
    schedule: Schedule,
}

impl ScheduledTrigger {
    pub fn new(profile: ProfileKind, cron_expr: &str) -> Result<Self> {
        let schedule = parse_cron(cron_expr)
            .with_context(|| format!("invalid schedule for profile {profile}"))?;
        Ok(Self {
            profile,
            cron: cron_expr.trim().to_string(),
            schedule,
        })
    }
}

/// Trigger registry. It only enqueues `run_profile` units; overlapping schedulers collapse on
/// the unit dedupe key.
pub struct Scheduler {
    client: DispatchClient,
    zone: ScheduleZone,
    triggers: Vec<ScheduledTrigger>,
}

impl Scheduler {
    pub fn new(client: DispatchClient, zone: ScheduleZone) -> Self {
        Self {
            client,
            zone,
            triggers: Vec::new(),
        }
    }

    pub fn from_config(client: DispatchClient, config: &MonitorConfig) -> Result<Self> {
        let mut scheduler = Self::new(client, config.schedule_zone()?);
        for (profile, expr) in config.trigger_exprs() {
            scheduler.schedule(ScheduledTrigger::new(profile, expr)?);
        }
        Ok(scheduler)
    }

    pub fn schedule(&mut self, trigger: ScheduledTrigger) {
        self.triggers.push(trigger);
    }

    pub fn triggers(&self) -> &[ScheduledTrigger] {
        &self.triggers
    }

    /// Earliest instant strictly after `after`, with every profile due at that instant.
    pub fn next_firing(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<ProfileKind>)> {
        let mut best: Option<(DateTime<Utc>, Vec<ProfileKind>)> = None;
        for trigger in &self.triggers {
            let Some(at) = self.zone.next_fire(&trigger.schedule, after) else {
                continue;
            };
            let earlier = best.as_ref().map(|(best_at, _)| at < *best_at).unwrap_or(true);
            if earlier {
                best = Some((at, vec![trigger.profile]));
            } else if let Some((best_at, profiles)) = best.as_mut() {
                if *best_at == at && !profiles.contains(&trigger.profile) {
                    profiles.push(trigger.profile);
                }
            }
        }
        best
    }

    pub async fn fire(
        &self,
        profile: ProfileKind,
        scheduled_for: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let unit = DispatchUnit::RunProfile {
            profile,
            scheduled_for,
            run_date: self.zone.run_date(scheduled_for),
        };
        self.client.enqueue(&unit).await
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            for trigger in &self.triggers {
                tracing::info!(
                    profile = %trigger.profile,
                    cron = %trigger.cron,
                    zone = %self.zone.label(),
                    "schedule registered"
                );
            }
            let mut cursor = Utc::now();
            loop {
                let Some((at, profiles)) = self.next_firing(cursor) else {
                    tracing::warn!("no upcoming schedule firing; scheduler stopping");
                    break;
                };
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                for profile in profiles {
                    match self.fire(profile, at).await {
                        Ok(outcome) => tracing::info!(
                            profile = %profile,
                            scheduled_for = %at,
                            unit_id = %outcome.id,
                            created = outcome.created,
                            "profile run enqueued"
                        ),
                        Err(err) => tracing::error!(
                            profile = %profile,
                            scheduled_for = %at,
                            error = %err,
                            "failed to enqueue profile run"
                        ),
                    }
                }
                cursor = at;
            }
        })
    }
}
