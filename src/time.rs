use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Zone in which cron expressions and run dates are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    Local,
    Named(Tz),
}

impl ScheduleZone {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(ScheduleZone::Local);
        };
        if raw.eq_ignore_ascii_case("local") {
            return Ok(ScheduleZone::Local);
        }
        Tz::from_str(raw)
            .map(ScheduleZone::Named)
            .map_err(|err| anyhow!("unknown time zone {raw:?}: {err}"))
    }

    pub fn label(&self) -> String {
        match self {
            ScheduleZone::Local => "local".to_string(),
            ScheduleZone::Named(tz) => tz.name().to_string(),
        }
    }

    /// First instant strictly after `after` matching `schedule` in this zone.
    pub fn next_fire(&self, schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleZone::Local => schedule
                .after(&after.with_timezone(&Local))
                .next()
                .map(|ts| ts.with_timezone(&Utc)),
            ScheduleZone::Named(tz) => schedule
                .after(&after.with_timezone(tz))
                .next()
                .map(|ts| ts.with_timezone(&Utc)),
        }
    }

    pub fn run_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self {
            ScheduleZone::Local => ts.with_timezone(&Local).date_naive(),
            ScheduleZone::Named(tz) => ts.with_timezone(tz).date_naive(),
        }
    }
}

/// Accepts classic 5-field crontab lines by pinning the seconds field to zero.
pub fn normalize_cron_expr(expr: &str) -> Result<String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("cron expression empty"));
    }
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        Ok(format!("0 {}", parts.join(" ")))
    } else {
        Ok(parts.join(" "))
    }
}

pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expr(expr)?;
    Schedule::from_str(&normalized).map_err(|err| anyhow!("invalid cron expression {expr:?}: {err}"))
}
