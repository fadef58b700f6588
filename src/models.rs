use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named analysis context. Matches `tasks.name` in the relational catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Sleep,
    Work,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Sleep => "sleep",
            ProfileKind::Work => "work",
        }
    }

    /// System prompt for the analysis backend. Each reply must open with a verdict line.
    pub fn instruction(&self) -> &'static str {
        match self {
            ProfileKind::Sleep => concat!(
                "You are an assistant that analyzes sleep temperature data. ",
                "You will receive one reading per line as `source - timestamp - temperature`. ",
                "Decide whether the bedroom temperature during sleep is too high, too low, ",
                "or within a healthy range. Reference bands: 8-12 degrees C is cold, ",
                "12-28 degrees C is the broad acceptable range, with cooler values preferred for sleep. ",
                "Focus on how the temperature affects rest and brain activity during sleep. ",
                "The first line of your reply must be exactly `VERDICT: RISK` or `VERDICT: SAFE`. ",
                "After that line, respond ONLY in valid HTML using the tags <p> and <b>. ",
                "If risky, explain why. Keep the analysis short and clear."
            ),
            ProfileKind::Work => concat!(
                "You are an assistant that analyzes work hours temperature data. ",
                "You will receive one reading per line as `source - timestamp - temperature`. ",
                "Decide whether the workspace temperature during work hours is too high, too low, ",
                "or within a healthy range. Reference bands: 8-12 degrees C is too cold to work, ",
                "12-28 degrees C is the acceptable range for focused work. ",
                "Focus on how the temperature affects concentration during work. ",
                "The first line of your reply must be exactly `VERDICT: RISK` or `VERDICT: SAFE`. ",
                "After that line, respond ONLY in valid HTML using the tags <p> and <b>. ",
                "If risky, explain why. Give only the analysis and nothing else."
            ),
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sleep" => Ok(ProfileKind::Sleep),
            "work" => Ok(ProfileKind::Work),
            other => Err(format!("unknown profile {other:?} (expected sleep or work)")),
        }
    }
}

/// Catalog row of a sensor, frozen at fan-out time and carried in the child unit payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorSnapshot {
    pub id: i32,
    pub name: String,
    pub source_address: Option<String>,
    pub workspace_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OwnerUser {
    pub id: i32,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub source_address: String,
    pub time: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: Option<f64>,
}
