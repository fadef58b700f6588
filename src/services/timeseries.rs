use crate::config::MonitorConfig;
use crate::error::TimeSeriesError;
use crate::models::Reading;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::time::Duration;

#[async_trait]
pub trait TimeSeriesReader: Send + Sync {
    /// Readings for `source_address` within the trailing `window`, newest first.
    async fn query(
        &self,
        source_address: &str,
        window: Duration,
    ) -> Result<Vec<Reading>, TimeSeriesError>;
}

/// InfluxDB 3 SQL endpoint (`/api/v3/query_sql`).
#[derive(Clone)]
pub struct InfluxSqlReader {
    base_url: String,
    token: Option<String>,
    database: String,
    measurement: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl InfluxSqlReader {
    pub fn new(config: &MonitorConfig, http: reqwest::Client) -> Self {
        Self {
            base_url: config.influx_url.trim_end_matches('/').to_string(),
            token: config.influx_token.clone(),
            database: config.influx_database.clone(),
            measurement: config.influx_measurement.clone(),
            timeout: config.influx_timeout(),
            http,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn map_reqwest(&self, err: reqwest::Error) -> TimeSeriesError {
        if err.is_timeout() {
            TimeSeriesError::Timeout(self.timeout)
        } else {
            TimeSeriesError::Transport(err)
        }
    }
}

/// Sensor sources are written as integers by the MQTT bridge; anything else stays a string.
pub(crate) fn address_param(source_address: &str) -> Value {
    match source_address.trim().parse::<i64>() {
        Ok(numeric) => Value::from(numeric),
        Err(_) => Value::from(source_address),
    }
}

#[async_trait]
impl TimeSeriesReader for InfluxSqlReader {
    async fn query(
        &self,
        source_address: &str,
        window: Duration,
    ) -> Result<Vec<Reading>, TimeSeriesError> {
        let sql = build_query(&self.measurement, window)?;
        let url = format!("{}/api/v3/query_sql", self.base_url);
        let body = json!({
            "db": self.database,
            "q": sql,
            "params": { "source_address": address_param(source_address) },
            "format": "json",
        });

        let mut request = self.http.post(&url).timeout(self.timeout).json(&body);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await.map_err(|err| self.map_reqwest(err))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TimeSeriesError::Status { status, body });
        }
        let rows: Vec<Value> = resp.json().await.map_err(|err| self.map_reqwest(err))?;
        let readings = shape_rows(source_address, rows)?;
        tracing::debug!(
            source_address,
            window_secs = window.as_secs(),
            count = readings.len(),
            "time-series window fetched"
        );
        Ok(readings)
    }
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn build_query(measurement: &str, window: Duration) -> Result<String, TimeSeriesError> {
    if !is_identifier(measurement) {
        return Err(TimeSeriesError::InvalidQuery(format!(
            "measurement {measurement:?} is not a plain identifier"
        )));
    }
    let window_secs = window.as_secs().max(1);
    Ok(format!(
        "SELECT time, data_temperature, data_humidity, source_address \
         FROM \"{measurement}\" \
         WHERE source_address = $source_address \
         AND time >= now() - INTERVAL '{window_secs} seconds' \
         AND data_temperature IS NOT NULL \
         ORDER BY time DESC"
    ))
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Drops rows without a temperature and orders newest first; equal times fall back to
/// temperature so identical input always yields identical output.
pub(crate) fn shape_rows(
    source_address: &str,
    rows: Vec<Value>,
) -> Result<Vec<Reading>, TimeSeriesError> {
    let mut readings = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let Some(object) = row.as_object() else {
            return Err(TimeSeriesError::MalformedRow {
                index,
                reason: "row is not an object".to_string(),
            });
        };
        let temperature = match object.get("data_temperature") {
            None | Some(Value::Null) => continue,
            Some(value) => value.as_f64().ok_or_else(|| TimeSeriesError::MalformedRow {
                index,
                reason: format!("data_temperature is not numeric: {value}"),
            })?,
        };
        let time = object
            .get("time")
            .and_then(Value::as_str)
            .and_then(parse_time)
            .ok_or_else(|| TimeSeriesError::MalformedRow {
                index,
                reason: "missing or unparseable time".to_string(),
            })?;
        let humidity = object.get("data_humidity").and_then(Value::as_f64);
        let source = match object.get("source_address") {
            Some(Value::String(value)) => value.clone(),
            Some(Value::Number(value)) => value.to_string(),
            _ => source_address.to_string(),
        };
        readings.push(Reading {
            source_address: source,
            time,
            temperature,
            humidity,
        });
    }
    readings.sort_by(|a, b| {
        b.time
            .cmp(&a.time)
            .then_with(|| b.temperature.partial_cmp(&a.temperature).unwrap_or(Ordering::Equal))
    });
    Ok(readings)
}
