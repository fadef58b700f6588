use crate::error::{BackendError, CatalogError, NotificationError, TimeSeriesError};
use crate::models::{OwnerUser, ProfileKind, Reading, SensorSnapshot};
use crate::services::analysis_backend::{AnalysisBackend, Assessment, Verdict};
use crate::services::catalog::RelationalCatalog;
use crate::services::notifications::{NotificationSink, OutboundMessage};
use crate::services::timeseries::TimeSeriesReader;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub(crate) fn sensor(id: i32, name: &str, source_address: Option<&str>) -> SensorSnapshot {
    SensorSnapshot {
        id,
        name: name.to_string(),
        source_address: source_address.map(str::to_string),
        workspace_id: 1,
    }
}

pub(crate) fn owner(id: i32, email: &str) -> OwnerUser {
    OwnerUser {
        id,
        username: format!("user{id}"),
        email: email.to_string(),
    }
}

pub(crate) fn reading(source_address: &str, time: DateTime<Utc>, temperature: f64) -> Reading {
    Reading {
        source_address: source_address.to_string(),
        time,
        temperature,
        humidity: None,
    }
}

#[derive(Default)]
pub(crate) struct MemoryCatalog {
    pub sensors: HashMap<ProfileKind, Vec<SensorSnapshot>>,
    pub owners: HashMap<i32, OwnerUser>,
    pub unavailable: AtomicBool,
}

#[async_trait]
impl RelationalCatalog for MemoryCatalog {
    async fn sensors_for_profile(
        &self,
        profile: ProfileKind,
    ) -> Result<Vec<SensorSnapshot>, CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut sensors = self.sensors.get(&profile).cloned().unwrap_or_default();
        sensors.sort_by_key(|sensor| sensor.id);
        Ok(sensors)
    }

    async fn user_for_sensor(&self, sensor_id: i32) -> Result<Option<OwnerUser>, CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self.owners.get(&sensor_id).cloned())
    }
}

/// Fixed readings per source address; listed addresses fail like an unreachable store.
#[derive(Default)]
pub(crate) struct StaticReader {
    pub readings: HashMap<String, Vec<Reading>>,
    pub failing: HashSet<String>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl TimeSeriesReader for StaticReader {
    async fn query(
        &self,
        source_address: &str,
        _window: Duration,
    ) -> Result<Vec<Reading>, TimeSeriesError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(source_address) {
            return Err(TimeSeriesError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self
            .readings
            .get(source_address)
            .cloned()
            .unwrap_or_default())
    }
}

/// Answers by the source address on the first summary line; unknown sources get `default`.
/// A `None` assessment simulates a timeout.
pub(crate) struct ScriptedBackend {
    pub default: Option<Assessment>,
    pub by_source: HashMap<String, Option<Assessment>>,
    pub calls: AtomicUsize,
    pub summaries: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn always(assessment: Option<Assessment>) -> Self {
        Self {
            default: assessment,
            by_source: HashMap::new(),
            calls: AtomicUsize::new(0),
            summaries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    async fn analyze(&self, profile: ProfileKind, summary: &str) -> Result<Verdict, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut summaries) = self.summaries.lock() {
            summaries.push(summary.to_string());
        }
        let source = summary.split(" - ").next().unwrap_or_default();
        let assessment = self
            .by_source
            .get(source)
            .copied()
            .unwrap_or(self.default);
        match assessment {
            Some(assessment) => Ok(Verdict {
                assessment,
                message: format!("<p>Temperature trending low ({profile})</p>"),
            }),
            None => Err(BackendError::Timeout(Duration::from_secs(30))),
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotificationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Address {
                address: message.to.clone(),
                reason: "mailbox unavailable".to_string(),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        Ok(())
    }
}

pub(crate) struct CapturedRequest {
    pub head: String,
    pub body: String,
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n").map(|pos| pos + 4)
}

/// One-shot HTTP server on an ephemeral port. Returns its base URL and the captured request.
pub(crate) async fn serve_once(
    status: u16,
    body: &str,
) -> Result<(String, JoinHandle<Result<CapturedRequest>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let response_body = body.to_string();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                anyhow::bail!("connection closed before request headers");
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_header_end(&buf) {
                break end;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < head_end + content_length {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let request_body = String::from_utf8_lossy(&buf[head_end..]).to_string();

        let reason = if status < 400 { "OK" } else { "Error" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            response_body.len(),
            response_body
        );
        socket.write_all(response.as_bytes()).await?;
        let _ = socket.shutdown().await;
        Ok(CapturedRequest {
            head,
            body: request_body,
        })
    });
    Ok((format!("http://{addr}"), handle))
}

/// Accepts connections and never answers.
pub(crate) async fn serve_silent() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    Ok(format!("http://{addr}"))
}

/// Opt-in Postgres tests: `MONITOR_INTEGRATION_TEST=1` plus `MONITOR_TEST_DATABASE_URL`.
pub(crate) fn integration_database_url() -> Option<String> {
    if std::env::var("MONITOR_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    std::env::var("MONITOR_TEST_DATABASE_URL").ok()
}

/// Pool pinned to its own schema, with the dispatcher tables applied.
pub(crate) async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;
    crate::db::ensure_dispatch_schema(&pool).await?;
    Ok(pool)
}

pub(crate) async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin_pool)
        .await;
    Ok(())
}
