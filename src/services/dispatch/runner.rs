use super::queue::DispatchClient;
use super::types::{ClaimedUnit, DispatchUnit, UnitFailure};
use crate::config::MonitorConfig;
use crate::error::QueueError;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Executes one unit. `Ok` carries the short status string stored on the unit.
#[async_trait]
pub trait UnitHandler: Send + Sync {
    async fn handle(&self, unit: DispatchUnit) -> Result<String, UnitFailure>;
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub lease_timeout: Duration,
}

impl DispatcherOptions {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: config.poll_interval(),
            retry_backoff: config.retry_backoff(),
            lease_timeout: config.lease_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Completed,
    Retried,
    Failed,
    /// Lease recovered before this attempt finished; another claim owns the unit.
    Superseded,
}

impl DrainSummary {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Completed => self.completed += 1,
            Settlement::Retried => self.retried += 1,
            Settlement::Failed => self.failed += 1,
            Settlement::Superseded => {}
        }
    }
}

pub struct Dispatcher {
    client: DispatchClient,
    handler: Arc<dyn UnitHandler>,
    semaphore: Arc<Semaphore>,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(
        client: DispatchClient,
        handler: Arc<dyn UnitHandler>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            client,
            handler,
            semaphore: Arc::new(Semaphore::new(options.concurrency.max(1))),
            options,
        }
    }

    pub fn client(&self) -> &DispatchClient {
        &self.client
    }

    /// Consume loop: polls the queue, runs up to `concurrency` units at once and periodically
    /// returns expired leases to the pending state.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let lease_check_every = (self.options.lease_timeout / 4).max(Duration::from_secs(15));
            let mut last_lease_check: Option<Instant> = None;
            tracing::info!(
                concurrency = self.options.concurrency,
                poll_interval_ms = self.options.poll_interval.as_millis() as u64,
                "dispatch consumer started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }

                let lease_due = last_lease_check
                    .map(|at| at.elapsed() >= lease_check_every)
                    .unwrap_or(true);
                if lease_due {
                    match self.client.queue().requeue_stale(self.options.lease_timeout).await {
                        Ok(recovery) => {
                            if recovery.requeued > 0 {
                                tracing::warn!(
                                    count = recovery.requeued,
                                    "requeued dispatch units with expired leases"
                                );
                            }
                            if recovery.failed > 0 {
                                tracing::error!(
                                    count = recovery.failed,
                                    "dispatch units failed after their final lease expired"
                                );
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "dispatch lease recovery failed")
                        }
                    }
                    last_lease_check = Some(Instant::now());
                }

                while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                    let claimed = match self.client.queue().claim_next().await {
                        Ok(claimed) => claimed,
                        Err(err) => {
                            tracing::warn!(error = %err, "dispatch consumer failed to claim unit");
                            drop(permit);
                            break;
                        }
                    };
                    let Some(claimed) = claimed else {
                        drop(permit);
                        break;
                    };

                    let dispatcher = self.clone();
                    let span = unit_span(&claimed);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = dispatcher.run_claimed(claimed).instrument(span).await {
                            tracing::warn!(error = %err, "dispatch unit could not be settled");
                        }
                    });
                }
            }
            tracing::info!("dispatch consumer stopped");
        })
    }

    /// Runs every claimable unit, including children enqueued along the way, until the queue
    /// has nothing left to hand out. Units backed off into the future are left pending.
    pub async fn drain(self: &Arc<Self>) -> Result<DrainSummary, QueueError> {
        let mut summary = DrainSummary::default();
        let mut running = JoinSet::new();
        let mut first_error: Option<QueueError> = None;

        loop {
            if first_error.is_none() {
                while running.len() < self.options.concurrency {
                    match self.client.queue().claim_next().await {
                        Ok(Some(claimed)) => {
                            let dispatcher = self.clone();
                            let span = unit_span(&claimed);
                            running.spawn(
                                async move { dispatcher.run_claimed(claimed).await }.instrument(span),
                            );
                        }
                        Ok(None) => break,
                        Err(err) => {
                            first_error = Some(err);
                            break;
                        }
                    }
                }
            }

            match running.join_next().await {
                None => break,
                Some(Ok(Ok(settlement))) => summary.record(settlement),
                Some(Ok(Err(err))) => {
                    tracing::warn!(error = %err, "dispatch unit could not be settled");
                    first_error.get_or_insert(err);
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "dispatch drain task aborted");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    async fn run_claimed(self: Arc<Self>, claimed: ClaimedUnit) -> Result<Settlement, QueueError> {
        let started = Instant::now();
        let result = match serde_json::from_value::<DispatchUnit>(claimed.payload.clone()) {
            Ok(unit) => {
                let handler = self.handler.clone();
                // Own task so a panic stays inside this unit.
                let execution =
                    tokio::spawn(async move { handler.handle(unit).await }.in_current_span());
                match execution.await {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => Err(UnitFailure::retryable(
                        "handler_panicked",
                        "unit handler panicked",
                    )),
                    Err(err) => Err(UnitFailure::retryable("handler_aborted", err.to_string())),
                }
            }
            Err(err) => Err(UnitFailure::permanent("invalid_payload", err.to_string())),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let queue = self.client.queue();

        let settlement = match result {
            Ok(result_status) => {
                if !queue.mark_completed(&claimed, &result_status).await? {
                    return Ok(superseded(elapsed_ms));
                }
                tracing::info!(result_status = %result_status, elapsed_ms, "dispatch unit completed");
                Settlement::Completed
            }
            Err(failure) if failure.retryable && claimed.attempts < claimed.max_attempts => {
                let delay = retry_delay(self.options.retry_backoff, claimed.attempts);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::hours(1));
                if !queue.mark_failed(&claimed, &failure, Some(retry_at)).await? {
                    return Ok(superseded(elapsed_ms));
                }
                tracing::warn!(
                    code = %failure.code,
                    error = %failure.message,
                    retry_in_secs = delay.as_secs(),
                    elapsed_ms,
                    "dispatch unit failed; will retry"
                );
                Settlement::Retried
            }
            Err(failure) => {
                if !queue.mark_failed(&claimed, &failure, None).await? {
                    return Ok(superseded(elapsed_ms));
                }
                tracing::error!(
                    code = %failure.code,
                    error = %failure.message,
                    elapsed_ms,
                    "dispatch unit failed permanently"
                );
                Settlement::Failed
            }
        };
        Ok(settlement)
    }
}

fn superseded(elapsed_ms: u64) -> Settlement {
    tracing::warn!(elapsed_ms, "dispatch unit lease was recovered mid-run; result dropped");
    Settlement::Superseded
}

fn unit_span(claimed: &ClaimedUnit) -> tracing::Span {
    tracing::info_span!(
        "dispatch_unit",
        unit_id = %claimed.id,
        kind = %claimed.kind,
        attempt = claimed.attempts,
        max_attempts = claimed.max_attempts,
    )
}

/// `base * 2^(attempt - 1)`, capped at one hour.
pub fn retry_delay(base: Duration, attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
    base.saturating_mul(1u32 << exponent).min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfileKind;
    use crate::services::dispatch::{EnqueueRequest, MemoryUnitQueue, UnitQueue, UnitStatus};
    use anyhow::Result;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(concurrency: usize) -> DispatcherOptions {
        DispatcherOptions {
            concurrency,
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::ZERO,
            lease_timeout: Duration::from_secs(600),
        }
    }

    fn run(profile: ProfileKind, hour: u32) -> DispatchUnit {
        DispatchUnit::RunProfile {
            profile,
            scheduled_for: Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap(),
            run_date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        }
    }

    /// Panics on sleep runs, fails work runs at 09:00, succeeds otherwise.
    struct ScriptedHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UnitHandler for ScriptedHandler {
        async fn handle(&self, unit: DispatchUnit) -> Result<String, UnitFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match unit {
                DispatchUnit::RunProfile {
                    profile: ProfileKind::Sleep,
                    ..
                } => panic!("sleep handler exploded"),
                DispatchUnit::RunProfile { scheduled_for, .. }
                    if scheduled_for == Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap() =>
                {
                    Err(UnitFailure::retryable("timeseries_error", "store down"))
                }
                _ => Ok("fanned_out".to_string()),
            }
        }
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let base = Duration::from_secs(30);
        assert_eq!(retry_delay(base, 1), Duration::from_secs(30));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(60));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(120));
        assert_eq!(retry_delay(base, 12), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(Duration::ZERO, 5), Duration::ZERO);
    }

    #[tokio::test]
    async fn drain_isolates_panics_and_bounds_retries() -> Result<()> {
        let queue = Arc::new(MemoryUnitQueue::new());
        let client = DispatchClient::new(queue.clone(), 3);
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(client.clone(), handler.clone(), options(2)));

        client.enqueue(&run(ProfileKind::Sleep, 6)).await?;
        client.enqueue(&run(ProfileKind::Work, 9)).await?;
        client.enqueue(&run(ProfileKind::Work, 15)).await?;

        let summary = dispatcher.drain().await?;
        // Two failing units, three attempts each; one healthy unit.
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.retried, 4);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 7);

        let units = queue.snapshot().await;
        let completed: Vec<_> = units
            .iter()
            .filter(|unit| unit.status == UnitStatus::Completed)
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].result_status.as_deref(), Some("fanned_out"));
        let panicked = units
            .iter()
            .find(|unit| unit.payload["profile"] == "sleep")
            .expect("sleep unit");
        assert_eq!(panicked.status, UnitStatus::Failed);
        assert_eq!(panicked.attempts, 3);
        assert_eq!(
            panicked.last_error.as_ref().map(|err| err.code.as_str()),
            Some("handler_panicked")
        );
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_payload_fails_without_retry() -> Result<()> {
        let queue = Arc::new(MemoryUnitQueue::new());
        let client = DispatchClient::new(queue.clone(), 3);
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(client, handler.clone(), options(1)));

        queue
            .enqueue(EnqueueRequest {
                kind: "run_profile".to_string(),
                payload: serde_json::json!({"kind": "run_profile", "profile": "nap"}),
                dedupe_key: None,
                max_attempts: 3,
            })
            .await?;

        let summary = dispatcher.drain().await?;
        assert_eq!(
            summary,
            DrainSummary {
                completed: 0,
                retried: 0,
                failed: 1
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let units = queue.snapshot().await;
        assert_eq!(
            units[0].last_error.as_ref().map(|err| err.code.as_str()),
            Some("invalid_payload")
        );
        Ok(())
    }

    #[tokio::test]
    async fn consume_loop_runs_units_until_cancelled() -> Result<()> {
        let queue = Arc::new(MemoryUnitQueue::new());
        let client = DispatchClient::new(queue.clone(), 1);
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(client.clone(), handler, options(2)));
        client.enqueue(&run(ProfileKind::Work, 15)).await?;
        client.enqueue(&run(ProfileKind::Work, 16)).await?;

        let cancel = CancellationToken::new();
        let consumer = dispatcher.clone().start(cancel.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let done = queue
                .snapshot()
                .await
                .iter()
                .all(|unit| unit.status == UnitStatus::Completed);
            if done || Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        consumer.await?;

        let units = queue.snapshot().await;
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|unit| unit.status == UnitStatus::Completed));
        Ok(())
    }

    /// Outlives its lease: while running, the unit is recovered and claimed by someone else.
    struct OvertakenHandler {
        queue: Arc<MemoryUnitQueue>,
    }

    #[async_trait]
    impl UnitHandler for OvertakenHandler {
        async fn handle(&self, _unit: DispatchUnit) -> Result<String, UnitFailure> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let recovered = self.queue.requeue_stale(Duration::ZERO).await;
            assert_eq!(recovered.map(|r| r.requeued).ok(), Some(1));
            let reclaimed = self.queue.claim_next().await.ok().flatten();
            assert_eq!(reclaimed.map(|unit| unit.attempts), Some(2));
            Ok("notified".to_string())
        }
    }

    #[tokio::test]
    async fn result_of_an_overtaken_claim_is_dropped() -> Result<()> {
        let queue = Arc::new(MemoryUnitQueue::new());
        let client = DispatchClient::new(queue.clone(), 3);
        let handler = Arc::new(OvertakenHandler {
            queue: queue.clone(),
        });
        let dispatcher = Arc::new(Dispatcher::new(client.clone(), handler, options(1)));
        client.enqueue(&run(ProfileKind::Work, 15)).await?;

        let summary = dispatcher.drain().await?;
        assert_eq!(summary, DrainSummary::default());

        let units = queue.snapshot().await;
        assert_eq!(units[0].status, UnitStatus::Running);
        assert_eq!(units[0].attempts, 2);
        assert!(units[0].result_status.is_none());
        Ok(())
    }
}
