use crate::config::MonitorConfig;
use crate::services::analysis_backend::{AnalysisBackend, MistralBackend};
use crate::services::catalog::{PgCatalog, RelationalCatalog};
use crate::services::dispatch::{
    DispatchClient, Dispatcher, DispatcherOptions, UnitQueue,
};
use crate::services::notifications::{
    LogSink, NotificationLedger, NotificationSink, PgLedger, SmtpSink,
};
use crate::services::pipeline::{AnalysisPipeline, MonitorHandler, ProfileFanOut};
use crate::services::timeseries::{InfluxSqlReader, TimeSeriesReader};
use anyhow::{Context, Result};
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

/// Collaborators built once per process and handed out as trait objects.
#[derive(Clone)]
pub struct MonitorServices {
    pub config: MonitorConfig,
    pub db: PgPool,
    pub catalog: Arc<dyn RelationalCatalog>,
    pub reader: Arc<dyn TimeSeriesReader>,
    pub backend: Arc<dyn AnalysisBackend>,
    pub sink: Arc<dyn NotificationSink>,
    pub ledger: Option<Arc<dyn NotificationLedger>>,
}

impl MonitorServices {
    pub fn build(config: MonitorConfig, db: PgPool) -> Result<Self> {
        let http = Client::new();
        let sink: Arc<dyn NotificationSink> = match config.smtp.as_ref() {
            Some(smtp) => Arc::new(
                SmtpSink::new(smtp, &config.mail_from).context("failed to configure smtp sink")?,
            ),
            None => {
                tracing::warn!("MONITOR_SMTP_HOST not set; alerts will only be logged");
                Arc::new(LogSink)
            }
        };
        let ledger: Option<Arc<dyn NotificationLedger>> = if config.notification_dedupe {
            Some(Arc::new(PgLedger::new(db.clone())))
        } else {
            None
        };
        Ok(Self {
            catalog: Arc::new(PgCatalog::new(db.clone())),
            reader: Arc::new(InfluxSqlReader::new(&config, http.clone())),
            backend: Arc::new(MistralBackend::from_config(&config, http.clone())),
            sink,
            ledger,
            db,
            config,
        })
    }

    pub fn client(&self, queue: Arc<dyn UnitQueue>) -> DispatchClient {
        DispatchClient::new(queue, self.config.max_attempts)
    }

    pub fn pipeline(&self) -> AnalysisPipeline {
        let pipeline = AnalysisPipeline::new(
            self.reader.clone(),
            self.catalog.clone(),
            self.backend.clone(),
            self.sink.clone(),
            self.config.window(),
        );
        match self.ledger.clone() {
            Some(ledger) => pipeline.with_ledger(ledger),
            None => pipeline,
        }
    }

    pub fn dispatcher(&self, queue: Arc<dyn UnitQueue>) -> Arc<Dispatcher> {
        let client = self.client(queue);
        let handler = MonitorHandler::new(
            Arc::new(self.pipeline()),
            ProfileFanOut::new(self.catalog.clone(), client.clone()),
        );
        Arc::new(Dispatcher::new(
            client,
            Arc::new(handler),
            DispatcherOptions::from_config(&self.config),
        ))
    }
}
