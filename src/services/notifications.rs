use crate::config::SmtpConfig;
use crate::error::{CatalogError, NotificationError};
use crate::models::{OwnerUser, ProfileKind, SensorSnapshot};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use sqlx::PgPool;
use std::collections::HashSet;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotificationError>;
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotificationError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|err| NotificationError::Address {
            address: address.to_string(),
            reason: err.to_string(),
        })
}

/// Pooled SMTP transport shared by every unit in the process.
#[derive(Clone)]
pub struct SmtpSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSink {
    pub fn new(config: &SmtpConfig, from: &str) -> Result<Self, NotificationError> {
        let from = parse_mailbox(from)?;
        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            // Plain relay, e.g. a local MTA or a test catcher.
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl NotificationSink for SmtpSink {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotificationError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(&message.to)?)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(message.html_body.clone())?;
        self.transport.send(email).await?;
        Ok(())
    }
}

/// Used when no SMTP host is configured: the alert only reaches the logs.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotificationError> {
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            body_len = message.html_body.len(),
            "smtp not configured; alert logged instead of sent"
        );
        Ok(())
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Alert for a Risk verdict. The verdict message is backend HTML and is embedded as-is;
/// catalog text is escaped.
pub fn compose_alert(
    profile: ProfileKind,
    sensor: &SensorSnapshot,
    verdict_message: &str,
    recipient: &OwnerUser,
) -> OutboundMessage {
    let subject = format!(
        "[{}] Temperature alert for sensor {}",
        profile.as_str(),
        sensor.name
    );
    let html_body = format!(
        "<p>Hello {user},</p>\
         <p>The <b>{profile}</b> analysis flagged sensor <b>{name}</b> (#{id}).</p>\
         {verdict}",
        user = escape_html(&recipient.username),
        profile = profile.as_str(),
        name = escape_html(&sensor.name),
        id = sensor.id,
        verdict = verdict_message,
    );
    OutboundMessage {
        to: recipient.email.clone(),
        subject,
        html_body,
    }
}

/// At-most-once record of sent alerts.
#[async_trait]
pub trait NotificationLedger: Send + Sync {
    /// `true` when the key was not yet recorded and now is.
    async fn try_claim(&self, key: &str) -> Result<bool, CatalogError>;

    async fn release(&self, key: &str) -> Result<(), CatalogError>;
}

#[derive(Debug, Clone)]
pub struct PgLedger {
    db: PgPool,
}

impl PgLedger {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotificationLedger for PgLedger {
    async fn try_claim(&self, key: &str) -> Result<bool, CatalogError> {
        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO notification_ledger (dedupe_key, created_at)
            VALUES ($1, now())
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING dedupe_key
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(inserted.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), CatalogError> {
        sqlx::query("DELETE FROM notification_ledger WHERE dedupe_key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    keys: Mutex<HashSet<String>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationLedger for MemoryLedger {
    async fn try_claim(&self, key: &str) -> Result<bool, CatalogError> {
        Ok(self.keys.lock().await.insert(key.to_string()))
    }

    async fn release(&self, key: &str) -> Result<(), CatalogError> {
        self.keys.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drop_schema, integration_database_url, setup_test_pool};
    use anyhow::Result;

    fn sensor() -> SensorSnapshot {
        SensorSnapshot {
            id: 12,
            name: "Kid's <room>".to_string(),
            source_address: Some("1961532156".to_string()),
            workspace_id: 1,
        }
    }

    fn owner() -> OwnerUser {
        OwnerUser {
            id: 4,
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
        }
    }

    #[test]
    fn alert_names_profile_and_carries_verdict() {
        let message = compose_alert(
            ProfileKind::Sleep,
            &sensor(),
            "<p>Temperature trending <b>low</b>.</p>",
            &owner(),
        );
        assert_eq!(message.to, "alice@example.com");
        assert!(message.subject.contains("sleep"));
        assert!(message
            .html_body
            .contains("<p>Temperature trending <b>low</b>.</p>"));
        assert!(message.html_body.contains("Kid&#39;s &lt;room&gt;"));
        assert!(message.html_body.contains("#12"));
    }

    #[tokio::test]
    async fn smtp_sink_rejects_bad_sender() {
        let config = SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            username: None,
            password: None,
            starttls: false,
        };
        assert!(matches!(
            SmtpSink::new(&config, "not an address"),
            Err(NotificationError::Address { .. })
        ));
        assert!(SmtpSink::new(&config, "alerts@example.com").is_ok());
    }

    #[tokio::test]
    async fn memory_ledger_claims_once_until_released() -> Result<()> {
        let ledger = MemoryLedger::new();
        assert!(ledger.try_claim("notify:sleep:2026-10-19:12").await?);
        assert!(!ledger.try_claim("notify:sleep:2026-10-19:12").await?);
        assert!(ledger.try_claim("notify:work:2026-10-19:12").await?);
        ledger.release("notify:sleep:2026-10-19:12").await?;
        assert!(ledger.try_claim("notify:sleep:2026-10-19:12").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_pg_ledger_claims_once_until_released() -> Result<()> {
        let Some(database_url) = integration_database_url() else {
            return Ok(());
        };
        let schema = format!("monitor_ledger_test_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let ledger = PgLedger::new(pool.clone());
        let key = "notify:sleep:2026-10-19:12";

        assert!(ledger.try_claim(key).await?);
        assert!(!ledger.try_claim(key).await?);
        assert!(ledger.try_claim("notify:work:2026-10-19:12").await?);
        ledger.release(key).await?;
        // Releasing an absent key is a no-op.
        ledger.release("notify:sleep:2026-10-18:12").await?;
        assert!(ledger.try_claim(key).await?);

        let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM notification_ledger")
            .fetch_one(&pool)
            .await?;
        assert_eq!(rows, 2);

        pool.close().await;
        drop_schema(&database_url, &schema).await?;
        Ok(())
    }

    #[tokio::test]
    async fn log_sink_accepts_everything() -> Result<()> {
        let message = compose_alert(ProfileKind::Work, &sensor(), "<p>x</p>", &owner());
        LogSink.send(&message).await?;
        Ok(())
    }
}
