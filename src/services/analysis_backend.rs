use crate::config::MonitorConfig;
use crate::error::BackendError;
use crate::models::ProfileKind;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Risk,
    Safe,
}

impl Assessment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Assessment::Risk => "risk",
            Assessment::Safe => "safe",
        }
    }
}

/// Backend decision for one sensor window. `message` is the HTML analysis shown to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub assessment: Assessment,
    pub message: String,
}

impl Verdict {
    pub fn is_risk(&self) -> bool {
        self.assessment == Assessment::Risk
    }
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// One attempt, bounded by the backend's own timeout.
    async fn analyze(&self, profile: ProfileKind, summary: &str) -> Result<Verdict, BackendError>;
}

/// Mistral chat completions.
#[derive(Clone)]
pub struct MistralBackend {
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl MistralBackend {
    pub fn from_config(config: &MonitorConfig, http: reqwest::Client) -> Self {
        Self {
            base_url: config.mistral_url.trim_end_matches('/').to_string(),
            api_key: config.mistral_api_key.clone(),
            model: config.mistral_model.clone(),
            max_tokens: config.backend_max_tokens,
            timeout: config.backend_timeout(),
            http,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn map_reqwest(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else if err.is_decode() {
            BackendError::MalformedResponse(err.to_string())
        } else {
            BackendError::Transport(err)
        }
    }
}

#[async_trait]
impl AnalysisBackend for MistralBackend {
    async fn analyze(&self, profile: ProfileKind, summary: &str) -> Result<Verdict, BackendError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": profile.instruction() },
                { "role": "user", "content": summary },
            ],
        });

        let mut request = self.http.post(&url).timeout(self.timeout).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.map_err(|err| self.map_reqwest(err))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }
        let completion: ChatCompletion = resp.json().await.map_err(|err| self.map_reqwest(err))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BackendError::MalformedResponse("no completion choices".to_string()))?;
        parse_verdict(&content)
    }
}

fn strip_markup(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    for c in line.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            '*' | '`' | '#' | '_' if !in_tag => {}
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// The first non-empty line must read `VERDICT: RISK` or `VERDICT: SAFE` (case and light
/// markup tolerated). Anything else is not a verdict.
pub fn parse_verdict(content: &str) -> Result<Verdict, BackendError> {
    let trimmed = content.trim();
    let mut lines = trimmed.splitn(2, '\n');
    let first = lines.next().unwrap_or_default();
    let rest = lines.next().unwrap_or_default().trim();

    let marker = strip_markup(first).to_ascii_uppercase();
    let Some(value) = marker.strip_prefix("VERDICT") else {
        return Err(BackendError::MalformedResponse(format!(
            "reply does not open with a verdict line: {:?}",
            first.chars().take(80).collect::<String>()
        )));
    };
    let value = value.trim_start_matches(&[':', ' ', '-', '='][..]).trim();
    let assessment = match value {
        "RISK" => Assessment::Risk,
        "SAFE" => Assessment::Safe,
        other => {
            return Err(BackendError::MalformedResponse(format!(
                "unknown verdict {other:?}"
            )))
        }
    };
    let message = if rest.is_empty() {
        format!("<p><b>{}</b></p>", assessment.as_str())
    } else {
        rest.to_string()
    };
    Ok(Verdict {
        assessment,
        message,
    })
}
