// src/llm.rs
//! AI-assisted finding prioritization.
//!
//! A batch of finding summaries goes to a chat-completion backend which
//! returns a JSON array of rankings. The backend sits behind a trait so
//! tests can supply a canned reasoner; the production backend speaks the
//! OpenAI chat completions wire format.

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::config::Settings;
use crate::models::Finding;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("reasoning backend unavailable: {0}")]
    Unavailable(String),
    #[error("unparseable reply from reasoning backend: {0}")]
    InvalidReply(String),
}

/// The slice of a finding the model gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct FindingSummary {
    pub id: i64,
    pub title: String,
    pub severity: String,
    pub vuln_type: Option<String>,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f64>,
    pub affected_url: Option<String>,
}

impl FindingSummary {
    pub fn from_finding(finding: &Finding) -> Self {
        FindingSummary {
            id: finding.id,
            title: finding.title.clone(),
            severity: finding.severity.as_str().to_string(),
            vuln_type: finding.vuln_type.clone(),
            cwe_id: finding.cwe_id.clone(),
            cvss_score: finding.cvss_score,
            affected_url: finding.affected_url.clone(),
        }
    }
}

/// Context about the engagement supplied alongside the findings.
#[derive(Debug, Clone, Serialize, Default)]
pub struct TargetContext {
    pub target_name: String,
    pub root_domains: Vec<String>,
    pub asset_count: i64,
}

/// One ranking produced by the model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Prioritization {
    pub finding_id: i64,
    pub priority_rank: i64,
    #[serde(default)]
    pub likelihood: Option<i64>,
    #[serde(default)]
    pub suggested_steps: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiBackend {
    pub fn new(settings: &Settings, api_key: String) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(settings.llm_timeout)
            .build()
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        Ok(OpenAiBackend {
            client,
            base_url: settings.openai_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: settings.llm_model.clone(),
            temperature: settings.llm_temperature,
        })
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiBackend {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("HTTP {status}: {detail}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidReply(e.to_string()))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidReply("missing message content".to_string()))
    }
}

/// Prioritizes findings through a reasoning backend with retries.
pub struct LlmService {
    backend: Box<dyn ReasoningBackend>,
    max_retries: u32,
    batch_size: usize,
}

const SYSTEM_PROMPT: &str = "You are a penetration testing triage assistant. You rank \
vulnerability findings by real-world exploitability and business impact. Respond with a \
JSON array only, no prose. Each element: {\"finding_id\": int, \"priority_rank\": int \
(1 = most urgent), \"likelihood\": int 0-100, \"suggested_steps\": [string], \
\"reasoning\": string}.";

impl LlmService {
    pub fn new(backend: Box<dyn ReasoningBackend>, settings: &Settings) -> Self {
        LlmService {
            backend,
            max_retries: settings.llm_max_retries,
            batch_size: settings.prioritization_batch,
        }
    }

    /// Construct the production service when an API key is configured.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>, LlmError> {
        match &settings.openai_api_key {
            Some(key) => {
                let backend = OpenAiBackend::new(settings, key.clone())?;
                Ok(Some(LlmService::new(Box::new(backend), settings)))
            }
            None => Ok(None),
        }
    }

    /// Rank a batch of findings. At most `batch_size` summaries are sent;
    /// the most severe findings win the seats.
    pub async fn prioritize(
        &self,
        context: &TargetContext,
        findings: &[Finding],
    ) -> Result<Vec<Prioritization>, LlmError> {
        if findings.is_empty() {
            return Ok(Vec::new());
        }

        let mut ordered: Vec<&Finding> = findings.iter().collect();
        ordered.sort_by(|a, b| b.severity.cmp(&a.severity));
        let summaries: Vec<FindingSummary> = ordered
            .into_iter()
            .take(self.batch_size)
            .map(FindingSummary::from_finding)
            .collect();

        let user = json!({
            "target": context,
            "findings": summaries,
        })
        .to_string();

        let mut last_error = LlmError::Unavailable("no attempts made".to_string());
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_delay(attempt);
                debug!("retrying prioritization, attempt {attempt} after {backoff:?}");
                tokio::time::sleep(backoff).await;
            }

            match self.backend.complete(SYSTEM_PROMPT, &user).await {
                Ok(reply) => match parse_rankings(&reply) {
                    Ok(rankings) => return Ok(rankings),
                    Err(e) => {
                        warn!("discarding unparseable prioritization reply: {e}");
                        last_error = e;
                    }
                },
                Err(e) => {
                    warn!("prioritization attempt {attempt} failed: {e}");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

/// Exponential backoff with jitter, capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).min(30);
    let jitter_ms = rand::thread_rng().gen_range(0..500);
    Duration::from_secs(base) + Duration::from_millis(jitter_ms)
}

/// Parse the model reply, tolerating markdown code fences around the JSON.
fn parse_rankings(reply: &str) -> Result<Vec<Prioritization>, LlmError> {
    let stripped = strip_code_fences(reply);
    serde_json::from_str(stripped).map_err(|e| LlmError::InvalidReply(e.to_string()))
}

fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the optional language tag on the opening fence.
    let inner = match inner.find('\n') {
        Some(idx) => &inner[idx + 1..],
        None => inner,
    };
    inner.trim_end().trim_end_matches("```").trim()
}
