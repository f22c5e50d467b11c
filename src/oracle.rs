//! Advisory classification oracle.
//!
//! The detector can consult an external model to re-score ambiguous
//! fragment boundaries. The oracle is strictly advisory: heuristic parse
//! success is authoritative, the call is bounded by a timeout, and any
//! failure degrades to heuristics-only detection.
//!
//! Providers:
//! - **[`DisabledOracle`]** — returns no verdicts; the default.
//! - **[`OllamaOracle`]** — asks a local Ollama instance's `/api/chat`
//!   endpoint to label spans, expecting a JSON response.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::OracleConfig;
use crate::models::ShapeKind;

/// One span classification returned by an oracle. Line numbers are 1-based.
#[derive(Debug, Clone)]
pub struct SpanVerdict {
    pub start_line: usize,
    pub end_line: usize,
    pub kind: ShapeKind,
    pub confidence: f64,
}

/// A text-classification oracle: text in, ranked span verdicts out.
#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Classify structured-data spans in `text`. Implementations must keep
    /// latency bounded; callers additionally wrap this in a timeout.
    async fn classify(&self, text: &str) -> Result<Vec<SpanVerdict>>;
}

/// Instantiate the oracle named by the configuration.
pub fn create_oracle(config: &OracleConfig) -> Result<Box<dyn ClassificationOracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledOracle)),
        "ollama" => Ok(Box::new(OllamaOracle::new(config))),
        other => bail!("Unknown oracle provider: '{}'. Must be disabled or ollama.", other),
    }
}

// ============ Disabled ============

/// No-op oracle used when `oracle.provider = "disabled"`.
pub struct DisabledOracle;

#[async_trait]
impl ClassificationOracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn classify(&self, _text: &str) -> Result<Vec<SpanVerdict>> {
        Ok(Vec::new())
    }
}

// ============ Ollama ============

const SYSTEM_PROMPT: &str = "You are a data shape detector. Analyze the given text and identify \
spans that contain JSON, delimited tabular data, markup tables, or generic XML. Return only a \
JSON object of the form {\"fragments\": [{\"type\": \"json\"|\"tabular\"|\"markup-table\"|\"xml\", \
\"start_line\": N, \"end_line\": N, \"confidence\": 0.0-1.0}]}. Be precise with line numbers.";

/// Oracle backed by a local Ollama instance.
pub struct OllamaOracle {
    base_url: String,
    model: String,
    timeout: Duration,
    max_chars: usize,
}

impl OllamaOracle {
    pub fn new(config: &OracleConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_chars: config.max_chars,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct VerdictEnvelope {
    #[serde(default)]
    fragments: Vec<RawVerdict>,
}

#[derive(Deserialize)]
struct RawVerdict {
    #[serde(rename = "type")]
    kind: String,
    start_line: usize,
    end_line: usize,
    #[serde(default = "default_verdict_confidence")]
    confidence: f64,
}

fn default_verdict_confidence() -> f64 {
    0.75
}

#[async_trait]
impl ClassificationOracle for OllamaOracle {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn classify(&self, text: &str) -> Result<Vec<SpanVerdict>> {
        let truncated = truncate_at_char_boundary(text, self.max_chars);

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": format!(
                    "Identify all structured-data spans in this text:\n\n{}\n\nReturn only valid JSON.",
                    truncated
                )},
            ],
        });

        let resp = client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .context("oracle request failed")?;

        if !resp.status().is_success() {
            bail!("oracle returned HTTP {}", resp.status());
        }

        let chat: ChatResponse = resp.json().await.context("invalid oracle response body")?;
        let cleaned = strip_code_fences(&chat.message.content);
        let envelope: VerdictEnvelope =
            serde_json::from_str(cleaned).context("oracle emitted invalid verdict JSON")?;

        Ok(envelope
            .fragments
            .into_iter()
            .filter_map(|raw| {
                ShapeKind::from_str_opt(&raw.kind).map(|kind| SpanVerdict {
                    start_line: raw.start_line,
                    end_line: raw.end_line,
                    kind,
                    confidence: raw.confidence.clamp(0.0, 1.0),
                })
            })
            .collect())
    }
}

/// Models often wrap JSON in Markdown fences; peel them off.
fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn truncate_at_char_boundary(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
