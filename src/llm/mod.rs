//! Multi-provider LLM summarization with usage and cost accounting.
//!
//! One uniform contract over the supported backends: prompt + transcript
//! file in, generated text + normalized usage out. Every external call is
//! recorded as one append-only audit row, success or failure alike.

mod providers;

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

use crate::config::LlmConfig;
use crate::store::{JsonStore, NewLlmCall};

/// Normalized usage for one summarization call.
#[derive(Debug, Clone)]
pub struct LlmUsage {
    pub provider: String,
    pub model: String,
    pub duration_secs: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

/// Generated summary text plus its usage accounting.
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub usage: LlmUsage,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("unknown LLM provider: {0}")]
    UnknownProvider(String),

    #[error("failed to read transcript: {0}")]
    Transcript(String),

    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("{provider} API error (status {status}): {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("failed to record LLM audit row: {0}")]
    Audit(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Transport(e.to_string())
    }
}

/// The closed set of summarization backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Google,
    Anthropic,
    OpenAi,
    Ollama,
}

impl LlmProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "google" => Some(LlmProvider::Google),
            "anthropic" => Some(LlmProvider::Anthropic),
            "openai" => Some(LlmProvider::OpenAi),
            "ollama" => Some(LlmProvider::Ollama),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Google => "Google",
            LlmProvider::Anthropic => "Anthropic",
            LlmProvider::OpenAi => "OpenAI",
            LlmProvider::Ollama => "Ollama",
        }
    }
}

/// Async trait over summarization backends so the worker can run against
/// a stub in tests.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Generate a summary of `transcript` guided by `prompt`. `redact`
    /// strips inline document payloads from the persisted audit row.
    async fn summarize(
        &self,
        prompt: &str,
        transcript: &Path,
        config: &LlmConfig,
        redact: bool,
    ) -> Result<Summary, LlmError>;
}

/// Dollar cost of a call given per-million-token rates. The rates are
/// operator-edited strings; anything unparseable contributes zero rather
/// than failing the call. Rounded to 6 decimal places.
pub fn calculate_cost(
    prompt_tokens: u64,
    completion_tokens: u64,
    input_rate: &str,
    output_rate: &str,
) -> f64 {
    fn parse_rate(raw: &str) -> f64 {
        raw.trim().parse::<f64>().unwrap_or(0.0)
    }

    let cost = prompt_tokens as f64 * parse_rate(input_rate) / 1_000_000.0
        + completion_tokens as f64 * parse_rate(output_rate) / 1_000_000.0;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

/// Seconds formatted the way the recap header reports API time.
pub fn format_api_duration(seconds: f64) -> String {
    format!("{:.3}s", seconds)
}

/// Machine-parsable metadata header prefixed to every generated recap.
/// Field order and labels are a contract with the reporting layer; do not
/// reorder or relabel.
pub fn recap_header(date_label: &str, usage: &LlmUsage) -> String {
    format!(
        "## {} Session Recap\n\n\
         \u{1F916} LLM Provider: `{}`\n\
         \u{1F4CB} Model: `{}`\n\
         \u{231A} API time: `{}`\n\
         \u{1F9FE} Tokens: `{} in | {} out | {} total`\n\n",
        date_label,
        usage.provider,
        usage.model,
        format_api_duration(usage.duration_secs),
        usage.prompt_tokens,
        usage.completion_tokens,
        usage.total_tokens,
    )
}

/// Replace inlined document payloads in a request body with a marker so
/// the audit row stays small. Covers the Google inlineData shape and the
/// OpenAI input_file data URL shape.
pub fn redact_inline_payloads(request: &mut Value) {
    if let Some(contents) = request.get_mut("contents").and_then(Value::as_array_mut) {
        for content in contents {
            if let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) {
                for part in parts {
                    if let Some(inline) = part.get_mut("inlineData") {
                        if let Some(data) = inline.get_mut("data") {
                            *data = Value::String("[TRUNCATED]".to_string());
                        }
                    }
                }
            }
        }
    }

    if let Some(inputs) = request.get_mut("input").and_then(Value::as_array_mut) {
        for input in inputs {
            if let Some(blocks) = input.get_mut("content").and_then(Value::as_array_mut) {
                for block in blocks {
                    if let Some(data) = block.get_mut("file_data") {
                        *data = Value::String("[TRUNCATED]".to_string());
                    }
                }
            }
        }
    }
}

/// Production summarizer: dispatches to the configured provider and
/// records one audit row per call.
pub struct LlmClient {
    http: reqwest::Client,
    store: Arc<JsonStore>,
}

impl LlmClient {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
        }
    }
}

#[async_trait]
impl Summarizer for LlmClient {
    async fn summarize(
        &self,
        prompt: &str,
        transcript: &Path,
        config: &LlmConfig,
        redact: bool,
    ) -> Result<Summary, LlmError> {
        let provider = LlmProvider::from_name(&config.provider)
            .ok_or_else(|| LlmError::UnknownProvider(config.provider.clone()))?;

        info!(
            "Summarizing {} via {} ({})",
            transcript.display(),
            provider.as_str(),
            config.model
        );

        let started = Instant::now();
        let call = match provider {
            LlmProvider::Google => {
                providers::send_google(&self.http, prompt, transcript, config).await?
            }
            LlmProvider::Anthropic => {
                providers::send_anthropic(&self.http, prompt, transcript, config).await?
            }
            LlmProvider::OpenAi => {
                providers::send_openai(&self.http, prompt, transcript, config).await?
            }
            LlmProvider::Ollama => {
                providers::send_ollama(&self.http, prompt, transcript, config).await?
            }
        };
        let duration_secs = started.elapsed().as_secs_f64();

        let cost = calculate_cost(
            call.prompt_tokens,
            call.completion_tokens,
            &config.input_cost,
            &config.output_cost,
        );

        let mut request = call.request;
        if redact {
            redact_inline_payloads(&mut request);
        }

        self.store
            .record_llm_call(NewLlmCall {
                provider: provider.as_str().to_string(),
                model: config.model.clone(),
                prompt_tokens: call.prompt_tokens,
                completion_tokens: call.completion_tokens,
                total_tokens: call.total_tokens,
                cost,
                duration_secs,
                http_status: call.status,
                finish_reason: call.finish_reason.clone(),
                request_json: request.to_string(),
                response_json: call.response.to_string(),
            })
            .map_err(|e| LlmError::Audit(e.to_string()))?;

        if !(200..300).contains(&call.status) {
            error!(
                "{} call failed with status {}",
                provider.as_str(),
                call.status
            );
            return Err(LlmError::Api {
                provider: provider.as_str().to_string(),
                status: call.status,
                body: call.response.to_string(),
            });
        }
        if call.text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        Ok(Summary {
            text: call.text,
            usage: LlmUsage {
                provider: provider.as_str().to_string(),
                model: config.model.clone(),
                duration_secs,
                prompt_tokens: call.prompt_tokens,
                completion_tokens: call.completion_tokens,
                total_tokens: call.total_tokens,
                cost,
            },
        })
    }
}
