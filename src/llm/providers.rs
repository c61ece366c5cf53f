//! Per-provider request/response translation.
//!
//! Each sender speaks one backend's native HTTP schema and normalizes the
//! result into [`ProviderCall`]. Senders only error on transport or file
//! problems; non-success HTTP statuses come back as a `ProviderCall` so
//! the caller can record the audit row before failing the stage.

use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::path::Path;

use super::LlmError;
use crate::config::LlmConfig;

/// Raw outcome of one provider call, before cost accounting.
pub(super) struct ProviderCall {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub status: u16,
    pub finish_reason: String,
    pub request: Value,
    pub response: Value,
}

async fn read_transcript_bytes(path: &Path) -> Result<Vec<u8>, LlmError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| LlmError::Transcript(format!("{}: {}", path.display(), e)))
}

fn file_basename(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("transcript.txt")
        .to_string()
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

async fn response_to_value(response: reqwest::Response) -> (u16, Value) {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let value = serde_json::from_str(&body).unwrap_or_else(|_| json!({ "error": body }));
    (status, value)
}

/// Gemini `streamGenerateContent`: the transcript rides inline as base64,
/// the response is a list of chunks with usage on the last one. Reasoning
/// ("thoughts") tokens are folded into completion tokens so usage stays
/// comparable across providers.
pub(super) async fn send_google(
    http: &Client,
    prompt: &str,
    transcript: &Path,
    config: &LlmConfig,
) -> Result<ProviderCall, LlmError> {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(read_transcript_bytes(transcript).await?);

    let request = json!({
        "contents": [{
            "parts": [
                {"inlineData": {"mimeType": "text/plain", "data": encoded}},
                {"text": prompt}
            ]
        }]
    });

    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/{}:streamGenerateContent?key={}",
        config.model, config.api_key
    );

    let (status, response) = response_to_value(http.post(&url).json(&request).send().await?).await;

    let last_chunk = match response.as_array() {
        Some(chunks) => chunks.last().cloned().unwrap_or(Value::Null),
        None => response.clone(),
    };
    let meta = last_chunk.get("usageMetadata").cloned().unwrap_or(Value::Null);

    let prompt_tokens = u64_field(&meta, "promptTokenCount");
    let completion_tokens =
        u64_field(&meta, "candidatesTokenCount") + u64_field(&meta, "thoughtsTokenCount");
    let total_tokens = u64_field(&meta, "totalTokenCount");

    let mut text = String::new();
    if let Some(chunks) = response.as_array() {
        for chunk in chunks {
            if let Some(parts) = chunk
                .pointer("/candidates/0/content/parts")
                .and_then(Value::as_array)
            {
                for part in parts {
                    if let Some(piece) = part.get("text").and_then(Value::as_str) {
                        text.push_str(piece);
                    }
                }
            }
        }
    }

    let finish_reason = last_chunk
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();

    Ok(ProviderCall {
        text,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        status,
        finish_reason,
        request,
        response,
    })
}

/// Anthropic: upload the transcript through the Files API, then reference
/// it as a document block in a messages call.
pub(super) async fn send_anthropic(
    http: &Client,
    prompt: &str,
    transcript: &Path,
    config: &LlmConfig,
) -> Result<ProviderCall, LlmError> {
    let bytes = read_transcript_bytes(transcript).await?;

    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(file_basename(transcript))
        .mime_str("text/plain")
        .map_err(|e| LlmError::Transport(e.to_string()))?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let upload = http
        .post("https://api.anthropic.com/v1/files")
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", "2023-06-01")
        .header("anthropic-beta", "files-api-2025-04-14")
        .multipart(form)
        .send()
        .await?;

    let upload_status = upload.status().as_u16();
    let upload_body: Value = upload.json().await.unwrap_or(Value::Null);
    if !matches!(upload_status, 200 | 201) {
        return Err(LlmError::Api {
            provider: "Anthropic".to_string(),
            status: upload_status,
            body: upload_body.to_string(),
        });
    }
    let file_id = upload_body
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let request = json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": prompt},
                {"type": "document", "source": {"type": "file", "file_id": file_id}}
            ]
        }]
    });

    let (status, response) = response_to_value(
        http.post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("anthropic-beta", "files-api-2025-04-14")
            .json(&request)
            .send()
            .await?,
    )
    .await;

    let usage = response.get("usage").cloned().unwrap_or(Value::Null);
    let prompt_tokens = u64_field(&usage, "input_tokens");
    let completion_tokens = u64_field(&usage, "output_tokens");

    let mut text = String::new();
    if let Some(blocks) = response.get("content").and_then(Value::as_array) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(piece) = block.get("text").and_then(Value::as_str) {
                    text.push_str(piece);
                }
            }
        }
    }

    let finish_reason = response
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    Ok(ProviderCall {
        text,
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        status,
        finish_reason,
        request,
        response,
    })
}

/// OpenAI Responses API: the transcript rides inline as a data-URL file
/// block next to the prompt text.
pub(super) async fn send_openai(
    http: &Client,
    prompt: &str,
    transcript: &Path,
    config: &LlmConfig,
) -> Result<ProviderCall, LlmError> {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(read_transcript_bytes(transcript).await?);

    let request = json!({
        "model": config.model,
        "input": [{
            "role": "user",
            "content": [
                {
                    "type": "input_file",
                    "filename": file_basename(transcript),
                    "file_data": format!("data:text/plain;base64,{}", encoded)
                },
                {
                    "type": "input_text",
                    "text": prompt
                }
            ]
        }]
    });

    let (status, response) = response_to_value(
        http.post("https://api.openai.com/v1/responses")
            .bearer_auth(&config.api_key)
            .json(&request)
            .send()
            .await?,
    )
    .await;

    let usage = response.get("usage").cloned().unwrap_or(Value::Null);
    let prompt_tokens = u64_field(&usage, "prompt_tokens");
    let completion_tokens = u64_field(&usage, "completion_tokens");
    let total_tokens = u64_field(&usage, "total_tokens");

    let mut text = response
        .get("output_text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if text.is_empty() {
        text = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }

    let finish_reason = response
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    Ok(ProviderCall {
        text,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        status,
        finish_reason,
        request,
        response,
    })
}

/// Ollama (OpenAI-compatible chat completions): no attachment support, so
/// the transcript is concatenated under the prompt.
pub(super) async fn send_ollama(
    http: &Client,
    prompt: &str,
    transcript: &Path,
    config: &LlmConfig,
) -> Result<ProviderCall, LlmError> {
    let bytes = read_transcript_bytes(transcript).await?;
    let content = String::from_utf8_lossy(&bytes);

    let combined = format!(
        "{}\n\n### {}\n{}",
        prompt,
        file_basename(transcript),
        content
    );

    let request = json!({
        "model": config.model,
        "messages": [{"role": "user", "content": combined}],
        "stream": false
    });

    let url = format!(
        "{}/v1/chat/completions",
        normalize_base_url(&config.ollama_url)
    );

    let (status, response) = response_to_value(http.post(&url).json(&request).send().await?).await;

    let usage = response.get("usage").cloned().unwrap_or(Value::Null);
    let prompt_tokens = u64_field(&usage, "prompt_tokens");
    let completion_tokens = u64_field(&usage, "completion_tokens");
    let total_tokens = u64_field(&usage, "total_tokens");

    let text = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let finish_reason = response
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    Ok(ProviderCall {
        text,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        status,
        finish_reason,
        request,
        response,
    })
}

/// Tolerate operator-entered URLs missing a scheme or carrying trailing
/// slashes.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_scheme_and_loses_trailing_slash() {
        assert_eq!(normalize_base_url("ollama:11434/"), "http://ollama:11434");
        assert_eq!(
            normalize_base_url("https://ollama.local/"),
            "https://ollama.local"
        );
        assert_eq!(
            normalize_base_url("http://localhost:11434"),
            "http://localhost:11434"
        );
    }
}
