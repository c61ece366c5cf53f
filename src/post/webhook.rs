use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Hard ceiling per message, under the platform's 2000-char limit with
/// headroom for formatting.
pub const MESSAGE_LIMIT: usize = 1900;

const SLICE_DELAY: Duration = Duration::from_millis(500);
const PARAGRAPH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PostError {
    #[error("webhook request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for PostError {
    fn from(e: reqwest::Error) -> Self {
        PostError::Transport(e.to_string())
    }
}

/// Split a summary into non-empty paragraphs on blank lines.
pub fn split_paragraphs(summary: &str) -> Vec<&str> {
    summary
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Hard-slice an oversized paragraph into pieces of at most `limit`
/// bytes, never splitting inside a character.
pub fn hard_slice(paragraph: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in paragraph.chars() {
        if current.len() + ch.len_utf8() > limit {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Posts session recaps to a Discord-style webhook, one paragraph per
/// message inside a per-session thread.
pub struct WebhookPoster {
    http: Client,
}

impl Default for WebhookPoster {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookPoster {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    /// Post the summary: create a thread named after the session date,
    /// then send each paragraph with a fixed delay to respect rate
    /// limits. Falls back to posting on the base webhook if thread
    /// creation fails.
    pub async fn post_summary(
        &self,
        webhook_url: &str,
        summary: &str,
        title_date: &str,
    ) -> Result<(), PostError> {
        let title = format!("{} Session Recap", title_date);

        let thread_response = self
            .http
            .post(format!("{}?wait=true", webhook_url))
            .json(&json!({
                "content": format!("# {}", title),
                "thread_name": title,
            }))
            .send()
            .await?;

        let target_url = if matches!(thread_response.status().as_u16(), 200 | 201 | 204) {
            let body: serde_json::Value = thread_response.json().await.unwrap_or_default();
            match body.get("id").and_then(serde_json::Value::as_str) {
                Some(thread_id) => format!("{}?thread_id={}", webhook_url, thread_id),
                None => webhook_url.to_string(),
            }
        } else {
            warn!(
                "Thread creation failed (status {}); posting to base webhook",
                thread_response.status()
            );
            webhook_url.to_string()
        };

        let mut sent = 0usize;
        for paragraph in split_paragraphs(summary) {
            if paragraph.len() > MESSAGE_LIMIT {
                for piece in hard_slice(paragraph, MESSAGE_LIMIT) {
                    self.send_message(&target_url, &piece).await?;
                    sent += 1;
                    tokio::time::sleep(SLICE_DELAY).await;
                }
            } else {
                self.send_message(&target_url, paragraph).await?;
                sent += 1;
                tokio::time::sleep(PARAGRAPH_DELAY).await;
            }
        }

        info!("Posted {} webhook messages", sent);
        Ok(())
    }

    async fn send_message(&self, url: &str, content: &str) -> Result<(), PostError> {
        self.http
            .post(url)
            .json(&json!({ "content": content }))
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_split_on_blank_lines_and_skip_empties() {
        let summary = "first\n\n\n\nsecond part\nstill second\n\n  \n\nthird";
        assert_eq!(
            split_paragraphs(summary),
            vec!["first", "second part\nstill second", "third"]
        );
    }

    #[test]
    fn short_paragraph_is_one_piece() {
        assert_eq!(hard_slice("hello", 1900), vec!["hello".to_string()]);
    }

    #[test]
    fn oversized_paragraph_slices_at_limit() {
        let long = "x".repeat(4000);
        let pieces = hard_slice(&long, 1900);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), 1900);
        assert_eq!(pieces[1].len(), 1900);
        assert_eq!(pieces[2].len(), 200);
    }

    #[test]
    fn slicing_never_splits_a_character() {
        // Multi-byte characters straddling the limit stay whole.
        let long: String = "é".repeat(1000); // 2 bytes each
        let pieces = hard_slice(&long, 15);
        for piece in &pieces {
            assert!(piece.len() <= 15);
            assert!(std::str::from_utf8(piece.as_bytes()).is_ok());
        }
        let rejoined: String = pieces.concat();
        assert_eq!(rejoined, long);
    }
}
