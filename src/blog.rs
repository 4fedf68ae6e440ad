//! Voice blog posting: speech-to-text, then the blog relay.
//!
//! Posting is fire-and-forget. The state machine hands over the recording
//! and moves on; success and failure only show up in the logs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::config::BlogConfig;
use crate::error::{Error, Result};

pub trait Publisher: Send + Sync {
    /// Transcribe and post `recording` in the background.
    fn publish(&self, recording: PathBuf);
}

pub struct BlogPublisher {
    inner: Arc<BlogClient>,
}

struct BlogClient {
    client: Client,
    config: BlogConfig,
}

impl BlogPublisher {
    pub fn new(config: &BlogConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.post_timeout_secs))
            .build()?;
        Ok(Self {
            inner: Arc::new(BlogClient {
                client,
                config: config.clone(),
            }),
        })
    }
}

impl Publisher for BlogPublisher {
    fn publish(&self, recording: PathBuf) {
        let inner = Arc::clone(&self.inner);
        // Detached: nothing waits on the outcome.
        tokio::spawn(async move {
            let t0 = Instant::now();
            match inner.transcribe_and_post(recording).await {
                Ok(()) => info!("Blog post succeeded ({}ms)", t0.elapsed().as_millis()),
                Err(e) => warn!("Blog post failed: {e}"),
            }
        });
    }
}

impl BlogClient {
    async fn transcribe_and_post(&self, recording: PathBuf) -> Result<()> {
        let text = self.transcribe(&recording).await?;
        if text.trim().is_empty() {
            return Err(Error::Posting("transcription is empty".into()));
        }
        info!("Transcribed blog entry: {} chars", text.chars().count());
        self.post(&text).await
    }

    async fn transcribe(&self, recording: &std::path::Path) -> Result<String> {
        let key = std::env::var(&self.config.api_key_env).map_err(|_| {
            Error::Posting(format!("{} is not set", self.config.api_key_env))
        })?;

        let audio = tokio::fs::read(recording).await?;
        let file_name = recording
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blog_input.wav")
            .to_string();
        let part = Part::bytes(audio)
            .file_name(file_name)
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.config.transcribe_model.clone())
            .text("language", self.config.language.clone());

        let resp = self
            .client
            .post(&self.config.transcribe_url)
            .bearer_auth(key)
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Posting(format!(
                "transcription returned {}",
                resp.status()
            )));
        }

        let data = resp.json::<serde_json::Value>().await?;
        Ok(data["text"].as_str().unwrap_or("").trim().to_string())
    }

    async fn post(&self, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.config.post_url)
            .json(&post_body(text, Utc::now()))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Posting(format!("blog relay returned {}", resp.status())))
        }
    }
}

fn post_body(text: &str, now: DateTime<Utc>) -> serde_json::Value {
    json!({
        "text": text,
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn relay_payload_has_text_and_utc_timestamp() {
        let now = Utc.with_ymd_and_hms(2025, 12, 18, 9, 21, 0).unwrap();
        let body = post_body("今日は晴れ", now);
        assert_eq!(body["text"], "今日は晴れ");
        assert_eq!(body["timestamp"], "2025-12-18T09:21:00.000Z");
    }
}
