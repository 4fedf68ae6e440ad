//! Speech synthesis into the fan message audio cache.
//!
//! The synthesis endpoint returns raw signed 16-bit mono PCM. Cache files
//! are written as stereo WAV, which is what the speaker output expects.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::config::SpeechConfig;
use crate::content::{ContentPaths, FanMessage};
use crate::error::{Error, Result};

#[async_trait]
pub trait SpeechCache: Send + Sync {
    /// Generate whichever of the message's name and content audio is missing.
    async fn ensure_message_audio(&self, message: &FanMessage) -> Result<()>;
}

pub struct HttpSpeech {
    client: Client,
    url: String,
    voice: String,
    sample_rate: u32,
    paths: ContentPaths,
}

impl HttpSpeech {
    pub fn new(config: &SpeechConfig, paths: ContentPaths) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            voice: config.voice.clone(),
            sample_rate: config.sample_rate,
            paths,
        })
    }

    /// Text to raw PCM.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let t0 = Instant::now();
        let body = json!({
            "text": text,
            "voice": self.voice,
            "sample_rate": self.sample_rate,
            "format": "pcm",
        });

        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Synthesis(format!(
                "synthesis endpoint returned {}",
                resp.status()
            )));
        }
        let pcm = resp.bytes().await?.to_vec();
        if pcm.is_empty() {
            return Err(Error::Synthesis("empty audio stream".into()));
        }

        debug!(
            "Synthesized {} chars into {} bytes in {}ms",
            text.chars().count(),
            pcm.len(),
            t0.elapsed().as_millis()
        );
        Ok(pcm)
    }

    async fn ensure(&self, text: &str, path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        let pcm = self.synthesize(text).await?;
        write_stereo_wav(path, &pcm, self.sample_rate)?;
        info!("Generated {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl SpeechCache for HttpSpeech {
    async fn ensure_message_audio(&self, message: &FanMessage) -> Result<()> {
        self.ensure(&message.name_text(), &self.paths.message_name(message))
            .await?;
        self.ensure(&message.message, &self.paths.message_content(message))
            .await
    }
}

/// Write mono 16-bit little-endian PCM as a two-channel WAV file.
pub fn write_stereo_wav(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for frame in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([frame[0], frame[1]]);
        writer.write_sample(sample)?;
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
