//! Content behind the sub-menus: fan messages, mukashimukashi stories and
//! bird songs.
//!
//! Fetch failures never reach the control core; they are logged and yield
//! an empty list.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ContentConfig;
use crate::error::{Error, Result};
use crate::machine::Signal;
use crate::speech::SpeechCache;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanMessage {
    pub timestamp: String,
    pub name: String,
    #[serde(default)]
    pub message: String,
}

impl FanMessage {
    /// `timestamp_name` key. Lexical order follows recency.
    pub fn id(&self) -> String {
        composite_id(&self.timestamp, &self.name)
    }

    pub fn sent_at(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.timestamp)
    }

    /// Spoken menu label, e.g. "12月18日、花子さん".
    pub fn name_text(&self) -> String {
        match self.sent_at() {
            Some(at) => format!("{}、{}さん", at.format("%m月%d日"), self.name),
            None => format!("{}さん", self.name),
        }
    }
}

pub fn composite_id(timestamp: &str, name: &str) -> String {
    let ts: String = timestamp
        .replace(".000", "")
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | 'T' | 'Z' | '/' | ' '))
        .collect();
    format!("{ts}_{name}")
}

/// `YYYY/MM/DD HH:MM:SS` or ISO-8601. Naive times are taken as written,
/// offsets are normalized to UTC.
pub fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    if ts.contains('/') {
        return NaiveDateTime::parse_from_str(ts, "%Y/%m/%d %H:%M:%S").ok();
    }
    if ts.contains('T') || ts.contains('Z') {
        return DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.naive_utc())
            .or_else(|_| NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok();
    }
    None
}

/// Newest first; unparseable timestamps sort last.
pub fn sort_newest_first(messages: &mut [FanMessage]) {
    messages.sort_by_key(|m| Reverse(m.sent_at()));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Story {
    pub file_name: String,
    pub url: String,
}

impl Story {
    pub fn new(base: &Url, file_name: &str) -> Option<Self> {
        let url = base.join(file_name).ok()?;
        Some(Self {
            file_name: file_name.to_string(),
            url: url.to_string(),
        })
    }

    pub fn title(&self) -> &str {
        Path::new(&self.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BirdSong {
    pub name: String,
    #[serde(default)]
    pub memo: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub location: String,
    pub filename: String,
}

/// On-disk locations of cached and pre-rendered content audio.
#[derive(Debug, Clone)]
pub struct ContentPaths {
    pub cache_dir: PathBuf,
    pub titles_dir: PathBuf,
    pub bird_names_dir: PathBuf,
    pub bird_songs_dir: PathBuf,
}

impl ContentPaths {
    pub fn from_config(config: &ContentConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            titles_dir: config.titles_dir.clone(),
            bird_names_dir: config.bird_names_dir.clone(),
            bird_songs_dir: config.bird_songs_dir.clone(),
        }
    }

    pub fn message_name(&self, message: &FanMessage) -> PathBuf {
        self.cache_dir
            .join("names")
            .join(format!("{}.wav", message.id()))
    }

    pub fn message_content(&self, message: &FanMessage) -> PathBuf {
        self.cache_dir
            .join("messages")
            .join(format!("{}.wav", message.id()))
    }

    fn messages_json(&self) -> PathBuf {
        self.cache_dir.join("messages.json")
    }

    pub fn story_title(&self, story: &Story) -> PathBuf {
        self.titles_dir.join(format!("{}.wav", story.title()))
    }

    pub fn bird_name(&self, bird: &BirdSong) -> PathBuf {
        self.bird_names_dir.join(format!("{}.wav", bird.name))
    }

    pub fn bird_song(&self, bird: &BirdSong) -> PathBuf {
        self.bird_songs_dir.join(&bird.filename)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    FanMessages,
    Stories,
    BirdSongs,
}

/// A loaded sub-menu list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    FanMessages(Vec<FanMessage>),
    Stories(Vec<Story>),
    BirdSongs(Vec<BirdSong>),
}

impl Listing {
    pub fn kind(&self) -> ListKind {
        match self {
            Listing::FanMessages(_) => ListKind::FanMessages,
            Listing::Stories(_) => ListKind::Stories,
            Listing::BirdSongs(_) => ListKind::BirdSongs,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Listing::FanMessages(items) => items.len(),
            Listing::Stories(items) => items.len(),
            Listing::BirdSongs(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of the fan message list.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Newest first. `force` bypasses and rewrites the on-disk cache.
    async fn fan_messages(&self, force: bool) -> Vec<FanMessage>;
}

/// Background loading for the state machine. Results come back as
/// [`Signal::Loaded`] on the control loop.
pub trait Library: Send + Sync {
    fn request(&self, kind: ListKind);

    /// Generate missing name/content audio for `message`.
    fn prepare_message_audio(&self, message: FanMessage);
}

pub struct RemoteContent {
    client: Client,
    config: ContentConfig,
    paths: ContentPaths,
}

impl RemoteContent {
    pub fn new(config: &ContentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            paths: ContentPaths::from_config(config),
        })
    }

    async fn fetch_messages(&self) -> Result<Vec<FanMessage>> {
        if self.config.messages_url.is_empty() {
            return Err(Error::Config("content.messages_url is not set".into()));
        }
        let messages = self
            .client
            .get(&self.config.messages_url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<FanMessage>>()
            .await?;
        info!("Fetched {} fan messages", messages.len());
        Ok(messages)
    }

    fn read_cache(&self) -> Option<Vec<FanMessage>> {
        let path = self.paths.messages_json();
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(messages) => Some(messages),
            Err(e) => {
                warn!("Ignoring corrupt {}: {e}", path.display());
                None
            }
        }
    }

    fn write_cache(&self, messages: &[FanMessage]) -> Result<()> {
        let path = self.paths.messages_json();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(messages)?)?;
        Ok(())
    }

    pub async fn stories(&self) -> Vec<Story> {
        match self.fetch_stories().await {
            Ok(stories) => {
                info!("Loaded {} stories", stories.len());
                stories
            }
            Err(e) => {
                warn!("Failed to fetch story list: {e}");
                Vec::new()
            }
        }
    }

    async fn fetch_stories(&self) -> Result<Vec<Story>> {
        let base = Url::parse(&self.config.story_base_url)
            .map_err(|e| Error::Config(format!("invalid story_base_url: {e}")))?;
        let body = self
            .client
            .get(&self.config.filelist_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_filelist(&base, &body))
    }

    pub fn bird_songs(&self) -> Vec<BirdSong> {
        let path = &self.config.birds_file;
        let parsed = std::fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|contents| Ok(serde_json::from_str::<Vec<BirdSong>>(&contents)?));
        match parsed {
            Ok(birds) => {
                info!("Loaded {} bird songs", birds.len());
                birds
            }
            Err(e) => {
                warn!("Failed to load {}: {e}", path.display());
                Vec::new()
            }
        }
    }
}

/// One file name per line, blank lines skipped.
fn parse_filelist(base: &Url, body: &str) -> Vec<Story> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| Story::new(base, line))
        .collect()
}

#[async_trait]
impl MessageSource for RemoteContent {
    async fn fan_messages(&self, force: bool) -> Vec<FanMessage> {
        let cached = if force { None } else { self.read_cache() };

        let mut messages = match cached {
            Some(messages) => {
                debug!("Loaded {} fan messages from cache", messages.len());
                messages
            }
            None => match self.fetch_messages().await {
                Ok(messages) => {
                    if let Err(e) = self.write_cache(&messages) {
                        warn!("Failed to write message cache: {e}");
                    }
                    messages
                }
                Err(e) => {
                    warn!("Failed to fetch fan messages: {e}");
                    return Vec::new();
                }
            },
        };

        sort_newest_first(&mut messages);
        messages
    }
}

pub struct RemoteLibrary {
    content: Arc<RemoteContent>,
    speech: Arc<dyn SpeechCache>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl RemoteLibrary {
    pub fn new(
        content: Arc<RemoteContent>,
        speech: Arc<dyn SpeechCache>,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        Self {
            content,
            speech,
            signals,
        }
    }
}

impl Library for RemoteLibrary {
    fn request(&self, kind: ListKind) {
        let content = Arc::clone(&self.content);
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let listing = match kind {
                ListKind::FanMessages => Listing::FanMessages(content.fan_messages(false).await),
                ListKind::Stories => Listing::Stories(content.stories().await),
                ListKind::BirdSongs => Listing::BirdSongs(content.bird_songs()),
            };
            let _ = signals.send(Signal::Loaded(listing));
        });
    }

    fn prepare_message_audio(&self, message: FanMessage) {
        let speech = Arc::clone(&self.speech);
        tokio::spawn(async move {
            if let Err(e) = speech.ensure_message_audio(&message).await {
                warn!("Failed to prepare audio for {}: {e}", message.id());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(timestamp: &str, name: &str) -> FanMessage {
        FanMessage {
            timestamp: timestamp.into(),
            name: name.into(),
            message: String::new(),
        }
    }

    #[test]
    fn composite_id_strips_separators() {
        assert_eq!(
            composite_id("2025/12/18 18:21:00", "hanako"),
            "20251218182100_hanako"
        );
        assert_eq!(
            composite_id("2025-12-18T18:21:00.000Z", "taro"),
            "20251218182100_taro"
        );
    }

    #[test]
    fn both_timestamp_formats_parse() {
        let slash = parse_timestamp("2025/12/18 18:21:00").unwrap();
        let iso = parse_timestamp("2025-12-18T18:21:00.000Z").unwrap();
        assert_eq!(slash, iso);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn newest_first_with_unparseable_last() {
        let mut messages = vec![
            message("garbage", "c"),
            message("2025/01/02 09:00:00", "a"),
            message("2025-03-01T10:00:00Z", "b"),
        ];
        sort_newest_first(&mut messages);
        let names: Vec<_> = messages.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn name_text_carries_the_date() {
        assert_eq!(
            message("2025/12/08 18:21:00", "花子").name_text(),
            "12月08日、花子さん"
        );
        assert_eq!(message("?", "花子").name_text(), "花子さん");
    }

    #[test]
    fn filelist_builds_encoded_stream_urls() {
        let base = Url::parse("https://example.github.io/mukashimukashi/").unwrap();
        let stories = parse_filelist(&base, "ももたろう.mp3\n\n  kaguya hime.mp3 \n");

        assert_eq!(stories.len(), 2);
        assert_eq!(stories[0].title(), "ももたろう");
        assert!(stories[0]
            .url
            .starts_with("https://example.github.io/mukashimukashi/%E3%82%82"));
        assert_eq!(
            stories[1].url,
            "https://example.github.io/mukashimukashi/kaguya%20hime.mp3"
        );
    }

    #[test]
    fn paths_follow_cache_layout() {
        let paths = ContentPaths {
            cache_dir: PathBuf::from("/cache"),
            titles_dir: PathBuf::from("/titles"),
            bird_names_dir: PathBuf::from("/birds/names"),
            bird_songs_dir: PathBuf::from("/birds/songs"),
        };
        let m = message("2025/12/18 18:21:00", "hanako");
        assert_eq!(
            paths.message_name(&m),
            PathBuf::from("/cache/names/20251218182100_hanako.wav")
        );
        assert_eq!(
            paths.message_content(&m),
            PathBuf::from("/cache/messages/20251218182100_hanako.wav")
        );
    }

    #[tokio::test]
    async fn cached_messages_are_served_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContentConfig {
            messages_url: String::new(),
            cache_dir: dir.path().to_path_buf(),
            ..ContentConfig::default()
        };
        std::fs::write(
            dir.path().join("messages.json"),
            r#"[{"timestamp":"2025/01/01 08:00:00","name":"a","message":"x"},
                {"timestamp":"2025/02/01 08:00:00","name":"b","message":"y"}]"#,
        )
        .unwrap();

        let content = RemoteContent::new(&config).unwrap();
        let messages = content.fan_messages(false).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].name, "b");

        // Forced refresh has no URL configured: empty, never an error.
        assert!(content.fan_messages(true).await.is_empty());
    }
}
