//! Configuration management for knob-panel.
//!
//! Loads config from YAML files in standard locations. Every section falls
//! back to the values the panel hardware was tuned with.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

fn base_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join("knob-panel")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Substring the control device name must contain.
    pub name_contains: String,
    /// Substring that disqualifies a device (combo keyboard/mouse dongles).
    pub name_excludes: String,
    /// Seconds between discovery attempts while no device is present.
    pub rediscover_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name_contains: "Keyboard".into(),
            name_excludes: "Mouse".into(),
            rediscover_secs: 10,
        }
    }
}

/// evdev key names for each physical control.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub knob_cw: String,
    pub knob_ccw: String,
    pub knob_press: String,
    pub back: String,
    pub volume_down: String,
    pub aux: String,
    pub volume_up: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            knob_cw: "KEY_VOLUMEUP".into(),
            knob_ccw: "KEY_VOLUMEDOWN".into(),
            knob_press: "KEY_MUTE".into(),
            back: "KEY_UP".into(),
            volume_down: "KEY_LEFT".into(),
            aux: "KEY_DOWN".into(),
            volume_up: "KEY_RIGHT".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub tick_ms: u64,
    /// Raw encoder ticks per menu step.
    pub knob_threshold: i32,
    pub press_debounce_ms: u64,
    /// Lockout applied to presses after a timeout-driven return to the main menu.
    pub timeout_lockout_ms: u64,
    pub reboot_hold_secs: f64,
    /// Holding the aux button also raises the volume.
    pub aux_raises_volume: bool,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            knob_threshold: 3,
            press_debounce_ms: 500,
            timeout_lockout_ms: 2000,
            reboot_hold_secs: 5.0,
            aux_raises_volume: true,
        }
    }
}

impl ControlsConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// One speaker configuration to try at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputProfile {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Pre-rendered UI clips (`menu_0.wav`, `kettei.wav`, ...).
    pub audio_dir: PathBuf,
    /// ALSA card number of the speaker.
    pub speaker_card: String,
    /// Pause between two queued items.
    pub gap_ms: u64,
    /// Waiting items kept besides the active one.
    pub queue_capacity: usize,
    /// External player used for remote streams.
    pub stream_player: String,
    /// External player used by the priority interrupt path.
    pub cue_player: String,
    pub output_profiles: Vec<OutputProfile>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            audio_dir: base_dir().join("audio"),
            speaker_card: "2".into(),
            gap_ms: 200,
            queue_capacity: 2,
            stream_player: "ffplay".into(),
            cue_player: "aplay".into(),
            output_profiles: vec![
                OutputProfile {
                    sample_rate: 48000,
                    channels: 2,
                    buffer_size: 1024,
                },
                OutputProfile {
                    sample_rate: 44100,
                    channels: 2,
                    buffer_size: 2048,
                },
            ],
        }
    }
}

impl AudioConfig {
    pub fn alsa_device(&self) -> String {
        format!("hw:{},0", self.speaker_card)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub card: String,
    pub control: String,
    pub initial: u8,
    pub min: u8,
    pub max: u8,
    pub step: u8,
    pub repeat_ms: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            card: "2".into(),
            control: "PCM".into(),
            initial: 70,
            min: 30,
            max: 100,
            step: 5,
            repeat_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: u32,
    /// Preferred input device name substring; default input when unset.
    pub device_name: Option<String>,
    pub max_duration_secs: f64,
    /// Audio discarded at the start of a capture (covers the start prompt).
    pub lead_in_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_size: 1024,
            device_name: None,
            max_duration_secs: 60.0,
            lead_in_ms: 1300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlogConfig {
    pub ready_timeout_secs: u64,
    pub confirm_timeout_secs: u64,
    pub recording_path: PathBuf,
    pub transcribe_url: String,
    pub transcribe_model: String,
    pub language: String,
    /// Environment variable holding the transcription API key.
    pub api_key_env: String,
    pub post_url: String,
    pub post_timeout_secs: u64,
}

impl Default for BlogConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 180,
            confirm_timeout_secs: 20,
            recording_path: base_dir().join("blog_input.wav"),
            transcribe_url: "https://api.openai.com/v1/audio/transcriptions".into(),
            transcribe_model: "whisper-1".into(),
            language: "ja".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            post_url: "https://alexa-blog-poster.onrender.com".into(),
            post_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub messages_url: String,
    pub filelist_url: String,
    pub story_base_url: String,
    /// Fan message cache: `messages.json`, `names/`, `messages/`.
    pub cache_dir: PathBuf,
    /// Story title clips, one `<title>.wav` per story.
    pub titles_dir: PathBuf,
    pub birds_file: PathBuf,
    pub bird_names_dir: PathBuf,
    pub bird_songs_dir: PathBuf,
    pub fetch_timeout_secs: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        let base = base_dir();
        Self {
            messages_url: "https://script.google.com/macros/s/AKfycbwfFiNLr4OAI1aqcn6wdDk_Y9tlTRCxOVNzYkf3XJUqpoeG8GJj9qRJqBWNY1wPZ0uKpg/exec"
                .into(),
            filelist_url: "https://raw.githubusercontent.com/HisakoJP/mukashimukashi/main/filelist.txt"
                .into(),
            story_base_url: "https://HisakoJP.github.io/mukashimukashi/".into(),
            cache_dir: base.join("cache/fan_messages"),
            titles_dir: base.join("mukashimukashi/titles"),
            birds_file: base.join("bird_songs.json"),
            bird_names_dir: base.join("audio/bird_names"),
            bird_songs_dir: base.join("audio/bird_songs"),
            fetch_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Synthesis endpoint returning raw signed 16-bit little-endian PCM.
    pub url: String,
    pub voice: String,
    pub sample_rate: u32,
    pub timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8767/synthesize".into(),
            voice: "Takumi".into(),
            sample_rate: 16000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub poll_interval_secs: i64,
    pub reminder_hours: Vec<u32>,
    /// How many times the arrival and reminder clips are spoken.
    pub announce_repeats: u32,
    pub state_file: PathBuf,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_start_hour: 7,
            window_end_hour: 18,
            poll_interval_secs: 600,
            reminder_hours: vec![8, 12, 16, 18],
            announce_repeats: 1,
            state_file: base_dir().join("notification_state.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Hardware level used while a directional cue plays.
    pub boost_volume: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".into(),
            port: 5000,
            boost_volume: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub keys: KeyConfig,
    pub controls: ControlsConfig,
    pub audio: AudioConfig,
    pub volume: VolumeConfig,
    pub recording: RecordingConfig,
    pub blog: BlogConfig,
    pub content: ContentConfig,
    pub speech: SpeechConfig,
    pub notifications: NotificationConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/knob-panel/config.yaml
    /// 3. /etc/knob-panel/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/knob-panel/config.yaml")),
                Some(PathBuf::from("/etc/knob-panel/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_tuned_defaults() {
        let config = Config::parse(
            "controls:\n  knob_threshold: 4\nvolume:\n  card: \"1\"\napi:\n  port: 8080\n",
        )
        .unwrap();

        assert_eq!(config.controls.knob_threshold, 4);
        assert_eq!(config.controls.press_debounce_ms, 500);
        assert_eq!(config.controls.timeout_lockout_ms, 2000);
        assert_eq!(config.volume.card, "1");
        assert_eq!(config.volume.step, 5);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.blog.confirm_timeout_secs, 20);
        assert_eq!(config.notifications.reminder_hours, vec![8, 12, 16, 18]);
    }

    #[test]
    fn empty_document_is_default() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.keys.knob_press, "KEY_MUTE");
        assert_eq!(config.audio.queue_capacity, 2);
        assert_eq!(config.audio.alsa_device(), "hw:2,0");
    }

    #[test]
    fn fan_messages_work_without_a_content_section() {
        let config = Config::parse("volume:\n  initial: 50\n").unwrap();
        assert!(config
            .content
            .messages_url
            .starts_with("https://script.google.com/macros/s/"));

        let blanked = Config::parse("content:\n  messages_url: \"\"\n").unwrap();
        assert!(blanked.content.messages_url.is_empty());
        assert!(blanked.content.filelist_url.ends_with("filelist.txt"));
    }
}
