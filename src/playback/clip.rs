//! Pre-rendered UI utterances, loaded into memory at startup.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

/// Number of entries in the main menu; one `menu_{i}.wav` clip each.
pub const MENU_CLIPS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Clip {
    /// Name of main menu entry `i`.
    Menu(u8),
    Decided,
    Back,
    Returning,
    Beep,
    NowPlaying,
    Reboot,
    PreparingAudio,
    RecordingStart,
    BlogReady,
    BlogConfirm,
    BlogPosted,
    BlogCancel,
    BlogTimeout,
    FanMessageArrival,
    FanMessageReminder,
}

impl Clip {
    const FIXED: [Clip; 15] = [
        Clip::Decided,
        Clip::Back,
        Clip::Returning,
        Clip::Beep,
        Clip::NowPlaying,
        Clip::Reboot,
        Clip::PreparingAudio,
        Clip::RecordingStart,
        Clip::BlogReady,
        Clip::BlogConfirm,
        Clip::BlogPosted,
        Clip::BlogCancel,
        Clip::BlogTimeout,
        Clip::FanMessageArrival,
        Clip::FanMessageReminder,
    ];

    pub fn all() -> impl Iterator<Item = Clip> {
        (0..MENU_CLIPS).map(Clip::Menu).chain(Self::FIXED)
    }

    pub fn file_name(&self) -> String {
        let stem = match self {
            Clip::Menu(i) => return format!("menu_{i}.wav"),
            Clip::Decided => "kettei",
            Clip::Back => "modoru",
            Clip::Returning => "modorimasu",
            Clip::Beep => "beep",
            Clip::NowPlaying => "saisei",
            Clip::Reboot => "reboot",
            Clip::PreparingAudio => "preparing_audio",
            Clip::RecordingStart => "recording_start",
            Clip::BlogReady => "blog_ready",
            Clip::BlogConfirm => "blog_confirm",
            Clip::BlogPosted => "blog_posted",
            Clip::BlogCancel => "blog_cancel",
            Clip::BlogTimeout => "blog_timeout",
            Clip::FanMessageArrival => "fan_message_arrival",
            Clip::FanMessageReminder => "fan_message_reminder",
        };
        format!("{stem}.wav")
    }
}

impl fmt::Display for Clip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.file_name();
        f.write_str(name.trim_end_matches(".wav"))
    }
}

/// Encoded clip bytes keyed by clip. Missing files are skipped with a warning
/// and surface later as a failed (silent) playback.
#[derive(Debug, Clone, Default)]
pub struct ClipBank {
    clips: HashMap<Clip, Arc<[u8]>>,
}

impl ClipBank {
    pub fn load(audio_dir: &Path) -> Self {
        let mut clips = HashMap::new();
        for clip in Clip::all() {
            let path = audio_dir.join(clip.file_name());
            match std::fs::read(&path) {
                Ok(bytes) => {
                    clips.insert(clip, Arc::from(bytes));
                }
                Err(e) => warn!("Clip {} not loaded from {}: {e}", clip, path.display()),
            }
        }
        debug!("Clip directory: {}", audio_dir.display());
        Self { clips }
    }

    pub fn get(&self, clip: Clip) -> Option<Arc<[u8]>> {
        self.clips.get(&clip).cloned()
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_names_match_audio_assets() {
        assert_eq!(Clip::Menu(3).file_name(), "menu_3.wav");
        assert_eq!(Clip::Decided.file_name(), "kettei.wav");
        assert_eq!(Clip::Returning.to_string(), "modorimasu");
        assert_eq!(Clip::all().count(), 20);
    }

    #[test]
    fn load_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("beep.wav"), b"RIFF").unwrap();
        std::fs::write(dir.path().join("menu_0.wav"), b"RIFF").unwrap();

        let bank = ClipBank::load(dir.path());
        assert_eq!(bank.len(), 2);
        assert!(bank.get(Clip::Beep).is_some());
        assert!(bank.get(Clip::Back).is_none());
    }
}
