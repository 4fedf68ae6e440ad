//! The panel's mode state machine.
//!
//! Owns the current [`Mode`], the knob accumulator, the input gate and the
//! loaded sub-menu lists. Control events, playback completions and loaded
//! lists arrive one at a time from the control loop; time-based transitions
//! are evaluated from its tick.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::blog::Publisher;
use crate::config::Config;
use crate::content::{BirdSong, ContentPaths, FanMessage, Library, ListKind, Listing, Story};
use crate::error::Result;
use crate::input::{Control, ControlEvent, InputGate};
use crate::notifications::{self, SharedScheduler};
use crate::playback::clip::MENU_CLIPS;
use crate::playback::{Clip, PlaybackItem, PlaybackQueue};
use crate::power::PowerControl;
use crate::recorder::{Capture, CaptureDevice};
use crate::volume::{VolumeDirection, VolumeRepeater};

/// Main menu entries, in knob order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuEntry {
    FanMessages,
    Stories,
    BlogPost,
    Line,
    BirdSongs,
}

impl MenuEntry {
    const ALL: [MenuEntry; MENU_CLIPS as usize] = [
        MenuEntry::FanMessages,
        MenuEntry::Stories,
        MenuEntry::BlogPost,
        MenuEntry::Line,
        MenuEntry::BirdSongs,
    ];

    pub fn at(index: usize) -> MenuEntry {
        Self::ALL[index % Self::ALL.len()]
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
pub enum Mode {
    MainMenu { selected: usize },
    FanMessageMenu { index: usize },
    PlayingMessage { index: usize, ticket: u64 },
    StoryMenu { index: usize },
    PlayingStory { index: usize, ticket: u64 },
    BirdSongMenu { index: usize },
    PlayingBirdSong { index: usize, ticket: u64 },
    BlogReady { started_at: Instant },
    BlogRecording { capture: Box<dyn Capture> },
    /// The capture hit its cap and is being written out.
    BlogSaving,
    BlogConfirm { started_at: Instant, recording: PathBuf },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::MainMenu { .. } => "MainMenu",
            Mode::FanMessageMenu { .. } => "FanMessageMenu",
            Mode::PlayingMessage { .. } => "PlayingMessage",
            Mode::StoryMenu { .. } => "StoryMenu",
            Mode::PlayingStory { .. } => "PlayingStory",
            Mode::BirdSongMenu { .. } => "BirdSongMenu",
            Mode::PlayingBirdSong { .. } => "PlayingBirdSong",
            Mode::BlogReady { .. } => "BlogReady",
            Mode::BlogRecording { .. } => "BlogRecording",
            Mode::BlogSaving => "BlogSaving",
            Mode::BlogConfirm { .. } => "BlogConfirm",
        }
    }

    fn main(entry: MenuEntry) -> Mode {
        Mode::MainMenu {
            selected: entry.index(),
        }
    }
}

/// Work completed off the control loop.
#[derive(Debug)]
pub enum Signal {
    /// The item enqueued under this ticket played to its natural end.
    PlaybackDone(u64),
    Loaded(Listing),
    /// A stopped capture has been written out (or failed to be).
    RecordingSaved { result: Result<PathBuf>, then: AfterSave },
}

/// What a saved recording is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSave {
    /// Stopped by the user: post straight away.
    Post,
    /// Stopped at the duration cap: ask first, timing out from `since`.
    Confirm { since: Instant },
}

/// Raw encoder ticks to menu steps.
#[derive(Debug)]
pub struct KnobAccumulator {
    count: i32,
    threshold: i32,
}

impl KnobAccumulator {
    pub fn new(threshold: i32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Returns the step direction once the threshold is reached.
    pub fn push(&mut self, delta: i8) -> Option<i64> {
        self.count += i32::from(delta);
        if self.count.abs() < self.threshold {
            return None;
        }
        let step = i64::from(self.count.signum());
        self.count = 0;
        Some(step)
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Everything the state machine drives.
pub struct Collaborators {
    pub queue: PlaybackQueue,
    pub repeater: VolumeRepeater,
    pub library: Arc<dyn Library>,
    pub capture: Arc<dyn CaptureDevice>,
    pub publisher: Arc<dyn Publisher>,
    pub power: Arc<dyn PowerControl>,
    pub notifications: SharedScheduler,
    pub paths: ContentPaths,
}

struct Timing {
    ready_timeout: Duration,
    confirm_timeout: Duration,
    reboot_hold: Duration,
    aux_raises_volume: bool,
}

pub struct Machine {
    mode: Mode,
    knob: KnobAccumulator,
    gate: InputGate,
    timing: Timing,
    recording_path: PathBuf,
    deps: Collaborators,
    signals: mpsc::UnboundedSender<Signal>,
    messages: Vec<FanMessage>,
    stories: Vec<Story>,
    birds: Vec<BirdSong>,
    pending: Option<ListKind>,
    next_ticket: u64,
    aux_pressed_at: Option<Instant>,
}

impl Machine {
    pub fn new(config: &Config, deps: Collaborators, signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            mode: Mode::MainMenu { selected: 0 },
            knob: KnobAccumulator::new(config.controls.knob_threshold),
            gate: InputGate::new(&config.controls),
            timing: Timing {
                ready_timeout: Duration::from_secs(config.blog.ready_timeout_secs),
                confirm_timeout: Duration::from_secs(config.blog.confirm_timeout_secs),
                reboot_hold: Duration::from_secs_f64(config.controls.reboot_hold_secs),
                aux_raises_volume: config.controls.aux_raises_volume,
            },
            recording_path: config.blog.recording_path.clone(),
            deps,
            signals,
            messages: Vec::new(),
            stories: Vec::new(),
            birds: Vec::new(),
            pending: None,
            next_ticket: 0,
            aux_pressed_at: None,
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Replace the mode, returning the previous one.
    fn transition(&mut self, next: Mode) -> Mode {
        info!("State: {} → {}", self.mode.name(), next.name());
        self.knob.reset();
        mem::replace(&mut self.mode, next)
    }

    fn say(&self, clip: Clip) {
        self.deps.queue.enqueue(PlaybackItem::clip(clip));
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn done(&self, ticket: u64) -> impl FnOnce() + Send + 'static {
        let signals = self.signals.clone();
        move || {
            let _ = signals.send(Signal::PlaybackDone(ticket));
        }
    }

    pub fn handle_event(&mut self, event: ControlEvent) {
        if !self.gate.admit(&event) {
            return;
        }

        match event.control {
            Control::KnobRotate(delta) => self.rotate(delta),
            Control::KnobPress => self.press(event.at),
            Control::BackPress => self.back(),
            Control::VolDownPress => self.deps.repeater.start(VolumeDirection::Down),
            Control::VolUpPress => self.deps.repeater.start(VolumeDirection::Up),
            Control::VolDownRelease | Control::VolUpRelease => {
                self.deps.repeater.stop();
            }
            Control::AuxPress => {
                self.aux_pressed_at = Some(event.at);
                if self.timing.aux_raises_volume {
                    self.deps.repeater.start(VolumeDirection::Up);
                }
            }
            Control::AuxRelease => self.aux_released(event.at),
        }
    }

    fn aux_released(&mut self, at: Instant) {
        if self.timing.aux_raises_volume {
            self.deps.repeater.stop();
        }
        let Some(pressed_at) = self.aux_pressed_at.take() else {
            return;
        };
        let held = at.saturating_duration_since(pressed_at);
        if held >= self.timing.reboot_hold {
            warn!("Aux held for {:.1}s, rebooting", held.as_secs_f64());
            self.deps
                .queue
                .enqueue(PlaybackItem::clip(Clip::Reboot).urgent());
            self.deps.power.reboot();
        } else {
            debug!("Aux released after {:.1}s", held.as_secs_f64());
        }
    }

    fn rotate(&mut self, delta: i8) {
        let len = match self.mode {
            Mode::MainMenu { .. } => usize::from(MENU_CLIPS),
            Mode::FanMessageMenu { .. } => self.messages.len(),
            Mode::StoryMenu { .. } => self.stories.len(),
            Mode::BirdSongMenu { .. } => self.birds.len(),
            _ => {
                self.knob.reset();
                return;
            }
        };
        let Some(step) = self.knob.push(delta) else {
            return;
        };
        if len == 0 {
            return;
        }
        let wrap = |index: usize| (index as i64 + step).rem_euclid(len as i64) as usize;

        match &mut self.mode {
            Mode::MainMenu { selected } => {
                *selected = wrap(*selected);
                let selected = *selected;
                // A list still loading for the old entry is no longer wanted.
                self.pending = None;
                debug!("Menu: {:?}", MenuEntry::at(selected));
                self.say(Clip::Menu(selected as u8));
            }
            Mode::FanMessageMenu { index } => {
                *index = wrap(*index);
                let index = *index;
                self.announce_message(index);
            }
            Mode::StoryMenu { index } => {
                *index = wrap(*index);
                let index = *index;
                self.announce_story(index);
            }
            Mode::BirdSongMenu { index } => {
                *index = wrap(*index);
                let index = *index;
                self.announce_bird(index);
            }
            _ => {}
        }
    }

    fn press(&mut self, at: Instant) {
        match self.mode {
            Mode::MainMenu { selected } => self.decide(MenuEntry::at(selected), at),
            Mode::FanMessageMenu { index } => self.play_message(index),
            Mode::StoryMenu { index } => self.play_story(index),
            Mode::BirdSongMenu { index } => self.play_bird(index),
            Mode::PlayingMessage { index, .. } => {
                self.deps.queue.stop_active();
                self.transition(Mode::FanMessageMenu { index });
            }
            Mode::PlayingStory { index, .. } => {
                self.deps.queue.stop_active();
                self.transition(Mode::StoryMenu { index });
            }
            Mode::PlayingBirdSong { index, .. } => {
                self.deps.queue.stop_active();
                self.transition(Mode::BirdSongMenu { index });
            }
            Mode::BlogReady { .. } => self.start_recording(),
            Mode::BlogRecording { .. } => self.stop_recording_and_post(),
            Mode::BlogSaving => debug!("Recording still saving"),
            Mode::BlogConfirm { .. } => {
                if let Mode::BlogConfirm { recording, .. } =
                    self.transition(Mode::main(MenuEntry::BlogPost))
                {
                    self.say(Clip::BlogPosted);
                    self.deps.publisher.publish(recording);
                }
            }
        }
    }

    fn back(&mut self) {
        match self.mode {
            Mode::MainMenu { .. } => {
                self.pending = None;
                self.say(Clip::Back);
            }
            Mode::FanMessageMenu { .. } => self.back_to_main(MenuEntry::FanMessages),
            Mode::StoryMenu { .. } => self.back_to_main(MenuEntry::Stories),
            Mode::BirdSongMenu { .. } => self.back_to_main(MenuEntry::BirdSongs),
            Mode::PlayingMessage { index, .. } => {
                self.deps.queue.stop_active();
                self.say(Clip::Back);
                self.transition(Mode::FanMessageMenu { index });
            }
            Mode::PlayingStory { index, .. } => {
                self.deps.queue.stop_active();
                self.say(Clip::Back);
                self.transition(Mode::StoryMenu { index });
            }
            Mode::PlayingBirdSong { index, .. } => {
                self.deps.queue.stop_active();
                self.say(Clip::Back);
                self.transition(Mode::BirdSongMenu { index });
            }
            Mode::BlogReady { .. } => {
                self.say(Clip::BlogCancel);
                self.transition(Mode::main(MenuEntry::BlogPost));
                self.say(Clip::Menu(MenuEntry::BlogPost.index() as u8));
            }
            Mode::BlogRecording { .. } => self.stop_recording_and_post(),
            Mode::BlogSaving => debug!("Recording still saving"),
            Mode::BlogConfirm { .. } => {
                self.say(Clip::BlogCancel);
                self.transition(Mode::main(MenuEntry::BlogPost));
            }
        }
    }

    fn back_to_main(&mut self, entry: MenuEntry) {
        self.say(Clip::Back);
        self.transition(Mode::main(entry));
        self.say(Clip::Menu(entry.index() as u8));
    }

    fn decide(&mut self, entry: MenuEntry, at: Instant) {
        info!("Decided: {entry:?}");
        self.say(Clip::Decided);
        match entry {
            MenuEntry::FanMessages => self.request(ListKind::FanMessages),
            MenuEntry::Stories => self.request(ListKind::Stories),
            MenuEntry::BirdSongs => self.request(ListKind::BirdSongs),
            MenuEntry::BlogPost => {
                self.say(Clip::BlogReady);
                self.transition(Mode::BlogReady { started_at: at });
            }
            MenuEntry::Line => debug!("LINE has no action"),
        }
    }

    fn request(&mut self, kind: ListKind) {
        self.pending = Some(kind);
        self.deps.library.request(kind);
    }

    pub fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::PlaybackDone(ticket) => self.playback_done(ticket),
            Signal::Loaded(listing) => self.loaded(listing),
            Signal::RecordingSaved { result, then } => self.recording_saved(result, then),
        }
    }

    fn playback_done(&mut self, done: u64) {
        match self.mode {
            Mode::PlayingMessage { index, ticket } if ticket == done => {
                if let Some(message) = self.messages.get(index) {
                    notifications::lock(&self.deps.notifications).mark_as_played(&message.id());
                }
                self.transition(Mode::FanMessageMenu { index });
            }
            Mode::PlayingStory { index, ticket } if ticket == done => {
                self.transition(Mode::StoryMenu { index });
            }
            Mode::PlayingBirdSong { index, ticket } if ticket == done => {
                self.transition(Mode::BirdSongMenu { index });
            }
            _ => debug!("Ignoring stale completion #{done}"),
        }
    }

    fn loaded(&mut self, listing: Listing) {
        if self.pending != Some(listing.kind()) || !matches!(self.mode, Mode::MainMenu { .. }) {
            debug!("Ignoring unrequested {:?} list", listing.kind());
            return;
        }
        self.pending = None;

        if listing.is_empty() {
            warn!("{:?} list is empty", listing.kind());
            return;
        }

        match listing {
            Listing::FanMessages(messages) => {
                self.messages = messages;
                self.transition(Mode::FanMessageMenu { index: 0 });
                self.announce_message(0);
            }
            Listing::Stories(stories) => {
                self.stories = stories;
                self.transition(Mode::StoryMenu { index: 0 });
                self.announce_story(0);
            }
            Listing::BirdSongs(birds) => {
                self.birds = birds;
                self.transition(Mode::BirdSongMenu { index: 0 });
                self.announce_bird(0);
            }
        }
    }

    /// Play a cached message file, or start filling the cache.
    fn cached_message_audio(&self, index: usize, path: PathBuf) -> Option<PathBuf> {
        if path.exists() {
            return Some(path);
        }
        let message = self.messages.get(index)?;
        info!("Audio for {} missing, preparing", message.id());
        self.say(Clip::PreparingAudio);
        self.deps.library.prepare_message_audio(message.clone());
        None
    }

    fn announce_message(&self, index: usize) {
        let Some(message) = self.messages.get(index) else {
            return;
        };
        info!("[{}/{}] {}", index + 1, self.messages.len(), message.name);
        let path = self.deps.paths.message_name(message);
        if let Some(path) = self.cached_message_audio(index, path) {
            self.deps.queue.enqueue(PlaybackItem::file(path));
        }
    }

    fn announce_story(&self, index: usize) {
        let Some(story) = self.stories.get(index) else {
            return;
        };
        info!("[{}/{}] {}", index + 1, self.stories.len(), story.title());
        self.play_if_present(&self.deps.paths.story_title(story));
    }

    fn announce_bird(&self, index: usize) {
        let Some(bird) = self.birds.get(index) else {
            return;
        };
        info!("[{}/{}] {}", index + 1, self.birds.len(), bird.name);
        self.play_if_present(&self.deps.paths.bird_name(bird));
    }

    fn play_if_present(&self, path: &Path) {
        if path.exists() {
            self.deps.queue.enqueue(PlaybackItem::file(path));
        } else {
            debug!("No audio at {}", path.display());
        }
    }

    fn play_message(&mut self, index: usize) {
        let Some(message) = self.messages.get(index) else {
            return;
        };
        let path = self.deps.paths.message_content(message);
        let Some(path) = self.cached_message_audio(index, path) else {
            return;
        };
        self.say(Clip::NowPlaying);
        let ticket = self.ticket();
        self.deps
            .queue
            .enqueue(PlaybackItem::file(path).on_complete(self.done(ticket)));
        self.transition(Mode::PlayingMessage { index, ticket });
    }

    fn play_story(&mut self, index: usize) {
        let Some(story) = self.stories.get(index) else {
            return;
        };
        let url = story.url.clone();
        self.say(Clip::NowPlaying);
        let ticket = self.ticket();
        self.deps
            .queue
            .enqueue(PlaybackItem::stream(url).on_complete(self.done(ticket)));
        self.transition(Mode::PlayingStory { index, ticket });
    }

    fn play_bird(&mut self, index: usize) {
        let Some(bird) = self.birds.get(index) else {
            return;
        };
        let path = self.deps.paths.bird_song(bird);
        if !path.exists() {
            warn!("Bird song missing: {}", path.display());
            return;
        }
        self.say(Clip::NowPlaying);
        let ticket = self.ticket();
        self.deps
            .queue
            .enqueue(PlaybackItem::file(path).on_complete(self.done(ticket)));
        self.transition(Mode::PlayingBirdSong { index, ticket });
    }

    fn start_recording(&mut self) {
        self.say(Clip::RecordingStart);
        self.say(Clip::Beep);
        match self.deps.capture.begin(&self.recording_path) {
            Ok(capture) => {
                self.transition(Mode::BlogRecording { capture });
            }
            Err(e) => {
                warn!("Failed to start recording: {e}");
                self.say(Clip::BlogCancel);
                self.transition(Mode::main(MenuEntry::BlogPost));
            }
        }
    }

    /// Leave BlogRecording for `next` and write the capture out on the
    /// blocking pool. The outcome comes back as [`Signal::RecordingSaved`].
    fn finish_capture(&mut self, next: Mode, then: AfterSave) {
        if !matches!(self.mode, Mode::BlogRecording { .. }) {
            return;
        }
        let Mode::BlogRecording { mut capture } = self.transition(next) else {
            return;
        };
        let signals = self.signals.clone();
        tokio::task::spawn_blocking(move || {
            let result = capture.finish();
            let _ = signals.send(Signal::RecordingSaved { result, then });
        });
    }

    /// Manual stop goes straight to posting.
    fn stop_recording_and_post(&mut self) {
        self.finish_capture(Mode::main(MenuEntry::BlogPost), AfterSave::Post);
    }

    fn recording_saved(&mut self, result: Result<PathBuf>, then: AfterSave) {
        match then {
            AfterSave::Post => match result {
                Ok(recording) => {
                    self.say(Clip::BlogPosted);
                    self.deps.publisher.publish(recording);
                }
                Err(e) => {
                    warn!("Failed to finish recording: {e}");
                    self.say(Clip::BlogCancel);
                }
            },
            AfterSave::Confirm { since } => {
                if !matches!(self.mode, Mode::BlogSaving) {
                    debug!("Ignoring saved recording outside BlogSaving");
                    return;
                }
                match result {
                    Ok(recording) => {
                        self.say(Clip::BlogConfirm);
                        self.transition(Mode::BlogConfirm {
                            started_at: since,
                            recording,
                        });
                    }
                    Err(e) => {
                        warn!("Failed to finish recording: {e}");
                        self.say(Clip::BlogCancel);
                        self.transition(Mode::main(MenuEntry::BlogPost));
                    }
                }
            }
        }
    }

    /// Evaluate mode timers.
    pub fn tick(&mut self, now: Instant) {
        let elapsed = |since: &Instant| now.saturating_duration_since(*since);
        let due = match &self.mode {
            Mode::BlogReady { started_at } if elapsed(started_at) >= self.timing.ready_timeout => {
                Due::ReadyTimeout
            }
            Mode::BlogRecording { capture } if capture.is_finished() => Due::CaptureFinished,
            Mode::BlogConfirm { started_at, .. }
                if elapsed(started_at) >= self.timing.confirm_timeout =>
            {
                Due::ConfirmTimeout
            }
            _ => return,
        };

        match due {
            Due::ReadyTimeout => {
                info!("Blog ready timed out");
                self.say(Clip::Returning);
                self.transition(Mode::main(MenuEntry::BlogPost));
                self.gate.lock(now);
            }
            Due::CaptureFinished => {
                info!("Recording reached its cap");
                self.finish_capture(Mode::BlogSaving, AfterSave::Confirm { since: now });
            }
            Due::ConfirmTimeout => {
                info!("Blog confirmation timed out, not posting");
                self.say(Clip::BlogTimeout);
                self.transition(Mode::main(MenuEntry::BlogPost));
                self.gate.lock(now);
            }
        }
    }
}

/// Timer that fired on a tick.
enum Due {
    ReadyTimeout,
    CaptureFinished,
    ConfirmTimeout,
}
