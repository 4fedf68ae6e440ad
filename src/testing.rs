//! Fakes for the hardware and network seams, shared by the unit tests.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::blog::Publisher;
use crate::content::{FanMessage, Library, ListKind, MessageSource};
use crate::error::{Error, Result};
use crate::interrupt::CuePlayer;
use crate::playback::{AudioSink, PausedChannels, PlayOutcome, Source};
use crate::power::PowerControl;
use crate::recorder::{Capture, CaptureDevice};
use crate::speech::SpeechCache;
use crate::volume::Mixer;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `cond` for up to two seconds.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Records what the queue plays. A holding sink keeps every item playing
/// until it is stopped or [`FakeSink::release`] is called.
#[derive(Default)]
pub struct FakeSink {
    hold: AtomicBool,
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    played: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    pauses: AtomicUsize,
    resumed: Mutex<Vec<PausedChannels>>,
}

impl FakeSink {
    pub fn holding() -> Self {
        let sink = Self::default();
        sink.hold.store(true, Ordering::SeqCst);
        sink
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    pub fn fail_on(&self, label: &str) {
        guard(&self.failing).insert(label.to_string());
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<String> {
        guard(&self.played).clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumed(&self) -> Vec<PausedChannels> {
        guard(&self.resumed).clone()
    }
}

impl AudioSink for FakeSink {
    fn play(&self, source: &Source, stop: &AtomicBool) -> PlayOutcome {
        let label = source.to_string();
        guard(&self.played).push(label.clone());
        self.started.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        while self.hold.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if stop.load(Ordering::SeqCst) {
            PlayOutcome::Stopped
        } else if guard(&self.failing).contains(&label) {
            PlayOutcome::Failed(Error::Audio(format!("cannot play {label}")))
        } else {
            PlayOutcome::Finished
        }
    }

    fn halt(&self) {}

    fn pause(&self) -> PausedChannels {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        PausedChannels {
            decoded: self.active.load(Ordering::SeqCst) > 0,
            stream: false,
        }
    }

    fn resume(&self, paused: PausedChannels) {
        guard(&self.resumed).push(paused);
    }
}

/// Hardware mixer that remembers every level written. A stalled mixer
/// blocks writes until the stall is lifted.
pub struct FakeMixer {
    current: Mutex<u8>,
    writes: Mutex<Vec<u8>>,
    failing: AtomicBool,
    stall: AtomicBool,
    stalled: AtomicBool,
}

impl FakeMixer {
    pub fn new(level: u8) -> Self {
        Self {
            current: Mutex::new(level),
            writes: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> u8 {
        *guard(&self.current)
    }

    pub fn writes(&self) -> Vec<u8> {
        guard(&self.writes).clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// True while a write is blocked on the stall.
    pub fn stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

impl Mixer for FakeMixer {
    fn write(&self, percent: u8) -> Result<()> {
        while self.stall.load(Ordering::SeqCst) {
            self.stalled.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
        }
        self.stalled.store(false, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Mixer("mixer unavailable".into()));
        }
        *guard(&self.current) = percent;
        guard(&self.writes).push(percent);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLibrary {
    requests: Mutex<Vec<ListKind>>,
    prepared: Mutex<Vec<String>>,
}

impl FakeLibrary {
    pub fn requests(&self) -> Vec<ListKind> {
        guard(&self.requests).clone()
    }

    pub fn prepared(&self) -> Vec<String> {
        guard(&self.prepared).clone()
    }
}

impl Library for FakeLibrary {
    fn request(&self, kind: ListKind) {
        guard(&self.requests).push(kind);
    }

    fn prepare_message_audio(&self, message: FanMessage) {
        guard(&self.prepared).push(message.id());
    }
}

/// Captures that only finish when told to.
#[derive(Default)]
pub struct FakeCaptureDevice {
    finished: Arc<AtomicBool>,
    fail_start: AtomicBool,
    fail_finish: Arc<AtomicBool>,
}

impl FakeCaptureDevice {
    /// Make the running capture report that it hit its duration cap.
    pub fn finish_capture(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }
}

impl CaptureDevice for FakeCaptureDevice {
    fn begin(&self, path: &Path) -> Result<Box<dyn Capture>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Recording("no microphone".into()));
        }
        self.finished.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            path: path.to_path_buf(),
            finished: Arc::clone(&self.finished),
            fail_finish: Arc::clone(&self.fail_finish),
        }))
    }
}

pub struct FakeCapture {
    path: PathBuf,
    finished: Arc<AtomicBool>,
    fail_finish: Arc<AtomicBool>,
}

impl fmt::Debug for FakeCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeCapture").field("path", &self.path).finish()
    }
}

impl Capture for FakeCapture {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn finish(&mut self) -> Result<PathBuf> {
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(Error::Recording("no samples captured".into()));
        }
        Ok(self.path.clone())
    }
}

#[derive(Default)]
pub struct FakePublisher {
    published: Mutex<Vec<PathBuf>>,
}

impl FakePublisher {
    pub fn published(&self) -> Vec<PathBuf> {
        guard(&self.published).clone()
    }
}

impl Publisher for FakePublisher {
    fn publish(&self, recording: PathBuf) {
        guard(&self.published).push(recording);
    }
}

#[derive(Default)]
pub struct FakePower {
    reboots: AtomicUsize,
}

impl FakePower {
    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }
}

impl PowerControl for FakePower {
    fn reboot(&self) {
        self.reboots.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cue player that records paths and the mixer level heard while playing.
/// A held player blocks inside `play` until [`FakeCuePlayer::release`].
pub struct FakeCuePlayer {
    mixer: Arc<FakeMixer>,
    played: Mutex<Vec<(PathBuf, u8)>>,
    failing: AtomicBool,
    hold: AtomicBool,
}

impl FakeCuePlayer {
    pub fn new(mixer: Arc<FakeMixer>) -> Self {
        Self {
            mixer,
            played: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            hold: AtomicBool::new(false),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    pub fn played(&self) -> Vec<(PathBuf, u8)> {
        guard(&self.played).clone()
    }
}

impl CuePlayer for FakeCuePlayer {
    fn play(&self, path: &Path) -> Result<()> {
        guard(&self.played).push((path.to_path_buf(), self.mixer.current()));
        while self.hold.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Audio("aplay exited with 1".into()));
        }
        Ok(())
    }
}

pub struct FakeMessageSource {
    messages: Mutex<Vec<FanMessage>>,
    forced: AtomicBool,
}

impl FakeMessageSource {
    pub fn new(messages: Vec<FanMessage>) -> Self {
        Self {
            messages: Mutex::new(messages),
            forced: AtomicBool::new(false),
        }
    }

    pub fn set(&self, messages: Vec<FanMessage>) {
        *guard(&self.messages) = messages;
    }

    /// True once a fetch asked to bypass the cache.
    pub fn forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for FakeMessageSource {
    async fn fan_messages(&self, force: bool) -> Vec<FanMessage> {
        if force {
            self.forced.store(true, Ordering::SeqCst);
        }
        guard(&self.messages).clone()
    }
}

#[derive(Default)]
pub struct FakeSpeechCache {
    prepared: Mutex<Vec<String>>,
}

impl FakeSpeechCache {
    pub fn prepared(&self) -> Vec<String> {
        guard(&self.prepared).clone()
    }
}

#[async_trait]
impl SpeechCache for FakeSpeechCache {
    async fn ensure_message_audio(&self, message: &FanMessage) -> Result<()> {
        guard(&self.prepared).push(message.id());
        Ok(())
    }
}
