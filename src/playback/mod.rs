//! Sequential audio playback.
//!
//! All queued audio goes through one worker thread, so at most one item is
//! ever audible from this path. The waiting list is bounded: the oldest
//! waiting item is dropped when a new one arrives at capacity, and urgent
//! items flush everything, including the item currently playing.

pub mod clip;
pub mod speaker;

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
pub use clip::Clip;

/// What to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Short in-memory UI utterance.
    Clip(Clip),
    /// Local audio file, decoded in-process.
    File(PathBuf),
    /// Remote stream, rendered by an external player process.
    Stream(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Clip(clip) => write!(f, "clip:{clip}"),
            Source::File(path) => write!(f, "file:{}", path.display()),
            Source::Stream(url) => write!(f, "stream:{url}"),
        }
    }
}

/// Runs on the worker thread after an item played to its natural end.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

pub struct PlaybackItem {
    pub source: Source,
    pub loops: u32,
    pub on_complete: Option<Completion>,
    pub urgent: bool,
}

impl PlaybackItem {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            loops: 1,
            on_complete: None,
            urgent: false,
        }
    }

    pub fn clip(clip: Clip) -> Self {
        Self::new(Source::Clip(clip))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Source::File(path.into()))
    }

    pub fn stream(url: impl Into<String>) -> Self {
        Self::new(Source::Stream(url.into()))
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Play the source `loops` times back to back. Zero counts as one.
    pub fn looped(mut self, loops: u32) -> Self {
        self.loops = loops.max(1);
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for PlaybackItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackItem")
            .field("source", &self.source)
            .field("loops", &self.loops)
            .field("on_complete", &self.on_complete.is_some())
            .field("urgent", &self.urgent)
            .finish()
    }
}

/// How a single `AudioSink::play` call ended.
#[derive(Debug)]
pub enum PlayOutcome {
    Finished,
    Stopped,
    Failed(Error),
}

/// Output channels paused by `AudioSink::pause`, so exactly those are resumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PausedChannels {
    pub decoded: bool,
    pub stream: bool,
}

impl PausedChannels {
    pub fn any(&self) -> bool {
        self.decoded || self.stream
    }
}

/// The audio device behind the queue.
pub trait AudioSink: Send + Sync + 'static {
    /// Render `source`, blocking until it ends or `stop` is raised.
    fn play(&self, source: &Source, stop: &AtomicBool) -> PlayOutcome;

    /// Silence whatever `play` is rendering right now.
    fn halt(&self);

    fn pause(&self) -> PausedChannels;

    fn resume(&self, paused: PausedChannels);
}

struct ActiveItem {
    label: String,
    stop: Arc<AtomicBool>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PlaybackItem>,
    active: Option<ActiveItem>,
    /// Held by the interrupt path; nothing new starts while set.
    paused: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    sink: Arc<dyn AudioSink>,
    capacity: usize,
    gap: Duration,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the active item and drop everything waiting.
    fn abort(&self, state: &mut QueueState) {
        let dropped = state.waiting.len();
        state.waiting.clear();
        if let Some(active) = &state.active {
            active.stop.store(true, Ordering::SeqCst);
            self.sink.halt();
            debug!("Stopped {} ({dropped} waiting dropped)", active.label);
        }
    }
}

/// Handle to the playback queue. Clones share the same queue and worker.
#[derive(Clone)]
pub struct PlaybackQueue {
    shared: Arc<Shared>,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn AudioSink>, capacity: usize, gap: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wake: Condvar::new(),
                sink,
                capacity: capacity.max(1),
                gap,
            }),
        }
    }

    /// Spawn the dedicated worker thread.
    pub fn start(&self) -> std::io::Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("playback".into())
            .spawn(move || run_worker(shared))
    }

    pub fn enqueue(&self, item: PlaybackItem) {
        let mut state = self.shared.lock_state();
        if state.shutdown {
            debug!("Queue shut down, ignoring {}", item.source);
            return;
        }

        if item.urgent {
            self.shared.abort(&mut state);
            info!("Urgent {} pre-empts playback", item.source);
        } else if state.waiting.len() >= self.shared.capacity {
            if let Some(evicted) = state.waiting.pop_front() {
                debug!("Queue full, evicting {}", evicted.source);
            }
        }

        debug!("Queued {}", item.source);
        state.waiting.push_back(item);
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Terminate the active item and clear the waiting list. The aborted
    /// item's completion callback is not run.
    pub fn stop_active(&self) {
        let mut state = self.shared.lock_state();
        self.shared.abort(&mut state);
    }

    /// Pause whatever is audible and hold the worker until `resume_output`.
    pub fn pause_output(&self) -> PausedChannels {
        let mut state = self.shared.lock_state();
        state.paused = true;
        self.shared.sink.pause()
    }

    /// Release the worker and resume exactly the channels `pause_output`
    /// reported.
    pub fn resume_output(&self, paused: PausedChannels) {
        let mut state = self.shared.lock_state();
        state.paused = false;
        if paused.any() {
            self.shared.sink.resume(paused);
        }
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Abort playback and let the worker exit.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock_state();
        self.shared.abort(&mut state);
        state.shutdown = true;
        drop(state);
        self.shared.wake.notify_all();
    }

    /// True while an item is playing or waiting.
    pub fn is_busy(&self) -> bool {
        let state = self.shared.lock_state();
        state.active.is_some() || !state.waiting.is_empty()
    }

    #[cfg(test)]
    pub fn waiting_len(&self) -> usize {
        self.shared.lock_state().waiting.len()
    }

    #[cfg(test)]
    pub fn active_label(&self) -> Option<String> {
        self.shared
            .lock_state()
            .active
            .as_ref()
            .map(|active| active.label.clone())
    }

    #[cfg(test)]
    pub fn waiting_sources(&self) -> Vec<Source> {
        self.shared
            .lock_state()
            .waiting
            .iter()
            .map(|item| item.source.clone())
            .collect()
    }
}

fn run_worker(shared: Arc<Shared>) {
    debug!("Playback worker started");

    loop {
        let (item, label, stop) = {
            let mut state = shared.lock_state();
            loop {
                if state.shutdown {
                    debug!("Playback worker exiting");
                    return;
                }
                if state.paused {
                    state = shared
                        .wake
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
                if let Some(item) = state.waiting.pop_front() {
                    let label = item.source.to_string();
                    let stop = Arc::new(AtomicBool::new(false));
                    state.active = Some(ActiveItem {
                        label: label.clone(),
                        stop: Arc::clone(&stop),
                    });
                    break (item, label, stop);
                }
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        debug!("Playing {label}");
        let mut outcome = PlayOutcome::Finished;
        for _ in 0..item.loops.max(1) {
            outcome = shared.sink.play(&item.source, &stop);
            if !matches!(outcome, PlayOutcome::Finished) {
                break;
            }
        }

        let stopped = {
            let mut state = shared.lock_state();
            state.active = None;
            stop.load(Ordering::SeqCst)
        };

        match outcome {
            PlayOutcome::Finished if !stopped => {
                debug!("Finished {label}");
                if let Some(on_complete) = item.on_complete {
                    on_complete();
                }
            }
            PlayOutcome::Finished | PlayOutcome::Stopped => debug!("Stopped {label}"),
            PlayOutcome::Failed(e) => warn!("Playback of {label} failed: {e}"),
        }

        if !shared.gap.is_zero() {
            std::thread::sleep(shared.gap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakeSink};
    use std::sync::atomic::AtomicUsize;

    fn queue_with(sink: &Arc<FakeSink>) -> PlaybackQueue {
        PlaybackQueue::new(sink.clone(), 2, Duration::ZERO)
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn third_waiting_item_evicts_oldest_waiting() {
        let sink = Arc::new(FakeSink::default());
        let queue = queue_with(&sink);

        queue.enqueue(PlaybackItem::clip(Clip::Menu(0)));
        queue.enqueue(PlaybackItem::clip(Clip::Menu(1)));
        queue.enqueue(PlaybackItem::clip(Clip::Menu(2)));

        assert_eq!(
            queue.waiting_sources(),
            vec![Source::Clip(Clip::Menu(1)), Source::Clip(Clip::Menu(2))]
        );
    }

    #[test]
    fn eviction_never_touches_the_active_item() {
        let sink = Arc::new(FakeSink::holding());
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        queue.enqueue(PlaybackItem::clip(Clip::Decided));
        assert!(wait_until(|| sink.started() == 1));

        queue.enqueue(PlaybackItem::clip(Clip::Menu(0)));
        queue.enqueue(PlaybackItem::clip(Clip::Menu(1)));
        queue.enqueue(PlaybackItem::clip(Clip::Menu(2)));

        assert_eq!(queue.active_label().as_deref(), Some("clip:kettei"));
        assert_eq!(
            queue.waiting_sources(),
            vec![Source::Clip(Clip::Menu(1)), Source::Clip(Clip::Menu(2))]
        );

        sink.release();
        assert!(wait_until(|| !queue.is_busy()));
        assert_eq!(
            sink.played(),
            vec!["clip:kettei", "clip:menu_1", "clip:menu_2"]
        );

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn items_never_overlap() {
        let sink = Arc::new(FakeSink::default());
        let queue = PlaybackQueue::new(sink.clone(), 8, Duration::ZERO);
        let worker = queue.start().unwrap();

        for i in 0..5 {
            queue.enqueue(PlaybackItem::clip(Clip::Menu(i)));
        }
        assert!(wait_until(|| sink.played().len() == 5));
        assert_eq!(sink.max_concurrent(), 1);

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn completion_runs_only_after_natural_end() {
        let sink = Arc::new(FakeSink::default());
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        let (count, on_complete) = counter();
        queue.enqueue(PlaybackItem::file("/tmp/message.wav").on_complete(on_complete));

        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn urgent_item_skips_active_callback_and_flushes_backlog() {
        let sink = Arc::new(FakeSink::holding());
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        let (count, on_complete) = counter();
        queue.enqueue(PlaybackItem::stream("http://example/story.mp3").on_complete(on_complete));
        assert!(wait_until(|| sink.started() == 1));
        queue.enqueue(PlaybackItem::clip(Clip::Menu(0)));
        queue.enqueue(PlaybackItem::clip(Clip::Menu(1)));

        queue.enqueue(PlaybackItem::clip(Clip::Reboot).urgent());

        // The stopped stream leaves the active slot; only the urgent item remains.
        assert!(wait_until(|| sink.started() == 2));
        assert_eq!(queue.active_label().as_deref(), Some("clip:reboot"));
        assert_eq!(queue.waiting_len(), 0);

        sink.release();
        assert!(wait_until(|| !queue.is_busy()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            sink.played(),
            vec!["stream:http://example/story.mp3", "clip:reboot"]
        );

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn urgent_item_on_idle_queue_is_the_only_item() {
        let sink = Arc::new(FakeSink::default());
        let queue = queue_with(&sink);

        queue.enqueue(PlaybackItem::clip(Clip::Menu(0)));
        queue.enqueue(PlaybackItem::clip(Clip::Beep).urgent());

        assert_eq!(queue.waiting_sources(), vec![Source::Clip(Clip::Beep)]);
    }

    #[test]
    fn stop_active_clears_queue_without_callback() {
        let sink = Arc::new(FakeSink::holding());
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        let (count, on_complete) = counter();
        queue.enqueue(PlaybackItem::file("/tmp/song.wav").on_complete(on_complete));
        assert!(wait_until(|| sink.started() == 1));
        queue.enqueue(PlaybackItem::clip(Clip::Back));

        queue.stop_active();

        assert!(wait_until(|| !queue.is_busy()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sink.played(), vec!["file:/tmp/song.wav"]);

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn failed_item_does_not_stall_or_call_back() {
        let sink = Arc::new(FakeSink::default());
        sink.fail_on("file:/missing.wav");
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        let (count, on_complete) = counter();
        queue.enqueue(PlaybackItem::file("/missing.wav").on_complete(on_complete));
        queue.enqueue(PlaybackItem::clip(Clip::Beep));

        assert!(wait_until(|| sink.played().len() == 2));
        assert!(wait_until(|| !queue.is_busy()));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn held_queue_starts_nothing_until_resumed() {
        let sink = Arc::new(FakeSink::default());
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        let paused = queue.pause_output();
        assert!(!paused.any());
        queue.enqueue(PlaybackItem::clip(Clip::Menu(0)));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.started(), 0);
        assert_eq!(queue.waiting_len(), 1);

        queue.resume_output(paused);
        assert!(wait_until(|| sink.played() == vec!["clip:menu_0"]));
        assert!(sink.resumed().is_empty());

        queue.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn shutdown_releases_a_held_worker() {
        let sink = Arc::new(FakeSink::default());
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        queue.pause_output();
        queue.enqueue(PlaybackItem::clip(Clip::Beep));
        queue.shutdown();
        worker.join().unwrap();
        assert_eq!(sink.started(), 0);
    }

    #[test]
    fn looped_item_plays_repeatedly() {
        let sink = Arc::new(FakeSink::default());
        let queue = queue_with(&sink);
        let worker = queue.start().unwrap();

        queue.enqueue(PlaybackItem::clip(Clip::Beep).looped(3));
        assert!(wait_until(|| sink.played().len() == 3));

        queue.shutdown();
        worker.join().unwrap();
    }
}
