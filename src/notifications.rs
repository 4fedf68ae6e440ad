//! New fan message announcements and unread reminders.
//!
//! Two watermarks are persisted: the newest message announced and the
//! newest message listened to. Both are composite `timestamp_name` IDs, so
//! plain string comparison tells which is more recent.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::content::MessageSource;
use crate::error::Result;
use crate::playback::{Clip, PlaybackItem, PlaybackQueue};
use crate::speech::SpeechCache;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    #[serde(default)]
    pub last_notified_id: String,
    #[serde(default)]
    pub last_played_id: String,
}

impl Watermarks {
    pub fn has_unplayed(&self) -> bool {
        self.last_notified_id > self.last_played_id
    }
}

/// JSON file holding the watermarks.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Missing or unreadable state starts empty.
    pub fn load(&self) -> Watermarks {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => {
                debug!("No notification state at {}", self.path.display());
                return Watermarks::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(e) => {
                warn!("Corrupt notification state {}: {e}", self.path.display());
                Watermarks::default()
            }
        }
    }

    pub fn save(&self, state: &Watermarks) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First ever poll; recorded without an announcement.
    Seeded,
    New,
    Unchanged,
}

pub struct NotificationScheduler {
    store: StateStore,
    state: Watermarks,
    window_start_hour: u32,
    window_end_hour: u32,
    poll_interval: TimeDelta,
    reminder_hours: Vec<u32>,
    announce_repeats: u32,
    last_poll: Option<NaiveDateTime>,
    last_reminder: Option<(NaiveDate, u32)>,
}

pub type SharedScheduler = Arc<Mutex<NotificationScheduler>>;

pub fn lock(scheduler: &SharedScheduler) -> MutexGuard<'_, NotificationScheduler> {
    scheduler.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NotificationScheduler {
    pub fn new(config: &NotificationConfig, store: StateStore) -> Self {
        let state = store.load();
        info!(
            "Notification state: notified={:?} played={:?}",
            state.last_notified_id, state.last_played_id
        );
        Self {
            store,
            state,
            window_start_hour: config.window_start_hour,
            window_end_hour: config.window_end_hour,
            poll_interval: TimeDelta::seconds(config.poll_interval_secs),
            reminder_hours: config.reminder_hours.clone(),
            announce_repeats: config.announce_repeats.max(1),
            last_poll: None,
            last_reminder: None,
        }
    }

    pub fn shared(self) -> SharedScheduler {
        Arc::new(Mutex::new(self))
    }

    pub fn watermarks(&self) -> &Watermarks {
        &self.state
    }

    fn announcement(&self, clip: Clip) -> PlaybackItem {
        PlaybackItem::clip(clip).looped(self.announce_repeats)
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.state) {
            warn!("Failed to save notification state: {e}");
        }
    }

    /// True when a poll should start now. Claims the poll slot.
    pub fn poll_due(&mut self, now: NaiveDateTime) -> bool {
        let hour = now.hour();
        if hour < self.window_start_hour || hour >= self.window_end_hour {
            return false;
        }
        if let Some(last) = self.last_poll {
            if now - last < self.poll_interval {
                return false;
            }
        }
        self.last_poll = Some(now);
        true
    }

    pub fn observe(&self, newest_id: &str) -> Observation {
        if self.state.last_notified_id.is_empty() {
            Observation::Seeded
        } else if self.state.last_notified_id != newest_id {
            Observation::New
        } else {
            Observation::Unchanged
        }
    }

    pub fn record_notified(&mut self, id: &str) {
        self.state.last_notified_id = id.to_string();
        self.persist();
    }

    /// Raise the played watermark. Older IDs are ignored.
    pub fn mark_as_played(&mut self, id: &str) -> bool {
        if id <= self.state.last_played_id.as_str() {
            debug!("Played watermark stays at {}", self.state.last_played_id);
            return false;
        }
        self.state.last_played_id = id.to_string();
        self.persist();
        info!("Marked {id} as played");
        true
    }

    /// Speak the reminder at most once per reminder hour while an announced
    /// message is still unplayed.
    pub fn remind_if_due(&mut self, now: NaiveDateTime, queue: &PlaybackQueue) -> bool {
        let hour = now.hour();
        if !self.reminder_hours.contains(&hour) {
            return false;
        }
        let slot = (now.date(), hour);
        if self.last_reminder == Some(slot) {
            return false;
        }
        self.last_reminder = Some(slot);

        if !self.state.has_unplayed() {
            debug!("No unplayed fan message at {hour}:00");
            return false;
        }
        info!("Reminding about unplayed fan message");
        queue.enqueue(self.announcement(Clip::FanMessageReminder));
        true
    }
}

/// Fetch the newest message and announce it when it is new. Runs on its own
/// task, off the control loop.
pub async fn check_notifications(
    scheduler: SharedScheduler,
    source: Arc<dyn MessageSource>,
    speech: Arc<dyn SpeechCache>,
    queue: PlaybackQueue,
) {
    let messages = source.fan_messages(true).await;
    let Some(newest) = messages
        .into_iter()
        .min_by_key(|m| std::cmp::Reverse(m.sent_at()))
    else {
        debug!("No fan messages");
        return;
    };

    let id = newest.id();
    let observation = lock(&scheduler).observe(&id);
    match observation {
        Observation::Unchanged => debug!("No new fan message"),
        Observation::Seeded => {
            info!("Seeding notification watermark with {id}");
            lock(&scheduler).record_notified(&id);
        }
        Observation::New => {
            info!("New fan message: {id}");
            if let Err(e) = speech.ensure_message_audio(&newest).await {
                warn!("Failed to prepare audio for {id}: {e}");
            }
            let mut scheduler = lock(&scheduler);
            queue.enqueue(scheduler.announcement(Clip::FanMessageArrival));
            scheduler.record_notified(&id);
        }
    }
}
