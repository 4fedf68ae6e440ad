//! Hardware output volume.
//!
//! The level is shared between the hold-to-repeat volume buttons and the
//! priority interrupt path. The user's chosen level lives here; the
//! interrupt path only boosts the hardware temporarily and the boost guard
//! writes the chosen level back when it drops.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::VolumeConfig;
use crate::error::{Error, Result};
use crate::playback::{Clip, PlaybackItem, PlaybackQueue};

/// Hardware mixer control, in percent.
pub trait Mixer: Send + Sync {
    fn write(&self, percent: u8) -> Result<()>;
}

/// ALSA mixer driven through `amixer`.
pub struct AlsaMixer {
    card: String,
    control: String,
}

impl AlsaMixer {
    pub fn new(config: &VolumeConfig) -> Self {
        Self {
            card: config.card.clone(),
            control: config.control.clone(),
        }
    }
}

impl Mixer for AlsaMixer {
    fn write(&self, percent: u8) -> Result<()> {
        let status = Command::new("amixer")
            .args(["-c", &self.card, "sset", &self.control, &format!("{percent}%")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::Mixer(format!("failed to run amixer: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Mixer(format!("amixer sset exited with {status}")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeDirection {
    Down,
    Up,
}

pub struct Volume {
    mixer: Arc<dyn Mixer>,
    level: Mutex<u8>,
    min: u8,
    max: u8,
    step: u8,
}

impl Volume {
    pub fn new(mixer: Arc<dyn Mixer>, config: &VolumeConfig) -> Self {
        Self {
            mixer,
            level: Mutex::new(config.initial.clamp(config.min, config.max)),
            min: config.min,
            max: config.max,
            step: config.step,
        }
    }

    /// Push the configured initial level to the hardware.
    pub fn apply(&self) {
        let level = self.level();
        match self.mixer.write(level) {
            Ok(()) => info!("Initial volume: {level}%"),
            Err(e) => warn!("Failed to set initial volume: {e}"),
        }
    }

    pub fn level(&self) -> u8 {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the chosen level one step and write it to the hardware. Blocks
    /// on the mixer; the level lock is released before the write.
    pub fn step(&self, direction: VolumeDirection) -> u8 {
        let level = {
            let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
            *level = match direction {
                VolumeDirection::Down => level.saturating_sub(self.step).max(self.min),
                VolumeDirection::Up => level.saturating_add(self.step).min(self.max),
            };
            *level
        };
        if let Err(e) = self.mixer.write(level) {
            warn!("Failed to set volume: {e}");
        }
        level
    }

    /// Drive the hardware to `percent` until the returned guard drops. The
    /// chosen level is untouched.
    pub fn boost(self: &Arc<Self>, percent: u8) -> Result<BoostGuard> {
        self.mixer.write(percent)?;
        debug!("Volume boosted to {percent}% (chosen {}%)", self.level());
        Ok(BoostGuard {
            volume: Arc::clone(self),
        })
    }
}

/// Restores the chosen level on drop.
#[must_use]
pub struct BoostGuard {
    volume: Arc<Volume>,
}

impl Drop for BoostGuard {
    fn drop(&mut self) {
        let level = self.volume.level();
        for attempt in 1..=2 {
            match self.volume.mixer.write(level) {
                Ok(()) => {
                    debug!("Volume restored to {level}%");
                    return;
                }
                Err(e) => warn!("Volume restore attempt {attempt} failed: {e}"),
            }
        }
    }
}

/// Repeats volume steps while a volume button is held.
pub struct VolumeRepeater {
    volume: Arc<Volume>,
    queue: PlaybackQueue,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    active: Arc<AtomicBool>,
    steps: Arc<AtomicU32>,
}

impl VolumeRepeater {
    pub fn new(volume: Arc<Volume>, queue: PlaybackQueue, interval: Duration) -> Self {
        Self {
            volume,
            queue,
            interval,
            task: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            steps: Arc::new(AtomicU32::new(0)),
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Start stepping in `direction`. Cancels any running repeat first.
    pub fn start(&self, direction: VolumeDirection) {
        self.stop();
        self.active.store(true, Ordering::Relaxed);
        info!("Volume {direction:?} started");

        let volume = Arc::clone(&self.volume);
        let queue = self.queue.clone();
        let active = Arc::clone(&self.active);
        let steps = Arc::clone(&self.steps);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            while active.load(Ordering::Relaxed) {
                let stepper = Arc::clone(&volume);
                let step = tokio::task::spawn_blocking(move || stepper.step(direction));
                let level = match step.await {
                    Ok(level) => level,
                    Err(e) => {
                        warn!("Volume step task failed: {e}");
                        break;
                    }
                };
                steps.fetch_add(1, Ordering::Relaxed);
                debug!("Volume: {level}%");
                if !queue.is_busy() {
                    queue.enqueue(PlaybackItem::clip(Clip::Beep));
                }
                tokio::time::sleep(interval).await;
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop stepping. Returns the number of steps taken by the last repeat.
    pub fn stop(&self) -> u32 {
        self.active.store(false, Ordering::Relaxed);
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!("Volume adjusted: {}%", self.volume.level());
        }
        self.steps.swap(0, Ordering::Relaxed)
    }
}
