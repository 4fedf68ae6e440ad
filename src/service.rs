//! Control loop.
//!
//! One task owns the state machine. It reacts to control events, to
//! background signals, and to a fixed tick that drives every timer.

use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControlsConfig;
use crate::content::MessageSource;
use crate::input::ControlEvent;
use crate::machine::{Machine, Signal};
use crate::notifications::{self, SharedScheduler};
use crate::playback::PlaybackQueue;
use crate::speech::SpeechCache;

/// Background fan message polling. Absent when notifications are disabled.
pub struct Notifier {
    pub scheduler: SharedScheduler,
    pub source: Arc<dyn MessageSource>,
    pub speech: Arc<dyn SpeechCache>,
}

pub struct PanelService {
    machine: Machine,
    queue: PlaybackQueue,
    notifier: Option<Notifier>,
    events: mpsc::Receiver<ControlEvent>,
    signals: mpsc::UnboundedReceiver<Signal>,
    controls: ControlsConfig,
}

impl PanelService {
    pub fn new(
        machine: Machine,
        queue: PlaybackQueue,
        notifier: Option<Notifier>,
        events: mpsc::Receiver<ControlEvent>,
        signals: mpsc::UnboundedReceiver<Signal>,
        controls: &ControlsConfig,
    ) -> Self {
        Self {
            machine,
            queue,
            notifier,
            events,
            signals,
            controls: controls.clone(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.controls.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Panel ready in {}", self.machine.mode().name());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Control loop stopping");
                    break;
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            debug!("Event: {:?}", event.control);
                            self.machine.handle_event(event);
                        }
                        None => {
                            warn!("Control event channel closed");
                            break;
                        }
                    }
                }
                Some(signal) = self.signals.recv() => {
                    self.machine.handle_signal(signal);
                }
                _ = tick.tick() => self.on_tick(),
            }
        }
    }

    fn on_tick(&mut self) {
        self.machine.tick(Instant::now());

        let Some(notifier) = &self.notifier else {
            return;
        };
        let now = Local::now().naive_local();
        let poll = {
            let mut scheduler = notifications::lock(&notifier.scheduler);
            scheduler.remind_if_due(now, &self.queue);
            scheduler.poll_due(now)
        };
        if poll {
            debug!("Checking for new fan messages");
            tokio::spawn(notifications::check_notifications(
                Arc::clone(&notifier.scheduler),
                Arc::clone(&notifier.source),
                Arc::clone(&notifier.speech),
                self.queue.clone(),
            ));
        }
    }
}
