//! knob-panel: voice-guided rotary knob panel for a headless speaker.

mod blog;
mod config;
mod content;
mod error;
mod input;
mod interrupt;
mod machine;
mod notifications;
mod playback;
mod power;
mod recorder;
mod service;
mod speech;
mod volume;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::content::{ContentPaths, MessageSource, RemoteContent, RemoteLibrary};
use crate::input::ControlDevice;
use crate::interrupt::{AplayPlayer, InterruptState};
use crate::machine::{Collaborators, Machine};
use crate::notifications::{NotificationScheduler, StateStore};
use crate::playback::clip::ClipBank;
use crate::playback::speaker::{open_output, Speaker};
use crate::playback::PlaybackQueue;
use crate::speech::{HttpSpeech, SpeechCache};
use crate::volume::{AlsaMixer, Volume, VolumeRepeater};

/// Time left for the reboot announcement before the system goes down.
const REBOOT_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "knob-panel", about = "Voice-guided rotary knob panel")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Keep HTTP client internals quiet
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("knob-panel starting");

    let config = config::Config::load(args.config.as_deref());
    info!("Control device filter: {:?}", config.device);

    // Speaker and playback worker. No usable output is fatal.
    let clips = ClipBank::load(&config.audio.audio_dir);
    info!("Loaded {} UI clips", clips.len());
    let (output, _keepalive) = open_output(&config.audio.output_profiles)?;
    let speaker = Arc::new(Speaker::new(output, clips, &config.audio));
    let queue = PlaybackQueue::new(
        speaker,
        config.audio.queue_capacity,
        Duration::from_millis(config.audio.gap_ms),
    );
    let playback_worker = queue.start()?;

    let volume = Arc::new(Volume::new(
        Arc::new(AlsaMixer::new(&config.volume)),
        &config.volume,
    ));
    volume.apply();
    let repeater = VolumeRepeater::new(
        Arc::clone(&volume),
        queue.clone(),
        Duration::from_millis(config.volume.repeat_ms),
    );

    if config.content.messages_url.is_empty() {
        warn!("content.messages_url is empty: fan messages and notifications are disabled");
    }

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let paths = ContentPaths::from_config(&config.content);
    let content = Arc::new(RemoteContent::new(&config.content)?);
    let speech: Arc<dyn SpeechCache> = Arc::new(HttpSpeech::new(&config.speech, paths.clone())?);
    let library = Arc::new(RemoteLibrary::new(
        Arc::clone(&content),
        Arc::clone(&speech),
        signal_tx.clone(),
    ));

    let scheduler = NotificationScheduler::new(
        &config.notifications,
        StateStore::new(&config.notifications.state_file),
    )
    .shared();

    let deps = Collaborators {
        queue: queue.clone(),
        repeater,
        library,
        capture: Arc::new(recorder::Microphone::new(&config.recording)),
        publisher: Arc::new(blog::BlogPublisher::new(&config.blog)?),
        power: Arc::new(power::SystemPower::new(REBOOT_GRACE)),
        notifications: Arc::clone(&scheduler),
        paths,
    };
    let machine = Machine::new(&config, deps, signal_tx);

    let notifier = config.notifications.enabled.then(|| {
        let source: Arc<dyn MessageSource> = content;
        service::Notifier {
            scheduler,
            source,
            speech,
        }
    });

    let shutdown = CancellationToken::new();

    // Control device (background task, rediscovers on loss)
    let (event_tx, event_rx) = mpsc::channel(32);
    let device = ControlDevice::new(&config.device, &config.keys, event_tx);
    let device_task = tokio::spawn(device.run(shutdown.clone()));

    if config.api.enabled {
        let state = InterruptState::new(
            queue.clone(),
            Arc::clone(&volume),
            Arc::new(AplayPlayer::new(
                &config.audio.cue_player,
                &config.audio.alsa_device(),
            )),
            config.audio.audio_dir.join("direction"),
            config.api.boost_volume,
        );
        interrupt::start_interrupt_api(state, &config.api.bind, config.api.port, shutdown.clone())
            .await;
    }

    let stop = shutdown.clone();
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        stop.cancel();
    });

    let service = service::PanelService::new(
        machine,
        queue.clone(),
        notifier,
        event_rx,
        signal_rx,
        &config.controls,
    );
    service.run(shutdown.clone()).await;

    // Releases the device grab
    shutdown.cancel();
    let _ = device_task.await;

    queue.shutdown();
    tokio::task::spawn_blocking(move || playback_worker.join())
        .await?
        .map_err(|_| "playback worker panicked")?;

    info!("knob-panel stopped");
    Ok(())
}
