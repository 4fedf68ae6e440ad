//! Priority interrupt endpoint.
//!
//! `POST /direction` plays a directional cue (`direction/<name>.wav`)
//! straight through an OS player, bypassing the playback queue. Whatever
//! the queue is rendering is paused for the duration and the hardware
//! volume is boosted; both are put back by drop guards whatever happens.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::playback::{PausedChannels, PlaybackQueue};
use crate::volume::Volume;

/// Plays a WAV file to completion, blocking the caller.
pub trait CuePlayer: Send + Sync {
    fn play(&self, path: &Path) -> Result<()>;
}

/// `aplay -D hw:<card>,0`.
pub struct AplayPlayer {
    program: String,
    device: String,
}

impl AplayPlayer {
    pub fn new(program: &str, device: &str) -> Self {
        Self {
            program: program.to_string(),
            device: device.to_string(),
        }
    }
}

impl CuePlayer for AplayPlayer {
    fn play(&self, path: &Path) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("-D")
            .arg(&self.device)
            .arg("-q")
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::Audio(format!("failed to run {}: {e}", self.program)))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Audio(format!("{} exited with {status}", self.program)))
        }
    }
}

#[derive(Clone)]
pub struct InterruptState {
    pub queue: PlaybackQueue,
    pub volume: Arc<Volume>,
    pub player: Arc<dyn CuePlayer>,
    /// Directory holding `<name>.wav` cues.
    pub cue_dir: PathBuf,
    pub boost_volume: u8,
    serial: Arc<Mutex<()>>,
}

impl InterruptState {
    pub fn new(
        queue: PlaybackQueue,
        volume: Arc<Volume>,
        player: Arc<dyn CuePlayer>,
        cue_dir: PathBuf,
        boost_volume: u8,
    ) -> Self {
        Self {
            queue,
            volume,
            player,
            cue_dir,
            boost_volume,
            serial: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Serialize)]
struct DirectionResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DirectionResponse {
    fn ok(dir: String) -> Self {
        Self {
            ok: true,
            dir: Some(dir),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            dir: None,
            error: Some(message.into()),
        }
    }
}

type Reply = (StatusCode, Json<DirectionResponse>);

fn reject(status: StatusCode, message: impl Into<String>) -> Reply {
    (status, Json(DirectionResponse::err(message)))
}

pub fn router(state: InterruptState) -> Router {
    Router::new()
        .route("/direction", post(handle_direction))
        .with_state(state)
}

/// Serve the endpoint on a background task until `shutdown` fires.
pub async fn start_interrupt_api(
    state: InterruptState,
    bind: &str,
    port: u16,
    shutdown: CancellationToken,
) {
    let app = router(state);
    let addr = format!("{bind}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind interrupt API on {addr}: {e}");
            return;
        }
    };
    info!("Interrupt API listening on {addr}");

    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            warn!("Interrupt API server error: {e}");
        }
    });
}

/// Letters, digits and underscores only, so the name can't leave `cue_dir`.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

async fn handle_direction(State(state): State<InterruptState>, body: Bytes) -> Reply {
    let request: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return reject(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")),
    };
    let Some(dir) = request.get("dir").and_then(|d| d.as_str()) else {
        return reject(StatusCode::BAD_REQUEST, "missing dir");
    };
    if !is_plain_name(dir) {
        return reject(StatusCode::BAD_REQUEST, format!("invalid dir: {dir}"));
    }
    let dir = dir.to_string();

    let path = state.cue_dir.join(format!("{dir}.wav"));
    if !path.is_file() {
        warn!("Direction cue not found: {}", path.display());
        return reject(StatusCode::NOT_FOUND, format!("no cue for {dir}"));
    }

    let serial = Arc::clone(&state.serial);
    let _serial = serial.lock().await;
    info!("Direction interrupt: {dir}");
    let started = Instant::now();

    let result = tokio::task::spawn_blocking(move || {
        play_cue(
            &state.queue,
            &state.volume,
            state.player.as_ref(),
            &path,
            state.boost_volume,
        )
    })
    .await;

    match result {
        Ok(Ok(())) => {
            debug!("Direction {dir} done in {}ms", started.elapsed().as_millis());
            (StatusCode::OK, Json(DirectionResponse::ok(dir)))
        }
        Ok(Err(e)) => {
            warn!("Direction {dir} failed: {e}");
            reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            warn!("Direction task failed: {e}");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "playback task failed")
        }
    }
}

/// Resumes exactly the channels that were paused.
struct ResumeGuard<'a> {
    queue: &'a PlaybackQueue,
    paused: PausedChannels,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        if self.paused.any() {
            debug!("Resuming {:?}", self.paused);
        }
        self.queue.resume_output(self.paused);
    }
}

/// Runs on a blocking thread. Guards drop in reverse: volume first, then
/// the paused output.
fn play_cue(
    queue: &PlaybackQueue,
    volume: &Arc<Volume>,
    player: &dyn CuePlayer,
    path: &Path,
    boost: u8,
) -> Result<()> {
    let _resume = ResumeGuard {
        queue,
        paused: queue.pause_output(),
    };
    let _boost = match volume.boost(boost) {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!("Volume boost failed, playing at current level: {e}");
            None
        }
    };
    player.play(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::playback::PlaybackItem;
    use crate::testing::{wait_until, FakeCuePlayer, FakeMixer, FakeSink};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        state: InterruptState,
        sink: Arc<FakeSink>,
        mixer: Arc<FakeMixer>,
        player: Arc<FakeCuePlayer>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cue_dir = dir.path().join("direction");
        std::fs::create_dir_all(&cue_dir).unwrap();
        std::fs::write(cue_dir.join("north.wav"), b"RIFF").unwrap();

        let sink = Arc::new(FakeSink::holding());
        let mixer = Arc::new(FakeMixer::new(40));
        let config = VolumeConfig {
            initial: 40,
            ..VolumeConfig::default()
        };
        let volume = Arc::new(Volume::new(mixer.clone(), &config));
        let player = Arc::new(FakeCuePlayer::new(mixer.clone()));
        let queue = PlaybackQueue::new(sink.clone(), 2, Duration::ZERO);

        Fixture {
            state: InterruptState::new(queue, volume, player.clone(), cue_dir, 100),
            sink,
            mixer,
            player,
            _dir: dir,
        }
    }

    async fn post(state: InterruptState, body: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(
                Request::post("/direction")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn north_pauses_boosts_and_restores() {
        let f = fixture();
        let worker = f.state.queue.start().unwrap();
        f.state
            .queue
            .enqueue(PlaybackItem::stream("http://example/story.mp3"));
        assert!(wait_until(|| f.sink.started() == 1));

        let (status, body) = post(f.state.clone(), r#"{"dir":"north"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"ok": true, "dir": "north"}));
        assert_eq!(f.player.played().len(), 1);
        assert!(f.player.played()[0].0.ends_with("direction/north.wav"));
        assert_eq!(f.player.played()[0].1, 100);
        assert_eq!(f.mixer.current(), 40);
        assert_eq!(f.sink.pauses(), 1);
        assert_eq!(
            f.sink.resumed(),
            vec![PausedChannels {
                decoded: true,
                stream: false
            }]
        );

        f.sink.release();
        f.state.queue.shutdown();
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn queue_stays_silent_until_the_cue_ends() {
        let f = fixture();
        f.sink.release();
        let worker = f.state.queue.start().unwrap();
        f.player.hold();

        let request = tokio::spawn(post(f.state.clone(), r#"{"dir":"north"}"#));
        let player = f.player.clone();
        assert!(
            tokio::task::spawn_blocking(move || wait_until(|| player.played().len() == 1))
                .await
                .unwrap()
        );

        f.state
            .queue
            .enqueue(PlaybackItem::file("/tmp/message.wav"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.sink.started(), 0);

        f.player.release();
        let (status, _) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let sink = f.sink.clone();
        assert!(
            tokio::task::spawn_blocking(move || wait_until(|| sink.started() == 1))
                .await
                .unwrap()
        );
        assert_eq!(f.sink.played(), vec!["file:/tmp/message.wav"]);

        f.state.queue.shutdown();
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn idle_output_is_not_resumed() {
        let f = fixture();
        let (status, _) = post(f.state.clone(), r#"{"dir":"north"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!(f.sink.resumed().is_empty());
    }

    #[tokio::test]
    async fn failed_playback_still_restores_volume() {
        let f = fixture();
        f.player.fail(true);

        let (status, body) = post(f.state.clone(), r#"{"dir":"north"}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["ok"], false);
        assert_eq!(f.mixer.current(), 40);
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let f = fixture();
        for body in ["{not json", r#"{"direction":"north"}"#, r#"{"dir":"../north"}"#] {
            let (status, reply) = post(f.state.clone(), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(reply["ok"], false);
            assert!(reply["error"].is_string());
        }
        assert!(f.player.played().is_empty());
    }

    #[tokio::test]
    async fn unknown_cue_is_not_found() {
        let f = fixture();
        let (status, _) = post(f.state.clone(), r#"{"dir":"south"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(f.mixer.current(), 40);
        assert_eq!(f.sink.pauses(), 0);
    }
}
