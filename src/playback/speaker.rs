//! Speaker output: rodio for clips and local files, an external player
//! process for remote streams.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rodio::cpal::BufferSize;
use rodio::mixer::Mixer;
use rodio::{Decoder, OutputStreamBuilder, Sink};
use tracing::{debug, info, warn};

use super::clip::ClipBank;
use super::{AudioSink, PausedChannels, PlayOutcome, Source};
use crate::config::{AudioConfig, OutputProfile};
use crate::error::{Error, Result};

const POLL: Duration = Duration::from_millis(50);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Open the speaker, trying each configured profile before the plain default
/// stream. The output stream lives on its own thread for as long as the
/// returned keep-alive sender exists.
pub fn open_output(profiles: &[OutputProfile]) -> Result<(Mixer, mpsc::Sender<()>)> {
    let profiles = profiles.to_vec();
    let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<Mixer, String>>();
    let (keepalive_tx, keepalive_rx) = mpsc::channel::<()>();

    std::thread::Builder::new()
        .name("speaker-output".into())
        .spawn(move || {
            let mut opened = None;
            for p in &profiles {
                let attempt = OutputStreamBuilder::from_default_device().and_then(|builder| {
                    builder
                        .with_sample_rate(p.sample_rate)
                        .with_channels(p.channels)
                        .with_buffer_size(BufferSize::Fixed(p.buffer_size))
                        .open_stream()
                });
                match attempt {
                    Ok(stream) => {
                        info!(
                            "Audio output opened: {}Hz, {}ch, buffer {}",
                            p.sample_rate, p.channels, p.buffer_size
                        );
                        opened = Some(stream);
                        break;
                    }
                    Err(e) => warn!(
                        "Output profile {}Hz/{}ch/{} unavailable: {e}",
                        p.sample_rate, p.channels, p.buffer_size
                    ),
                }
            }

            let stream = match opened {
                Some(stream) => stream,
                None => match OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => {
                        info!("Audio output opened with device defaults");
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                },
            };

            let _ = ready_tx.send(Ok(stream.mixer().clone()));
            // Blocks until every keep-alive sender is dropped.
            let _ = keepalive_rx.recv();
            drop(stream);
            debug!("Audio output closed");
        })?;

    match ready_rx.recv() {
        Ok(Ok(mixer)) => Ok((mixer, keepalive_tx)),
        Ok(Err(e)) => Err(Error::Audio(format!("no usable audio output: {e}"))),
        Err(_) => Err(Error::Audio("audio output thread exited".into())),
    }
}

pub struct Speaker {
    mixer: Mixer,
    clips: ClipBank,
    stream_player: String,
    alsa_device: String,
    decoded: Mutex<Option<Sink>>,
    stream: Mutex<Option<Child>>,
    stream_paused: AtomicBool,
}

impl Speaker {
    pub fn new(mixer: Mixer, clips: ClipBank, config: &AudioConfig) -> Self {
        Self {
            mixer,
            clips,
            stream_player: config.stream_player.clone(),
            alsa_device: config.alsa_device(),
            decoded: Mutex::new(None),
            stream: Mutex::new(None),
            stream_paused: AtomicBool::new(false),
        }
    }

    fn play_decoded<R>(&self, decoder: Decoder<R>, stop: &AtomicBool) -> PlayOutcome
    where
        R: Read + Seek + Send + Sync + 'static,
    {
        let sink = Sink::connect_new(&self.mixer);
        sink.append(decoder);
        *locked(&self.decoded) = Some(sink);

        let outcome = loop {
            let done = match locked(&self.decoded).as_ref() {
                Some(sink) => sink.empty(),
                None => true,
            };
            if stop.load(Ordering::SeqCst) {
                if let Some(sink) = locked(&self.decoded).take() {
                    sink.stop();
                }
                break PlayOutcome::Stopped;
            }
            if done {
                break PlayOutcome::Finished;
            }
            std::thread::sleep(POLL);
        };

        *locked(&self.decoded) = None;
        outcome
    }

    fn play_stream(&self, url: &str, stop: &AtomicBool) -> PlayOutcome {
        let child = Command::new(&self.stream_player)
            .args(["-nodisp", "-autoexit", "-loglevel", "quiet"])
            .args(["-af", "aformat=sample_fmts=s16:sample_rates=48000"])
            .arg(url)
            .env("SDL_AUDIODRIVER", "alsa")
            .env("AUDIODEV", &self.alsa_device)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return PlayOutcome::Failed(Error::Audio(format!(
                    "failed to launch {}: {e}",
                    self.stream_player
                )))
            }
        };
        info!("Streaming {url} (pid {})", child.id());
        *locked(&self.stream) = Some(child);
        self.stream_paused.store(false, Ordering::SeqCst);

        loop {
            if stop.load(Ordering::SeqCst) {
                self.kill_stream();
                return PlayOutcome::Stopped;
            }

            {
                let mut guard = locked(&self.stream);
                let Some(child) = guard.as_mut() else {
                    return PlayOutcome::Stopped;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        return if status.success() {
                            PlayOutcome::Finished
                        } else {
                            PlayOutcome::Failed(Error::Audio(format!(
                                "{} exited with {status}",
                                self.stream_player
                            )))
                        };
                    }
                    Ok(None) => {}
                    Err(e) => {
                        guard.take();
                        return PlayOutcome::Failed(Error::Io(e));
                    }
                }
            }

            std::thread::sleep(POLL);
        }
    }

    fn kill_stream(&self) {
        if let Some(mut child) = locked(&self.stream).take() {
            if self.stream_paused.swap(false, Ordering::SeqCst) {
                signal(&child, libc::SIGCONT);
            }
            if let Err(e) = child.kill() {
                debug!("Stream player already gone: {e}");
            }
            let _ = child.wait();
        }
    }
}

/// Deliver a job-control signal to a player process. A player that has
/// already exited counts as delivered.
fn signal(child: &Child, sig: libc::c_int) -> bool {
    match send_signal(child.id(), sig) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send signal {sig} to pid {}: {e}", child.id());
            false
        }
    }
}

fn send_signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
    };
    if pid <= 0 {
        return Ok(());
    }

    // SAFETY: plain integer arguments, errno is read right after the call.
    if unsafe { libc::kill(pid, sig) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if is_no_such_process(&err) {
        debug!("pid {pid} already exited");
        return Ok(());
    }
    Err(err)
}

fn is_no_such_process(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ESRCH)
}

impl AudioSink for Speaker {
    fn play(&self, source: &Source, stop: &AtomicBool) -> PlayOutcome {
        match source {
            Source::Clip(clip) => {
                let Some(bytes) = self.clips.get(*clip) else {
                    return PlayOutcome::Failed(Error::Audio(format!("clip {clip} not loaded")));
                };
                match Decoder::new(Cursor::new(bytes)) {
                    Ok(decoder) => self.play_decoded(decoder, stop),
                    Err(e) => PlayOutcome::Failed(Error::Audio(format!("clip {clip}: {e}"))),
                }
            }
            Source::File(path) => {
                let file = match File::open(path) {
                    Ok(file) => file,
                    Err(e) => {
                        return PlayOutcome::Failed(Error::Audio(format!(
                            "{}: {e}",
                            path.display()
                        )))
                    }
                };
                match Decoder::new(BufReader::new(file)) {
                    Ok(decoder) => self.play_decoded(decoder, stop),
                    Err(e) => PlayOutcome::Failed(Error::Audio(format!(
                        "{}: {e}",
                        path.display()
                    ))),
                }
            }
            Source::Stream(url) => self.play_stream(url, stop),
        }
    }

    fn halt(&self) {
        if let Some(sink) = locked(&self.decoded).take() {
            sink.stop();
        }
        self.kill_stream();
    }

    fn pause(&self) -> PausedChannels {
        let mut paused = PausedChannels::default();

        if let Some(sink) = locked(&self.decoded).as_ref() {
            if !sink.is_paused() && !sink.empty() {
                sink.pause();
                paused.decoded = true;
            }
        }

        if let Some(child) = locked(&self.stream).as_ref() {
            if !self.stream_paused.load(Ordering::SeqCst) && signal(child, libc::SIGSTOP) {
                self.stream_paused.store(true, Ordering::SeqCst);
                paused.stream = true;
            }
        }

        debug!("Paused output channels: {paused:?}");
        paused
    }

    fn resume(&self, paused: PausedChannels) {
        if paused.decoded {
            if let Some(sink) = locked(&self.decoded).as_ref() {
                sink.play();
            }
        }
        if paused.stream {
            if let Some(child) = locked(&self.stream).as_ref() {
                if self.stream_paused.swap(false, Ordering::SeqCst) {
                    signal(child, libc::SIGCONT);
                }
            }
        }
        debug!("Resumed output channels: {paused:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_state(pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // The state follows the parenthesised command name.
        let rest = &stat[stat.rfind(')')? + 1..];
        rest.trim_start().chars().next()
    }

    fn wait_for_state(pid: u32, wanted: impl Fn(char) -> bool) -> bool {
        for _ in 0..100 {
            if process_state(pid).is_some_and(&wanted) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn stop_and_continue_reach_the_player() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        assert!(signal(&child, libc::SIGSTOP));
        assert!(wait_for_state(child.id(), |s| s == 'T'));

        assert!(signal(&child, libc::SIGCONT));
        assert!(wait_for_state(child.id(), |s| s != 'T'));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn exited_player_counts_as_signalled() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        // Reaped, so the pid no longer names a process.
        assert!(send_signal(pid, libc::SIGCONT).is_ok());
    }

    #[test]
    fn esrch_is_the_only_ignored_error() {
        assert!(is_no_such_process(&io::Error::from_raw_os_error(libc::ESRCH)));
        assert!(!is_no_such_process(&io::Error::from_raw_os_error(libc::EPERM)));
    }
}
