//! Blog microphone capture with cpal.
//!
//! A capture owns its input stream on a dedicated thread, drops the lead-in
//! (the tail of the start prompt) and stops by itself at the duration cap.
//! The control loop polls it from the tick and finalizes it into a WAV file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tracing::{debug, info, warn};

use crate::config::RecordingConfig;
use crate::error::{Error, Result};

/// Starts captures.
pub trait CaptureDevice: Send + Sync {
    fn begin(&self, path: &Path) -> Result<Box<dyn Capture>>;
}

/// A running capture.
pub trait Capture: Send + fmt::Debug {
    /// True once the capture stopped by itself.
    fn is_finished(&self) -> bool;

    /// Stop capturing and write the recording. Returns its path.
    fn finish(&mut self) -> Result<PathBuf>;
}

/// Default input device, or the first one whose name contains the
/// configured substring.
pub struct Microphone {
    config: RecordingConfig,
}

impl Microphone {
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl CaptureDevice for Microphone {
    fn begin(&self, path: &Path) -> Result<Box<dyn Capture>> {
        let capture = MicCapture::start(&self.config, path)?;
        Ok(Box::new(capture))
    }
}

struct CaptureBuffer {
    samples: Vec<f32>,
    skip: usize,
    max_samples: usize,
}

struct MicCapture {
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    buffer: Arc<Mutex<CaptureBuffer>>,
    finished: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for MicCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicCapture")
            .field("path", &self.path)
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish()
    }
}

impl MicCapture {
    fn start(config: &RecordingConfig, path: &Path) -> Result<Self> {
        let per_second = config.sample_rate as usize * config.channels as usize;
        let buffer = Arc::new(Mutex::new(CaptureBuffer {
            samples: Vec::with_capacity(per_second * 10),
            skip: per_second * config.lead_in_ms as usize / 1000,
            max_samples: (config.max_duration_secs * per_second as f64) as usize,
        }));
        let finished = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let thread = {
            let config = config.clone();
            let buffer = Arc::clone(&buffer);
            let finished = Arc::clone(&finished);
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    let stream = match open_input(&config, buffer, Arc::clone(&finished)) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));

                    // Held open until finished or asked to stop.
                    loop {
                        match stop_rx.recv_timeout(Duration::from_millis(100)) {
                            Err(mpsc::RecvTimeoutError::Timeout)
                                if !finished.load(Ordering::SeqCst) => {}
                            _ => break,
                        }
                    }
                    drop(stream);
                    debug!("Capture stream closed");
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Recording(e)),
            Err(_) => return Err(Error::Recording("capture thread exited".into())),
        }

        info!("Recording started ({} Hz, {} ch)", config.sample_rate, config.channels);
        Ok(Self {
            path: path.to_path_buf(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            buffer,
            finished,
            stop_tx,
            thread: Some(thread),
        })
    }
}

fn open_input(
    config: &RecordingConfig,
    buffer: Arc<Mutex<CaptureBuffer>>,
    finished: Arc<AtomicBool>,
) -> std::result::Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = match &config.device_name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| format!("Failed to list input devices: {e}"))?
            .find(|d| d.name().map(|n| n.contains(wanted.as_str())).unwrap_or(false)),
        None => host.default_input_device(),
    }
    .ok_or("No input audio device available")?;

    info!(
        "Using input device: {}",
        device.name().unwrap_or("unknown".into())
    );

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.chunk_size),
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mut inner = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                if finished.load(Ordering::Relaxed) {
                    return;
                }

                let mut data = data;
                if inner.skip > 0 {
                    let skipped = data.len().min(inner.skip);
                    inner.skip -= skipped;
                    data = &data[skipped..];
                }

                let remaining = inner.max_samples.saturating_sub(inner.samples.len());
                let to_copy = data.len().min(remaining);
                inner.samples.extend_from_slice(&data[..to_copy]);

                if inner.samples.len() >= inner.max_samples {
                    info!("Max recording duration reached");
                    finished.store(true, Ordering::SeqCst);
                }
            },
            move |err| {
                warn!("Audio input error: {err}");
            },
            None,
        )
        .map_err(|e| format!("Failed to build input stream: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("Failed to start input stream: {e}"))?;
    Ok(stream)
}

impl Capture for MicCapture {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn finish(&mut self) -> Result<PathBuf> {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }

        let samples = std::mem::take(
            &mut self
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .samples,
        );
        let seconds = samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64);
        info!("Recording stopped: {seconds:.1}s ({} samples)", samples.len());

        write_wav(&self.path, &samples, self.sample_rate, self.channels)?;
        Ok(self.path.clone())
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// Write f32 samples as 16-bit PCM.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32, channels: u16) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_is_clamped_16_bit_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/blog_input.wav");

        write_wav(&path, &[0.0, 0.5, -2.0, 1.0], 16000, 1).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16383, -32767, 32767]);
    }
}
