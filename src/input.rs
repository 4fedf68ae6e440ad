//! Control panel input using evdev.
//!
//! Finds the panel among the input devices, grabs it exclusively and
//! translates its key events into [`ControlEvent`]s. The device is
//! rediscovered on a fixed backoff whenever it goes away.

use std::time::{Duration, Instant};

use evdev::{Device, EventStream, EventType, InputEventKind, Key};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ControlsConfig, DeviceConfig, KeyConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// One raw encoder tick, +1 clockwise.
    KnobRotate(i8),
    KnobPress,
    BackPress,
    VolDownPress,
    VolDownRelease,
    VolUpPress,
    VolUpRelease,
    AuxPress,
    AuxRelease,
}

impl Control {
    pub fn is_release(self) -> bool {
        matches!(
            self,
            Control::VolDownRelease | Control::VolUpRelease | Control::AuxRelease
        )
    }

    fn is_press(self) -> bool {
        !self.is_release() && !matches!(self, Control::KnobRotate(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEvent {
    pub control: Control,
    pub at: Instant,
}

impl ControlEvent {
    pub fn new(control: Control) -> Self {
        Self {
            control,
            at: Instant::now(),
        }
    }
}

/// Resolve a key name like "KEY_MUTE" to an evdev Key code.
fn resolve_key(name: &str) -> Option<Key> {
    let key = match name {
        "KEY_VOLUMEUP" => Key::KEY_VOLUMEUP,
        "KEY_VOLUMEDOWN" => Key::KEY_VOLUMEDOWN,
        "KEY_MUTE" => Key::KEY_MUTE,
        "KEY_UP" => Key::KEY_UP,
        "KEY_DOWN" => Key::KEY_DOWN,
        "KEY_LEFT" => Key::KEY_LEFT,
        "KEY_RIGHT" => Key::KEY_RIGHT,
        "KEY_ENTER" => Key::KEY_ENTER,
        "KEY_SPACE" => Key::KEY_SPACE,
        "KEY_ESC" => Key::KEY_ESC,
        "KEY_BACK" => Key::KEY_BACK,
        "KEY_PLAYPAUSE" => Key::KEY_PLAYPAUSE,
        "KEY_NEXTSONG" => Key::KEY_NEXTSONG,
        "KEY_PREVIOUSSONG" => Key::KEY_PREVIOUSSONG,
        "KEY_PAGEUP" => Key::KEY_PAGEUP,
        "KEY_PAGEDOWN" => Key::KEY_PAGEDOWN,
        "KEY_F1" => Key::KEY_F1,
        "KEY_F2" => Key::KEY_F2,
        "KEY_F3" => Key::KEY_F3,
        "KEY_F4" => Key::KEY_F4,
        "KEY_F5" => Key::KEY_F5,
        "KEY_F6" => Key::KEY_F6,
        "KEY_F7" => Key::KEY_F7,
        "KEY_F8" => Key::KEY_F8,
        "KEY_F9" => Key::KEY_F9,
        "KEY_F10" => Key::KEY_F10,
        "KEY_F11" => Key::KEY_F11,
        "KEY_F12" => Key::KEY_F12,
        _ => {
            warn!("Unknown key name: {name}");
            return None;
        }
    };
    Some(key)
}

/// Physical key to control mapping.
#[derive(Debug, Clone)]
pub struct KeyMap {
    knob_cw: Option<Key>,
    knob_ccw: Option<Key>,
    knob_press: Option<Key>,
    back: Option<Key>,
    volume_down: Option<Key>,
    aux: Option<Key>,
    volume_up: Option<Key>,
}

impl KeyMap {
    pub fn from_config(config: &KeyConfig) -> Self {
        Self {
            knob_cw: resolve_key(&config.knob_cw),
            knob_ccw: resolve_key(&config.knob_ccw),
            knob_press: resolve_key(&config.knob_press),
            back: resolve_key(&config.back),
            volume_down: resolve_key(&config.volume_down),
            aux: resolve_key(&config.aux),
            volume_up: resolve_key(&config.volume_up),
        }
    }

    /// Translate one key event. `value` is 1 for press, 0 for release and 2
    /// for autorepeat, which is always ignored.
    pub fn translate(&self, key: Key, value: i32) -> Option<Control> {
        let key = Some(key);
        let pressed = match value {
            1 => true,
            0 => false,
            _ => return None,
        };

        // Knob and single-action buttons only report presses.
        if pressed {
            if key == self.knob_cw {
                return Some(Control::KnobRotate(1));
            }
            if key == self.knob_ccw {
                return Some(Control::KnobRotate(-1));
            }
            if key == self.knob_press {
                return Some(Control::KnobPress);
            }
            if key == self.back {
                return Some(Control::BackPress);
            }
        }

        if key == self.volume_down {
            Some(if pressed {
                Control::VolDownPress
            } else {
                Control::VolDownRelease
            })
        } else if key == self.volume_up {
            Some(if pressed {
                Control::VolUpPress
            } else {
                Control::VolUpRelease
            })
        } else if key == self.aux {
            Some(if pressed {
                Control::AuxPress
            } else {
                Control::AuxRelease
            })
        } else {
            None
        }
    }
}

/// Press debounce and post-timeout lockout.
#[derive(Debug)]
pub struct InputGate {
    debounce: Duration,
    lockout: Duration,
    last_knob_press: Option<Instant>,
    locked_until: Option<Instant>,
}

impl InputGate {
    pub fn new(config: &ControlsConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.press_debounce_ms),
            lockout: Duration::from_millis(config.timeout_lockout_ms),
            last_knob_press: None,
            locked_until: None,
        }
    }

    /// Suppress presses until `now + lockout`.
    pub fn lock(&mut self, now: Instant) {
        self.locked_until = Some(now + self.lockout);
        debug!("Presses locked for {:?}", self.lockout);
    }

    pub fn admit(&mut self, event: &ControlEvent) -> bool {
        let control = event.control;

        if control.is_press() {
            if let Some(until) = self.locked_until {
                if event.at < until {
                    debug!("Ignoring {control:?} during lockout");
                    return false;
                }
                self.locked_until = None;
            }
        }

        if control == Control::KnobPress {
            if let Some(last) = self.last_knob_press {
                if event.at.saturating_duration_since(last) < self.debounce {
                    debug!("Debounced knob press");
                    return false;
                }
            }
            self.last_knob_press = Some(event.at);
        }

        true
    }
}

/// Exclusively grabbed device. Ungrabs once, on `release` or drop.
struct GrabbedDevice {
    events: EventStream,
    name: String,
    grabbed: bool,
}

impl GrabbedDevice {
    fn acquire(mut device: Device) -> Result<Self> {
        let name = device.name().unwrap_or("unknown").to_string();
        device
            .grab()
            .map_err(|e| Error::Device(format!("cannot grab {name}: {e}")))?;
        let events = device.into_event_stream()?;
        info!("Grabbed control device: {name}");
        Ok(Self {
            events,
            name,
            grabbed: true,
        })
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.grabbed) {
            return;
        }
        match self.events.device_mut().ungrab() {
            Ok(()) => info!("Released control device: {}", self.name),
            // An unplugged device has nothing left to release.
            Err(e) => debug!("Ungrab of {} failed: {e}", self.name),
        }
    }
}

impl Drop for GrabbedDevice {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct ControlDevice {
    device: DeviceConfig,
    keys: KeyMap,
    tx: mpsc::Sender<ControlEvent>,
}

impl ControlDevice {
    pub fn new(device: &DeviceConfig, keys: &KeyConfig, tx: mpsc::Sender<ControlEvent>) -> Self {
        Self {
            device: device.clone(),
            keys: KeyMap::from_config(keys),
            tx,
        }
    }

    fn matches(&self, name: &str) -> bool {
        name.contains(&self.device.name_contains)
            && (self.device.name_excludes.is_empty() || !name.contains(&self.device.name_excludes))
    }

    /// Find the control panel among the input devices.
    fn discover(&self) -> Option<Device> {
        evdev::enumerate()
            .map(|(_path, device)| device)
            .find(|device| {
                let name = device.name().unwrap_or("");
                let found = self.matches(name);
                if found {
                    info!(
                        "Found control device: {name} at {:?}",
                        device.physical_path()
                    );
                }
                found
            })
    }

    /// Run until shutdown. Device loss triggers rediscovery, never an exit.
    pub async fn run(self, shutdown: CancellationToken) {
        let backoff = Duration::from_secs(self.device.rediscover_secs);

        while !shutdown.is_cancelled() {
            match self.discover().map(GrabbedDevice::acquire) {
                Some(Ok(mut grabbed)) => {
                    let closed = self.forward(&mut grabbed, &shutdown).await;
                    grabbed.release();
                    if closed {
                        break;
                    }
                }
                Some(Err(e)) => warn!("Cannot use control device: {e}"),
                None => warn!(
                    "No control device matching {:?}, retrying in {}s",
                    self.device.name_contains,
                    backoff.as_secs()
                ),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        debug!("Control device loop exited");
    }

    /// Forward events until the device disconnects. Returns true when the
    /// loop should stop (shutdown or the receiver is gone).
    async fn forward(&self, grabbed: &mut GrabbedDevice, shutdown: &CancellationToken) -> bool {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return true,
                event = grabbed.events.next_event() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("Device {} disconnected: {e}", grabbed.name);
                    return false;
                }
            };

            if event.event_type() != EventType::KEY {
                continue;
            }
            let InputEventKind::Key(key) = event.kind() else {
                continue;
            };
            let Some(control) = self.keys.translate(key, event.value()) else {
                continue;
            };

            debug!("Input: {control:?}");
            if self.tx.send(ControlEvent::new(control)).await.is_err() {
                return true;
            }
        }
    }
}
