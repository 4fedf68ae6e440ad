//! System reboot.

use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{error, warn};

pub trait PowerControl: Send + Sync {
    /// Reboot after a short grace period so the announcement can play.
    fn reboot(&self);
}

pub struct SystemPower {
    grace: Duration,
}

impl SystemPower {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl PowerControl for SystemPower {
    fn reboot(&self) {
        let grace = self.grace;
        warn!("Rebooting in {}s", grace.as_secs());
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let status = tokio::task::spawn_blocking(|| {
                Command::new("sudo")
                    .arg("reboot")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
            })
            .await;
            match status {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => error!("reboot exited with {status}"),
                Ok(Err(e)) => error!("Failed to run reboot: {e}"),
                Err(e) => error!("Reboot task failed: {e}"),
            }
        });
    }
}
