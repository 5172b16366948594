// Device-control backends: the part that actually talks to the phone

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{ConsoleError, Result};
use crate::models::FlashState;

/// Progress reported by a backend while it flashes.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashEvent {
    pub state: FlashState,
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<FlashEvent>,
}

impl ProgressReporter {
    pub fn report(&self, state: FlashState, progress: u8, message: impl Into<String>) {
        let event = FlashEvent {
            state,
            progress,
            message: message.into(),
        };
        debug!("Flash progress: {} {}% {}", event.state, event.progress, event.message);
        // Nobody listening any more is not the backend's problem
        self.sender.send(event).ok();
    }
}

pub fn progress_channel() -> (ProgressReporter, mpsc::UnboundedReceiver<FlashEvent>) {
    let (sender, rx) = mpsc::unbounded_channel();
    (ProgressReporter { sender }, rx)
}

pub trait DeviceControl: Send + Sync {
    /// Write `image` to the device and reboot it. Intermediate stages are
    /// reported through `progress`; the future resolves when the device has
    /// been told to boot the new system.
    fn flash<'a>(
        &'a self,
        device_id: &'a str,
        image: &'a Path,
        progress: ProgressReporter,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Flashes through `adb` and the TWRP recovery command line.
pub struct AdbDeviceControl {
    adb_path: PathBuf,
    recovery_timeout: Duration,
}

impl AdbDeviceControl {
    pub fn new(adb_path: impl Into<PathBuf>, recovery_timeout: Duration) -> Self {
        Self {
            adb_path: adb_path.into(),
            recovery_timeout,
        }
    }

    async fn adb(&self, serial: &str, args: &[&str], failure: &str) -> Result<String> {
        let output = Command::new(&self.adb_path)
            .arg("-s")
            .arg(serial)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConsoleError::device_operation(format!("Failed to run adb: {e}"), None))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ConsoleError::device_operation(
                format!("{failure}: {stderr}"),
                Some(stderr),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run(&self, serial: &str, image: &Path, progress: ProgressReporter) -> Result<()> {
        let image_name = image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ConsoleError::Validation(format!("Invalid image path {}", image.display())))?;
        let remote = format!("/sdcard/{image_name}");

        progress.report(FlashState::FlashingStarted, 25, "Rebooting to recovery mode...");
        self.adb(serial, &["reboot", "recovery"], "Failed to reboot").await?;
        tokio::time::timeout(
            self.recovery_timeout,
            self.adb(serial, &["wait-for-recovery"], "Device did not enter recovery"),
        )
        .await
        .map_err(|_| {
            ConsoleError::device_operation(
                format!("Device did not enter recovery within {:?}", self.recovery_timeout),
                None,
            )
        })??;

        progress.report(FlashState::Pushing, 30, "Pushing OS image to device...");
        let image_arg = image.to_string_lossy();
        self.adb(serial, &["push", image_arg.as_ref(), "/sdcard/"], "Failed to push image")
            .await?;
        progress.report(FlashState::Pushing, 50, "OS image pushed");

        progress.report(FlashState::Flashing, 70, "Flashing OS image...");
        let output = self
            .adb(serial, &["shell", "twrp", "install", remote.as_str()], "Flash failed")
            .await?;
        debug!("twrp install output: {}", output.trim());

        progress.report(FlashState::Rebooting, 90, "Rebooting device...");
        self.adb(serial, &["reboot"], "Failed to reboot").await?;

        info!("Flashed {} onto {}", image_name, serial);
        Ok(())
    }
}

impl DeviceControl for AdbDeviceControl {
    fn flash<'a>(
        &'a self,
        device_id: &'a str,
        image: &'a Path,
        progress: ProgressReporter,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run(device_id, image, progress))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// Backend replaying a fixed list of events, optionally held open until
    /// the test releases it.
    #[derive(Default)]
    pub struct FakeControl {
        pub steps: Vec<FlashEvent>,
        /// `(message, trace)` to fail with after the steps
        pub failure: Option<(String, Option<String>)>,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        calls: AtomicUsize,
        finished: AtomicUsize,
    }

    impl FakeControl {
        pub fn succeeding() -> Self {
            Self {
                steps: vec![
                    event(FlashState::Pushing, 50, "Pushing OS image to device..."),
                    event(FlashState::Flashing, 70, "Flashing OS image..."),
                    event(FlashState::Rebooting, 90, "Rebooting device..."),
                ],
                ..Default::default()
            }
        }

        pub fn failing(message: &str, trace: &str) -> Self {
            Self {
                steps: vec![event(FlashState::Pushing, 50, "Pushing OS image to device...")],
                failure: Some((message.to_string(), Some(trace.to_string()))),
                ..Default::default()
            }
        }

        /// Hold the flash open after its steps until the sender fires or drops.
        pub fn gated(mut self) -> (Self, oneshot::Sender<()>) {
            let (tx, rx) = oneshot::channel();
            self.gate = Mutex::new(Some(rx));
            (self, tx)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Flashes that ran to their end rather than being dropped.
        pub fn finished(&self) -> usize {
            self.finished.load(Ordering::SeqCst)
        }
    }

    pub fn event(state: FlashState, progress: u8, message: &str) -> FlashEvent {
        FlashEvent {
            state,
            progress,
            message: message.to_string(),
        }
    }

    impl DeviceControl for FakeControl {
        fn flash<'a>(
            &'a self,
            _device_id: &'a str,
            _image: &'a Path,
            progress: ProgressReporter,
        ) -> BoxFuture<'a, Result<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().take();
            Box::pin(async move {
                for step in &self.steps {
                    progress.report(step.state, step.progress, step.message.clone());
                }
                if let Some(gate) = gate {
                    gate.await.ok();
                }
                self.finished.fetch_add(1, Ordering::SeqCst);
                match &self.failure {
                    Some((message, trace)) => {
                        Err(ConsoleError::device_operation(message.clone(), trace.clone()))
                    }
                    None => Ok(()),
                }
            })
        }
    }
}
