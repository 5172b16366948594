// Per-device flash sessions
//
// One session per device, all held in a single map under one mutex. Every
// mutation (HTTP request, download watcher, flash worker) goes through that
// lock, so check-and-insert is atomic and readers always get a whole
// snapshot. Workers only ever touch the session of the device they were
// spawned for.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::devices::DeviceRegistry;
use crate::error::{ConsoleError, Result};
use crate::images::{ImageDownloadManager, ImageLease, StartOutcome};
use crate::models::{Device, DeviceFlashStatus, DownloadStatus, DownloadTask, FlashSession, FlashState};
use crate::task::{SupervisedTask, lock};

pub mod backend;

pub use backend::{AdbDeviceControl, DeviceControl, FlashEvent, ProgressReporter, progress_channel};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Image every session flashes
    pub image_filename: String,
    /// When false, sessions are confirmed as soon as the image is ready.
    pub requires_confirmation: bool,
    pub stall_timeout: Duration,
    pub history_limit: usize,
}

impl OrchestratorSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            image_filename: settings.image_filename(),
            requires_confirmation: settings.requires_confirmation,
            stall_timeout: settings.stall_timeout(),
            history_limit: settings.history_limit,
        }
    }
}

struct SessionSlot {
    session: FlashSession,
    worker: Option<SupervisedTask>,
    lease: Option<ImageLease>,
}

struct Inner {
    registry: Arc<DeviceRegistry>,
    images: ImageDownloadManager,
    backend: Arc<dyn DeviceControl>,
    settings: OrchestratorSettings,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    history: Mutex<VecDeque<FlashSession>>,
    /// Devices whose backend is still running after its session was failed
    lingering: Mutex<HashSet<String>>,
}

impl Inner {
    /// Run `f` on the device's session, if it still has one.
    fn with_slot<R>(&self, device_id: &str, f: impl FnOnce(&mut SessionSlot) -> R) -> Option<R> {
        let mut sessions = lock(&self.sessions);
        sessions.get_mut(device_id).map(f)
    }
}

#[derive(Clone)]
pub struct FlashOrchestrator {
    inner: Arc<Inner>,
}

impl FlashOrchestrator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        images: ImageDownloadManager,
        backend: Arc<dyn DeviceControl>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                images,
                backend,
                settings,
                sessions: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                lingering: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Open a session for `device_id` and make sure the image is on its way.
    pub async fn prepare(&self, device_id: &str) -> Result<FlashSession> {
        // Authorization may have changed since the last periodic scan
        self.inner.registry.rescan().await;
        let device = self
            .inner
            .registry
            .get(device_id)
            .ok_or_else(|| ConsoleError::Validation(format!("Device {device_id} not found")))?;
        if !device.adb_ready {
            return Err(ConsoleError::Validation(
                "USB debugging must be enabled first".to_string(),
            ));
        }

        let filename = self.inner.settings.image_filename.clone();
        let mut sessions = lock(&self.inner.sessions);
        if let Some(existing) = sessions.get(device_id) {
            return Err(ConsoleError::StateConflict(format!(
                "Device {device_id} already has a flash session ({})",
                existing.session.state
            )));
        }
        if lock(&self.inner.lingering).contains(device_id) {
            return Err(ConsoleError::StateConflict(format!(
                "Device {device_id} is still finishing a previous flash"
            )));
        }

        let outcome = self.inner.images.start_download(&filename)?;
        let mut slot = SessionSlot {
            session: FlashSession::new(device_id, &filename),
            worker: None,
            lease: None,
        };

        match outcome {
            StartOutcome::AlreadyExists => match self.inner.images.lease(&filename) {
                Ok(lease) => {
                    slot.lease = Some(lease);
                    slot.session.os_cached = true;
                    slot.session
                        .advance(FlashState::Cached, "OS image cached, ready to flash")?;
                }
                Err(e) => slot.session.fail(
                    "OS image disappeared from the cache",
                    Some(e.to_string()),
                    None,
                ),
            },
            StartOutcome::Started(rx) => follow_download(&self.inner, &mut slot, rx, true)?,
            StartOutcome::Attached(rx) => follow_download(&self.inner, &mut slot, rx, false)?,
        }

        if !self.inner.settings.requires_confirmation && slot.session.state.is_confirmable() {
            begin_flash(&self.inner, &mut slot)?;
        }

        info!(
            "Flash session {} opened for {} ({})",
            slot.session.session_id, device_id, slot.session.state
        );
        let snapshot = slot.session.clone();
        sessions.insert(device_id.to_string(), slot);
        Ok(snapshot)
    }

    /// Operator go-ahead: start writing the image to the device.
    pub fn confirm(&self, device_id: &str) -> Result<FlashSession> {
        let mut sessions = lock(&self.inner.sessions);
        let slot = sessions.get_mut(device_id).ok_or_else(|| {
            ConsoleError::StateConflict(format!("No flash session for device {device_id}"))
        })?;
        begin_flash(&self.inner, slot)?;
        Ok(slot.session.clone())
    }

    pub fn status(&self, device_id: &str) -> Option<FlashSession> {
        lock(&self.inner.sessions)
            .get(device_id)
            .map(|slot| slot.session.clone())
    }

    pub fn sessions(&self) -> Vec<FlashSession> {
        let mut sessions: Vec<_> = lock(&self.inner.sessions)
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        sessions
    }

    /// Dismiss a finished session and archive it.
    pub fn close(&self, device_id: &str) -> Result<FlashSession> {
        let slot = {
            let mut sessions = lock(&self.inner.sessions);
            match sessions.get(device_id).map(|slot| slot.session.state) {
                Some(state) if !state.is_terminal() => {
                    return Err(ConsoleError::StateConflict(format!(
                        "Cannot close a session in state {state}"
                    )));
                }
                _ => sessions.remove(device_id),
            }
        };
        let Some(slot) = slot else {
            return Err(ConsoleError::StateConflict(format!(
                "No flash session for device {device_id}"
            )));
        };
        let session = slot.session.clone();
        drop(slot);

        let mut history = lock(&self.inner.history);
        history.push_front(session.clone());
        history.truncate(self.inner.settings.history_limit);
        info!("Closed flash session {} for {}", session.session_id, device_id);
        Ok(session)
    }

    /// Archived sessions, newest first.
    pub fn history(&self) -> Vec<FlashSession> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    pub fn flash_status_of(&self, device_id: &str) -> DeviceFlashStatus {
        DeviceFlashStatus(
            lock(&self.inner.sessions)
                .get(device_id)
                .map(|slot| slot.session.state),
        )
    }

    /// Fill in each device's `flash_status` from its session.
    pub fn annotate(&self, devices: &mut [Device]) {
        let sessions = lock(&self.inner.sessions);
        for device in devices {
            device.flash_status =
                DeviceFlashStatus(sessions.get(&device.id).map(|slot| slot.session.state));
        }
    }
}

/// Move a confirmable session into flashing and hand it to the backend.
fn begin_flash(inner: &Arc<Inner>, slot: &mut SessionSlot) -> Result<()> {
    let state = slot.session.state;
    if !state.is_confirmable() {
        return Err(ConsoleError::StateConflict(format!(
            "Cannot confirm flash in state {state}"
        )));
    }

    let lease = match slot.lease.take() {
        Some(lease) => lease,
        None => match inner.images.lease(&slot.session.image) {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Image for {} is gone: {}", slot.session.device_id, e);
                slot.session.fail(
                    format!("OS image {} is no longer available", slot.session.image),
                    Some(e.to_string()),
                    None,
                );
                return Ok(());
            }
        },
    };

    slot.session
        .advance(FlashState::FlashingStarted, "Starting flash...")?;
    let image = lease.path().to_path_buf();
    slot.lease = Some(lease);

    // The previous worker may be the download watcher calling us; let it
    // finish instead of aborting it under its own feet.
    if let Some(previous) = slot.worker.take() {
        previous.detach();
    }
    slot.worker = Some(run_flash(
        Arc::clone(inner),
        slot.session.device_id.clone(),
        image,
    ));
    info!("Flash confirmed for {}", slot.session.device_id);
    Ok(())
}

fn follow_download(
    inner: &Arc<Inner>,
    slot: &mut SessionSlot,
    rx: watch::Receiver<DownloadTask>,
    own_transfer: bool,
) -> Result<()> {
    slot.session
        .advance(FlashState::Downloading, "Downloading OS image... 0%")?;
    slot.session.mirror_download(&rx.borrow());
    slot.worker = Some(watch_download(
        Arc::clone(inner),
        &slot.session.device_id,
        rx,
        own_transfer,
    ));
    Ok(())
}

/// Mirror a download task into the session until the task finishes.
fn watch_download(
    inner: Arc<Inner>,
    device_id: &str,
    mut rx: watch::Receiver<DownloadTask>,
    own_transfer: bool,
) -> SupervisedTask {
    let device_id = device_id.to_string();
    SupervisedTask::spawn("flash-download", move |cancel| async move {
        loop {
            let task = rx.borrow_and_update().clone();
            inner.with_slot(&device_id, |slot| {
                on_download_update(&inner, slot, &task, own_transfer)
            });
            if !task.is_active() {
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        inner.with_slot(&device_id, |slot| {
                            slot.session.fail("Download was abandoned", None, None)
                        });
                        return;
                    }
                }
            }
        }
    })
}

fn on_download_update(inner: &Arc<Inner>, slot: &mut SessionSlot, task: &DownloadTask, own_transfer: bool) {
    if slot.session.state != FlashState::Downloading {
        return;
    }

    match task.status {
        DownloadStatus::Downloading => slot.session.mirror_download(task),
        DownloadStatus::Error => {
            let reason = task.error.clone().unwrap_or_else(|| "unknown error".to_string());
            error!("Download for {} failed: {}", slot.session.device_id, reason);
            slot.session
                .fail(format!("Download failed: {reason}"), Some(reason), None);
        }
        DownloadStatus::Completed => {
            slot.session.mirror_download(task);
            let lease = match inner.images.lease(&task.filename) {
                Ok(lease) => lease,
                Err(e) => {
                    slot.session.fail(
                        "Downloaded image is missing from the cache",
                        Some(e.to_string()),
                        None,
                    );
                    return;
                }
            };
            slot.lease = Some(lease);
            slot.session.os_cached = true;

            let next = if own_transfer {
                FlashState::DownloadComplete
            } else {
                FlashState::AwaitingConfirmation
            };
            if let Err(e) = slot
                .session
                .advance(next, "OS image downloaded, ready to flash")
            {
                warn!("{}", e);
                return;
            }

            if !inner.settings.requires_confirmation {
                if let Err(e) = begin_flash(inner, slot) {
                    warn!("Automatic confirmation failed: {}", e);
                }
            }
        }
    }
}

/// Drive the backend and relay its events into the session.
///
/// A backend that goes quiet for `stall_timeout` fails the session, but is
/// never interrupted: a half-written device is worse than a late one. It keeps
/// running detached, holding the image lease, and the device cannot be
/// prepared again until it returns.
fn run_flash(inner: Arc<Inner>, device_id: String, image: PathBuf) -> SupervisedTask {
    SupervisedTask::spawn("flash", move |cancel| async move {
        let stall = inner.settings.stall_timeout;
        let (reporter, mut events) = progress_channel();
        let mut flash = {
            let backend = Arc::clone(&inner.backend);
            let device_id = device_id.clone();
            Box::pin(async move { backend.flash(&device_id, &image, reporter).await })
        };

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = &mut flash => break Some(result),
                Some(event) = events.recv() => apply_event(&inner, &device_id, event),
                _ = tokio::time::sleep(stall) => break None,
            }
        };
        while let Ok(event) = events.try_recv() {
            apply_event(&inner, &device_id, event);
        }

        let Some(result) = result else {
            let reason = format!("No progress from device for {stall:?}");
            error!("Flash of {} stalled: {}", device_id, reason);
            lock(&inner.lingering).insert(device_id.clone());
            let lease = inner
                .with_slot(&device_id, |slot| {
                    slot.session
                        .fail(format!("Flash failed: {reason}"), Some(reason.clone()), None);
                    slot.lease.take()
                })
                .flatten();

            tokio::spawn(async move {
                let outcome = flash.await;
                lock(&inner.lingering).remove(&device_id);
                drop(lease);
                match outcome {
                    Ok(()) => warn!("Stalled flash of {} finished after all", device_id),
                    Err(e) => warn!("Stalled flash of {} ended with: {}", device_id, e),
                }
            });
            return;
        };

        inner.with_slot(&device_id, |slot| {
            match result {
                Ok(()) => {
                    if let Err(e) = slot.session.complete("Flash completed successfully") {
                        slot.session.fail(e.to_string(), None, None);
                    }
                    info!("Flash of {} completed", device_id);
                }
                Err(e) => {
                    let trace = match &e {
                        ConsoleError::DeviceOperation { trace, .. } => trace.clone(),
                        _ => None,
                    };
                    error!("Flash of {} failed: {}", device_id, e);
                    slot.session
                        .fail(format!("Flash failed: {e}"), Some(e.to_string()), trace);
                }
            }
            slot.lease = None;
        });
    })
}

fn apply_event(inner: &Inner, device_id: &str, event: FlashEvent) {
    if event.state.is_terminal() {
        warn!("Ignoring terminal state {} reported by backend", event.state);
        return;
    }
    inner.with_slot(device_id, |slot| {
        if slot.session.state.is_terminal() {
            return;
        }
        match slot.session.advance(event.state, event.message) {
            Ok(()) => slot.session.report_progress(event.progress),
            Err(e) => debug!("Dropping backend event for {}: {}", device_id, e),
        }
    });
}
