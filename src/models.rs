// Data model shared by the server, the HTTP surface and the watch client.
//
// Every status value that crosses the wire is defined here exactly once; the
// orchestrator, the API handlers and the poller all reference these enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ConsoleError;

/// Version of the session state vocabulary. Bumped whenever a state is added
/// or renamed so clients can detect a server speaking a different dialect.
pub const SCHEMA_VERSION: u32 = 2;

/// Share of the overall session progress attributed to the download sub-phase.
const DOWNLOAD_SHARE: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdbStatus {
    Authorized,
    Unauthorized,
    Disabled,
    Unknown,
}

impl AdbStatus {
    /// Map a state column of `adb devices` onto the console vocabulary.
    /// Total: anything unrecognised becomes `Unknown`.
    pub fn from_adb_state(state: &str) -> Self {
        match state.trim() {
            "device" => AdbStatus::Authorized,
            "unauthorized" => AdbStatus::Unauthorized,
            _ => AdbStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub device_number: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub model: Option<String>,
    pub adb_status: AdbStatus,
    pub adb_ready: bool,
    #[serde(default)]
    pub flash_status: DeviceFlashStatus,
}

impl Device {
    pub fn new(id: impl Into<String>, description: impl Into<String>, adb_status: AdbStatus) -> Self {
        Self {
            id: id.into(),
            bus: None,
            device_number: None,
            serial: None,
            vendor_id: None,
            product_id: None,
            description: description.into(),
            model: None,
            adb_status,
            adb_ready: adb_status == AdbStatus::Authorized,
            flash_status: DeviceFlashStatus::default(),
        }
    }

    pub fn set_adb_status(&mut self, status: AdbStatus) {
        self.adb_status = status;
        self.adb_ready = status == AdbStatus::Authorized;
    }
}

/// Flash lifecycle states. `idle` is not a state: it is the absence of a
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashState {
    Preparing,
    Downloading,
    AwaitingConfirmation,
    DownloadComplete,
    Cached,
    FlashingStarted,
    Pushing,
    Flashing,
    Rebooting,
    Completed,
    Error,
}

impl FlashState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashState::Preparing => "preparing",
            FlashState::Downloading => "downloading",
            FlashState::AwaitingConfirmation => "awaiting_confirmation",
            FlashState::DownloadComplete => "download_complete",
            FlashState::Cached => "cached",
            FlashState::FlashingStarted => "flashing_started",
            FlashState::Pushing => "pushing",
            FlashState::Flashing => "flashing",
            FlashState::Rebooting => "rebooting",
            FlashState::Completed => "completed",
            FlashState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlashState::Completed | FlashState::Error)
    }

    /// States from which the operator may confirm the flash.
    pub fn is_confirmable(&self) -> bool {
        matches!(
            self,
            FlashState::AwaitingConfirmation | FlashState::DownloadComplete | FlashState::Cached
        )
    }

    /// States in which the device-control backend owns the device.
    pub fn is_flashing(&self) -> bool {
        matches!(
            self,
            FlashState::FlashingStarted
                | FlashState::Pushing
                | FlashState::Flashing
                | FlashState::Rebooting
        )
    }

    /// Overall progress a session has reached once it enters this state.
    pub fn base_progress(&self) -> u8 {
        match self {
            FlashState::Preparing | FlashState::Downloading | FlashState::Error => 0,
            FlashState::AwaitingConfirmation | FlashState::DownloadComplete | FlashState::Cached => {
                DOWNLOAD_SHARE
            }
            FlashState::FlashingStarted => 25,
            FlashState::Pushing => 30,
            FlashState::Flashing => 60,
            FlashState::Rebooting => 90,
            FlashState::Completed => 100,
        }
    }

    pub fn valid_next_states(&self) -> Vec<FlashState> {
        use FlashState::*;
        match self {
            Preparing => vec![Downloading, Cached, Error],
            Downloading => vec![DownloadComplete, AwaitingConfirmation, Error],
            AwaitingConfirmation | DownloadComplete | Cached => vec![FlashingStarted, Error],
            FlashingStarted => vec![Pushing, Flashing, Rebooting, Completed, Error],
            Pushing => vec![Flashing, Rebooting, Completed, Error],
            Flashing => vec![Rebooting, Completed, Error],
            Rebooting => vec![Completed, Error],
            Completed | Error => vec![],
        }
    }

    pub fn can_transition_to(&self, next: FlashState) -> bool {
        self.valid_next_states().contains(&next)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlashState {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use FlashState::*;
        [
            Preparing,
            Downloading,
            AwaitingConfirmation,
            DownloadComplete,
            Cached,
            FlashingStarted,
            Pushing,
            Flashing,
            Rebooting,
            Completed,
            Error,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
        .ok_or_else(|| ConsoleError::Validation(format!("Unknown flash state: {s}")))
    }
}

/// Flash status as shown on a device: `idle` or the state of its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DeviceFlashStatus(pub Option<FlashState>);

impl DeviceFlashStatus {
    pub fn is_idle(&self) -> bool {
        self.0.is_none()
    }
}

impl From<DeviceFlashStatus> for String {
    fn from(status: DeviceFlashStatus) -> Self {
        status.0.map_or("idle", |s| s.as_str()).to_string()
    }
}

impl TryFrom<String> for DeviceFlashStatus {
    type Error = ConsoleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "idle" {
            return Ok(DeviceFlashStatus(None));
        }
        value.parse().map(|state| DeviceFlashStatus(Some(state)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashSession {
    pub session_id: Uuid,
    pub device_id: String,
    pub state: FlashState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
    pub os_cached: bool,
    pub image: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl FlashSession {
    pub fn new(device_id: impl Into<String>, image: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            device_id: device_id.into(),
            state: FlashState::Preparing,
            progress: 0,
            download_progress: None,
            downloaded_bytes: None,
            total_bytes: None,
            message: "Preparing flash...".to_string(),
            error_detail: None,
            error_trace: None,
            os_cached: false,
            image: image.into(),
            started_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    /// Re-entering the current state only refreshes the message.
    pub fn advance(&mut self, next: FlashState, message: impl Into<String>) -> crate::Result<()> {
        if next != self.state {
            if !self.state.can_transition_to(next) {
                return Err(ConsoleError::StateConflict(format!(
                    "Invalid transition from {} to {}",
                    self.state, next
                )));
            }
            self.state = next;
            self.progress = self.progress.max(next.base_progress());
            if next != FlashState::Downloading {
                self.download_progress = None;
                self.downloaded_bytes = None;
                self.total_bytes = None;
            }
        }
        self.message = message.into();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Raise progress reported mid-state. Never decreases and never reaches
    /// 100 before the session completes.
    pub fn report_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(99));
        self.updated_at = Utc::now();
    }

    /// Mirror a download task into the session's download fields.
    pub fn mirror_download(&mut self, task: &DownloadTask) {
        if self.state != FlashState::Downloading {
            return;
        }
        let pct = self.download_progress.unwrap_or(0).max(task.progress);
        self.download_progress = Some(pct);
        self.downloaded_bytes = Some(task.downloaded_bytes);
        self.total_bytes = (task.total_bytes > 0).then_some(task.total_bytes);
        self.progress = self
            .progress
            .max((u16::from(pct) * u16::from(DOWNLOAD_SHARE) / 100) as u8);
        self.message = format!("Downloading OS image... {pct}%");
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, message: impl Into<String>) -> crate::Result<()> {
        self.advance(FlashState::Completed, message)?;
        self.progress = 100;
        Ok(())
    }

    /// Terminal failure: keeps the progress reached so far.
    pub fn fail(&mut self, message: impl Into<String>, detail: Option<String>, trace: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        let message = message.into();
        self.state = FlashState::Error;
        self.message = if message.is_empty() {
            "Flash failed".to_string()
        } else {
            message
        };
        self.error_detail = detail;
        self.error_trace = trace;
        self.download_progress = None;
        self.downloaded_bytes = None;
        self.total_bytes = None;
        self.updated_at = Utc::now();
    }
}

/// A cached, ready-to-flash image in the cache directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsImage {
    pub filename: String,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub filename: String,
    pub status: DownloadStatus,
    pub progress: u8,
    pub downloaded_bytes: u64,
    /// Zero while the size is unknown.
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: DownloadStatus::Downloading,
            progress: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == DownloadStatus::Downloading
    }
}
