// Device discovery and ADB authorization tracking
//
// The registry keeps a snapshot of attached devices that is replaced as a
// whole on every rescan. Discovery itself goes through `DeviceProbe` so the
// registry can be driven by `lsusb`/`adb` in production and by fixtures in
// tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{ConsoleError, Result};
use crate::models::{AdbStatus, Device};
use crate::task::SupervisedTask;

pub mod adb;
pub mod usb;

pub use adb::{AdbEntry, parse_adb_devices};
pub use usb::{UsbDevice, is_android_vendor, parse_lsusb, parse_serial};

/// Source of raw device listings.
pub trait DeviceProbe: Send + Sync {
    fn usb_devices(&self) -> BoxFuture<'_, Result<Vec<UsbDevice>>>;
    fn adb_devices(&self) -> BoxFuture<'_, Result<Vec<AdbEntry>>>;
}

/// Probe backed by the `lsusb` and `adb` executables.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    lsusb_path: PathBuf,
    adb_path: PathBuf,
}

impl SystemProbe {
    pub fn new(lsusb_path: impl Into<PathBuf>, adb_path: impl Into<PathBuf>) -> Self {
        Self {
            lsusb_path: lsusb_path.into(),
            adb_path: adb_path.into(),
        }
    }

    async fn run(&self, program: &PathBuf, args: &[&str]) -> Result<Output> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ConsoleError::Config(format!("Failed to run {}: {}", program.display(), e))
            })?;

        if !output.status.success() {
            return Err(ConsoleError::Api(format!(
                "{} {} failed: {}",
                program.display(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    async fn list_usb(&self) -> Result<Vec<UsbDevice>> {
        let output = self.run(&self.lsusb_path, &[]).await?;
        let mut devices = parse_lsusb(&String::from_utf8_lossy(&output.stdout));

        // Serials are only needed to pair USB devices with adb entries
        for device in devices.iter_mut().filter(|d| is_android_vendor(&d.vendor_id)) {
            let selector = format!("{}:{}", device.bus, device.device_number);
            match self.run(&self.lsusb_path, &["-v", "-s", &selector]).await {
                Ok(verbose) => {
                    device.serial = parse_serial(&String::from_utf8_lossy(&verbose.stdout));
                }
                Err(e) => debug!("Could not read serial for {}: {}", selector, e),
            }
        }

        debug!("Found {} USB devices", devices.len());
        Ok(devices)
    }

    async fn list_adb(&self) -> Result<Vec<AdbEntry>> {
        let output = self.run(&self.adb_path, &["devices", "-l"]).await?;
        Ok(parse_adb_devices(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl DeviceProbe for SystemProbe {
    fn usb_devices(&self) -> BoxFuture<'_, Result<Vec<UsbDevice>>> {
        Box::pin(self.list_usb())
    }

    fn adb_devices(&self) -> BoxFuture<'_, Result<Vec<AdbEntry>>> {
        Box::pin(self.list_adb())
    }
}

/// Combine both listings into console devices.
///
/// `adb` is `None` when the adb query failed; Android devices then report
/// `unknown` rather than `disabled`.
///
/// Without root some `lsusb -v` builds cannot read `iSerial`, so a phone that
/// adb sees over USB shows up on the USB side without a serial. Such devices
/// are assumed to be the unpaired USB adb entries and are not listed a second
/// time as `disabled`. A serial-less phone is only listed when there are more
/// of them than unpaired entries; which one is then shown is arbitrary.
pub fn merge_listings(usb: &[UsbDevice], adb: Option<&[AdbEntry]>) -> Vec<Device> {
    let mut by_serial: HashMap<&str, &AdbEntry> = adb
        .unwrap_or_default()
        .iter()
        .map(|entry| (entry.serial.as_str(), entry))
        .collect();

    let mut devices = Vec::new();
    let mut serial_less = Vec::new();

    for usb_device in usb {
        let entry = usb_device
            .serial
            .as_deref()
            .and_then(|serial| by_serial.remove(serial));

        let status = match (entry, adb.is_some()) {
            (Some(entry), _) => entry.status(),
            (None, _) if !is_android_vendor(&usb_device.vendor_id) => continue,
            (None, true) if usb_device.serial.is_none() => {
                serial_less.push(usb_device);
                continue;
            }
            (None, true) => AdbStatus::Disabled,
            (None, false) => AdbStatus::Unknown,
        };
        devices.push(usb_listed_device(usb_device, status, entry));
    }

    // Network transports are "host:port" and never appear on the USB bus
    let unpaired_usb_entries = by_serial
        .keys()
        .filter(|serial| !serial.contains(':'))
        .count();
    for usb_device in serial_less.into_iter().skip(unpaired_usb_entries) {
        devices.push(usb_listed_device(usb_device, AdbStatus::Disabled, None));
    }

    // adb devices not seen on the local USB listing
    let mut remaining: Vec<&AdbEntry> = by_serial.into_values().collect();
    remaining.sort_by(|a, b| a.serial.cmp(&b.serial));
    for entry in remaining {
        let description = entry.model.clone().unwrap_or_else(|| "Unknown".to_string());
        let mut device = Device::new(entry.serial.clone(), description, entry.status());
        device.serial = Some(entry.serial.clone());
        device.model = entry.model.clone();
        devices.push(device);
    }

    devices.sort_by(|a, b| {
        (a.bus.is_none(), &a.bus, &a.device_number, &a.id).cmp(&(
            b.bus.is_none(),
            &b.bus,
            &b.device_number,
            &b.id,
        ))
    });
    devices
}

fn usb_listed_device(usb_device: &UsbDevice, status: AdbStatus, entry: Option<&AdbEntry>) -> Device {
    let id = usb_device
        .serial
        .clone()
        .unwrap_or_else(|| usb_device.location_id());
    let mut device = Device::new(id, usb_device.description.clone(), status);
    device.bus = Some(usb_device.bus.clone());
    device.device_number = Some(usb_device.device_number.clone());
    device.serial = usb_device.serial.clone();
    device.vendor_id = Some(usb_device.vendor_id.clone());
    device.product_id = Some(usb_device.product_id.clone());
    device.model = entry.and_then(|e| e.model.clone());
    device
}

#[derive(Debug, Default)]
struct Snapshot {
    devices: Vec<Device>,
    last_error: Option<String>,
    scanned_at: Option<DateTime<Utc>>,
}

pub struct DeviceRegistry {
    probe: Arc<dyn DeviceProbe>,
    snapshot: RwLock<Snapshot>,
}

impl DeviceRegistry {
    pub fn new(probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            probe,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Query the probe and replace the snapshot. Failures degrade to whatever
    /// could still be listed and are kept in `last_error`.
    pub async fn rescan(&self) -> Vec<Device> {
        let (usb, adb) = tokio::join!(self.probe.usb_devices(), self.probe.adb_devices());

        let mut errors = Vec::new();
        let usb = usb.unwrap_or_else(|e| {
            error!("Failed to enumerate USB devices: {}", e);
            errors.push(format!("USB enumeration failed: {e}"));
            Vec::new()
        });
        let adb = adb
            .map_err(|e| {
                error!("Failed to query adb: {}", e);
                errors.push(format!("ADB query failed: {e}"));
            })
            .ok();

        let devices = merge_listings(&usb, adb.as_deref());
        let last_error = (!errors.is_empty()).then(|| errors.join("; "));

        let mut snapshot = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if snapshot.devices.len() != devices.len() {
            info!("Device count changed: {} -> {}", snapshot.devices.len(), devices.len());
        }
        snapshot.devices = devices.clone();
        snapshot.last_error = last_error;
        snapshot.scanned_at = Some(Utc::now());
        devices
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn list(&self) -> Vec<Device> {
        self.read().devices.clone()
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.read().devices.iter().find(|d| d.id == id).cloned()
    }

    pub fn last_error(&self) -> Option<String> {
        self.read().last_error.clone()
    }

    pub fn scanned_at(&self) -> Option<DateTime<Utc>> {
        self.read().scanned_at
    }

    /// Rescan every `interval` until the returned handle is dropped.
    pub fn spawn_rescan_loop(self: &Arc<Self>, interval: Duration) -> SupervisedTask {
        let registry = Arc::clone(self);
        SupervisedTask::spawn("device-rescan", move |cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.rescan().await;
                    }
                }
            }
            warn!("Device rescan loop stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Probe returning whatever the test put in it.
    pub struct FakeProbe {
        pub usb: Mutex<Result<Vec<UsbDevice>, String>>,
        pub adb: Mutex<Result<Vec<AdbEntry>, String>>,
    }

    impl FakeProbe {
        pub fn with_adb(entries: Vec<AdbEntry>) -> Self {
            Self {
                usb: Mutex::new(Ok(Vec::new())),
                adb: Mutex::new(Ok(entries)),
            }
        }

        pub fn set_adb(&self, entries: Vec<AdbEntry>) {
            *self.adb.lock().unwrap() = Ok(entries);
        }
    }

    pub fn adb_entry(serial: &str, state: &str) -> AdbEntry {
        AdbEntry {
            serial: serial.to_string(),
            state: state.to_string(),
            model: Some("Pixel 7".to_string()),
            product: None,
            transport_id: None,
        }
    }

    impl DeviceProbe for FakeProbe {
        fn usb_devices(&self) -> BoxFuture<'_, Result<Vec<UsbDevice>>> {
            let result = self.usb.lock().unwrap().clone().map_err(ConsoleError::Api);
            Box::pin(async move { result })
        }

        fn adb_devices(&self) -> BoxFuture<'_, Result<Vec<AdbEntry>>> {
            let result = self.adb.lock().unwrap().clone().map_err(ConsoleError::Api);
            // Suspend once like a real subprocess would, so concurrent
            // callers interleave around the scan
            Box::pin(async move {
                tokio::task::yield_now().await;
                result
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeProbe, adb_entry};
    use super::*;
    use std::sync::Mutex;

    fn usb(bus: &str, dev: &str, vendor: &str, serial: Option<&str>) -> UsbDevice {
        UsbDevice {
            bus: bus.into(),
            device_number: dev.into(),
            vendor_id: vendor.into(),
            product_id: "4ee7".into(),
            description: "Google Inc. Pixel".into(),
            serial: serial.map(str::to_string),
        }
    }

    #[test]
    fn merge_pairs_usb_and_adb_by_serial() {
        let usb_devices = vec![
            usb("001", "007", "18d1", Some("SERIAL-B")),
            usb("001", "004", "18d1", Some("SERIAL-A")),
            usb("001", "009", "04e8", None),
            usb("002", "001", "1d6b", None),
        ];
        let adb = vec![
            adb_entry("SERIAL-A", "device"),
            adb_entry("SERIAL-B", "unauthorized"),
            adb_entry("192.168.1.20:5555", "device"),
        ];

        let devices = merge_listings(&usb_devices, Some(&adb));
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["SERIAL-A", "SERIAL-B", "001-009", "192.168.1.20:5555"]);

        assert_eq!(devices[0].adb_status, AdbStatus::Authorized);
        assert!(devices[0].adb_ready);
        assert_eq!(devices[0].model.as_deref(), Some("Pixel 7"));
        assert_eq!(devices[1].adb_status, AdbStatus::Unauthorized);
        assert_eq!(devices[2].adb_status, AdbStatus::Disabled);
        assert_eq!(devices[3].bus, None);
        assert_eq!(devices[3].description, "Pixel 7");

        for device in &devices {
            assert_eq!(device.adb_ready, device.adb_status == AdbStatus::Authorized);
        }
    }

    #[test]
    fn unreadable_usb_serial_does_not_duplicate_the_phone() {
        let usb_devices = vec![usb("001", "004", "18d1", None)];
        let adb = vec![adb_entry("SERIAL-A", "device")];

        let devices = merge_listings(&usb_devices, Some(&adb));
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "SERIAL-A");
        assert!(devices[0].adb_ready);

        // A network transport cannot account for a phone on the bus
        let adb = vec![adb_entry("192.168.1.20:5555", "device")];
        let devices = merge_listings(&usb_devices, Some(&adb));
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["001-004", "192.168.1.20:5555"]);
        assert_eq!(devices[0].adb_status, AdbStatus::Disabled);

        // Two phones, one seen by adb: the other still shows up
        let usb_devices = vec![usb("001", "004", "18d1", None), usb("001", "005", "18d1", None)];
        let adb = vec![adb_entry("SERIAL-A", "unauthorized")];
        let devices = merge_listings(&usb_devices, Some(&adb));
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].adb_status, AdbStatus::Disabled);
        assert_eq!(devices[1].id, "SERIAL-A");
    }

    #[test]
    fn merge_without_adb_reports_unknown() {
        let devices = merge_listings(&[usb("001", "004", "18d1", Some("S"))], None);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].adb_status, AdbStatus::Unknown);
        assert!(!devices[0].adb_ready);
    }

    #[tokio::test]
    async fn rescan_reflects_authorization_changes() {
        let probe = Arc::new(FakeProbe::with_adb(vec![adb_entry("D1", "unauthorized")]));
        let registry = DeviceRegistry::new(probe.clone());

        registry.rescan().await;
        assert!(!registry.get("D1").unwrap().adb_ready);
        assert!(registry.scanned_at().is_some());

        probe.set_adb(vec![adb_entry("D1", "device")]);
        registry.rescan().await;
        assert!(registry.get("D1").unwrap().adb_ready);

        probe.set_adb(vec![]);
        registry.rescan().await;
        assert!(registry.get("D1").is_none());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn enumeration_failure_degrades_to_empty_list() {
        let probe = Arc::new(FakeProbe {
            usb: Mutex::new(Err("lsusb: not found".into())),
            adb: Mutex::new(Err("adb: not found".into())),
        });
        let registry = DeviceRegistry::new(probe);

        let devices = registry.rescan().await;
        assert!(devices.is_empty());
        let error = registry.last_error().unwrap();
        assert!(error.contains("USB enumeration failed"));
        assert!(error.contains("ADB query failed"));
    }

    #[tokio::test]
    async fn usb_failure_still_lists_adb_devices() {
        let probe = Arc::new(FakeProbe {
            usb: Mutex::new(Err("lsusb: not found".into())),
            adb: Mutex::new(Ok(vec![adb_entry("D1", "device")])),
        });
        let registry = DeviceRegistry::new(probe);

        let devices = registry.rescan().await;
        assert_eq!(devices.len(), 1);
        assert!(registry.last_error().is_some());
    }

    #[tokio::test]
    async fn rescan_loop_picks_up_hotplug() {
        let probe = Arc::new(FakeProbe::with_adb(vec![]));
        let registry = Arc::new(DeviceRegistry::new(probe.clone()));
        let handle = registry.spawn_rescan_loop(Duration::from_millis(10));

        probe.set_adb(vec![adb_entry("D1", "device")]);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.get("D1").is_some());

        drop(handle);
        probe.set_adb(vec![]);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(registry.get("D1").is_some());
    }
}
