// USB enumeration via `lsusb` output

use once_cell::sync::Lazy;
use regex::Regex;

static LSUSB_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Bus (\d+) Device (\d+): ID ([0-9a-fA-F]{4}):([0-9a-fA-F]{4}) ?(.*)$")
        .expect("valid lsusb regex")
});

static SERIAL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*iSerial\s+\d+\s*(.*)$").expect("valid iSerial regex"));

/// A device as listed by `lsusb`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub bus: String,
    pub device_number: String,
    pub vendor_id: String,
    pub product_id: String,
    pub description: String,
    pub serial: Option<String>,
}

impl UsbDevice {
    /// Identifier used when the device has no readable serial.
    pub fn location_id(&self) -> String {
        format!("{}-{}", self.bus, self.device_number)
    }
}

/// Vendor ids of phone and tablet makers whose devices speak ADB.
const ANDROID_VENDOR_IDS: &[&str] = &[
    "18d1", // Google
    "04e8", // Samsung
    "0bb4", // HTC
    "22b8", // Motorola
    "1004", // LG
    "0fce", // Sony
    "2a70", // OnePlus
    "2717", // Xiaomi
    "12d1", // Huawei
    "17ef", // Lenovo
    "19d2", // ZTE
    "0b05", // Asus
    "2ae5", // Fairphone
    "05c6", // Qualcomm
    "0e8d", // MediaTek
    "1ebf", // Coolpad
    "2d95", // Vivo
    "22d9", // Oppo
];

pub fn is_android_vendor(vendor_id: &str) -> bool {
    ANDROID_VENDOR_IDS
        .iter()
        .any(|v| v.eq_ignore_ascii_case(vendor_id))
}

/// Parse the short listing printed by `lsusb`. Lines that don't match are
/// skipped.
pub fn parse_lsusb(output: &str) -> Vec<UsbDevice> {
    output
        .lines()
        .filter_map(|line| LSUSB_LINE.captures(line.trim()))
        .map(|caps| UsbDevice {
            bus: caps[1].to_string(),
            device_number: caps[2].to_string(),
            vendor_id: caps[3].to_ascii_lowercase(),
            product_id: caps[4].to_ascii_lowercase(),
            description: caps[5].trim().to_string(),
            serial: None,
        })
        .collect()
}

/// Extract the serial number from `lsusb -v -s bus:dev` output.
pub fn parse_serial(verbose: &str) -> Option<String> {
    SERIAL_LINE
        .captures(verbose)
        .map(|caps| caps[1].trim().to_string())
        .filter(|serial| !serial.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSUSB: &str = "\
Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub
Bus 001 Device 004: ID 18d1:4ee7 Google Inc. Nexus/Pixel Device (charging + debug)
Bus 001 Device 007: ID 04E8:6860 Samsung Electronics Co., Ltd Galaxy series, misc. (MTP mode)
Bus 001 Device 002: ID 8087:0a2b
garbage line
";

    #[test]
    fn parses_lsusb_listing() {
        let devices = parse_lsusb(LSUSB);
        assert_eq!(devices.len(), 4);

        let pixel = &devices[1];
        assert_eq!(pixel.bus, "001");
        assert_eq!(pixel.device_number, "004");
        assert_eq!(pixel.vendor_id, "18d1");
        assert_eq!(pixel.product_id, "4ee7");
        assert_eq!(pixel.description, "Google Inc. Nexus/Pixel Device (charging + debug)");
        assert_eq!(pixel.location_id(), "001-004");

        assert_eq!(devices[2].vendor_id, "04e8");
        assert_eq!(devices[3].description, "");
    }

    #[test]
    fn recognises_android_vendors() {
        assert!(is_android_vendor("18d1"));
        assert!(is_android_vendor("04E8"));
        assert!(!is_android_vendor("1d6b"));
        assert!(!is_android_vendor("8087"));
    }

    #[test]
    fn reads_serial_from_verbose_output() {
        let verbose = "\
Device Descriptor:
  bLength                18
  idVendor           0x18d1 Google Inc.
  iManufacturer           1 Google
  iProduct                2 Pixel 7
  iSerial                 3 2A131FDH2001B4
";
        assert_eq!(parse_serial(verbose).as_deref(), Some("2A131FDH2001B4"));

        let no_serial = "  iSerial                 0 \n";
        assert_eq!(parse_serial(no_serial), None);
        assert_eq!(parse_serial(""), None);
    }
}
