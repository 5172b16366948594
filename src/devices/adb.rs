// ADB enumeration via `adb devices -l` output

use crate::models::AdbStatus;

/// One line of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbEntry {
    pub serial: String,
    /// Raw state column: `device`, `unauthorized`, `offline`, ...
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub transport_id: Option<String>,
}

impl AdbEntry {
    pub fn status(&self) -> AdbStatus {
        AdbStatus::from_adb_state(&self.state)
    }
}

/// Parse `adb devices -l`. The header, daemon chatter (`* daemon ...`) and
/// blank lines are skipped.
pub fn parse_adb_devices(output: &str) -> Vec<AdbEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') || line.starts_with("List of devices") {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        let serial = parts[0].to_string();
        let (state, rest) = if parts[1] == "no" && parts.get(2) == Some(&"permissions") {
            ("no permissions".to_string(), &parts[3..])
        } else {
            (parts[1].to_string(), &parts[2..])
        };

        let mut entry = AdbEntry {
            serial,
            state,
            model: None,
            product: None,
            transport_id: None,
        };

        for part in rest {
            if let Some((key, value)) = part.split_once(':') {
                match key {
                    "model" => entry.model = Some(value.replace('_', " ")),
                    "product" => entry.product = Some(value.to_string()),
                    "transport_id" => entry.transport_id = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        entries.push(entry);
    }

    entries
}
