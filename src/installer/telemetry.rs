//! Telemetry submission contract.
//!
//! The builder does not talk to any endpoint; it defines the payload the
//! ISO's `telemetryjob` submits when, and only when, consent was given.
//! Best-effort HTTPS POST, 10 second timeout, failures never fail the
//! install.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bumped when the payload shape changes.
pub const SCHEMA_VERSION: u32 = 1;

/// POST timeout on the installer side.
pub const SUBMIT_TIMEOUT_SECS: u64 = 10;

/// Logged by the job when it does nothing.
pub const SKIP_LOG_LINE: &str = "telemetry skipped: no consent";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
	/// `ssd`, `hdd` or `nvme`; never a model string.
	#[serde(rename = "type")]
	pub kind: String,
	pub size_bucket: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
	pub kernel: String,
	/// Vendor family only, e.g. `GenuineIntel-6`; no serials, no model
	/// names.
	pub cpu_family: String,
	pub ram_mib: u64,
	pub disks: Vec<DiskInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallChoices {
	pub locale: String,
	pub keyboard: String,
	pub timezone: String,
	pub raid_type: String,
	pub encryption: bool,
	pub hardening_profile: String,
}

/// The complete anonymized report. No hostnames, no MACs, no disk serials,
/// no pool names.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TelemetryReport {
	pub install_id: Uuid,
	pub iso_version: String,
	pub installer_version: String,
	pub status: String,
	pub hardware: HardwareInfo,
	pub choices: InstallChoices,
	pub schema_version: u32,
}

impl TelemetryReport {
	#[must_use]
	pub fn new(
		iso_version: String, installer_version: String, status: String, hardware: HardwareInfo,
		choices: InstallChoices,
	) -> Self {
		Self {
			install_id: Uuid::new_v4(),
			iso_version,
			installer_version,
			status,
			hardware,
			choices,
			schema_version: SCHEMA_VERSION,
		}
	}
}

/// Submission gate: consent plus a configured endpoint, nothing else.
#[must_use]
pub fn should_submit(consent: bool, endpoint: Option<&str>) -> bool {
	consent && endpoint.is_some_and(|e| !e.is_empty())
}

/// Disk sizes are bucketed so a payload can never fingerprint a machine.
#[must_use]
pub fn size_bucket(bytes: u64) -> &'static str {
	const GIB: u64 = 1024 * 1024 * 1024;
	match bytes {
		b if b < 256 * GIB => "lt-256g",
		b if b < 1024 * GIB => "256g-1t",
		b if b < 4096 * GIB => "1t-4t",
		_ => "gt-4t",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn report() -> TelemetryReport {
		TelemetryReport::new(
			"zforge-0.3".into(),
			"calamares-3.3".into(),
			"success".into(),
			HardwareInfo {
				kernel: "6.8.12-2-pve".into(),
				cpu_family: "GenuineIntel-6".into(),
				ram_mib: 65536,
				disks: vec![DiskInfo { kind: "nvme".into(), size_bucket: "1t-4t".into() }],
			},
			InstallChoices {
				locale: "en_US.UTF-8".into(),
				keyboard: "us".into(),
				timezone: "UTC".into(),
				raid_type: "mirror".into(),
				encryption: true,
				hardening_profile: "server".into(),
			},
		)
	}

	#[test]
	fn payload_carries_the_contract_fields_and_nothing_sneaky() {
		let json = serde_json::to_value(report()).unwrap();
		let obj = json.as_object().unwrap();
		let mut keys: Vec<_> = obj.keys().map(String::as_str).collect();
		keys.sort_unstable();
		assert_eq!(
			keys,
			[
				"choices",
				"hardware",
				"install_id",
				"installer_version",
				"iso_version",
				"schema_version",
				"status"
			]
		);
		assert_eq!(json["schema_version"], 1);
		assert_eq!(json["hardware"]["disks"][0]["type"], "nvme");
		// no PII-shaped fields anywhere
		let rendered = json.to_string();
		for forbidden in ["hostname", "serial", "mac", "ip_address"] {
			assert!(!rendered.contains(forbidden), "payload leaks {forbidden}");
		}
	}

	#[test]
	fn install_ids_are_random_per_report() {
		assert_ne!(report().install_id, report().install_id);
	}

	#[test]
	fn submission_gate_requires_consent_and_endpoint() {
		assert!(should_submit(true, Some("https://stats.example/submit")));
		assert!(!should_submit(false, Some("https://stats.example/submit")));
		assert!(!should_submit(true, None));
		assert!(!should_submit(true, Some("")));
	}

	#[test]
	fn buckets_cover_the_size_axis() {
		const GIB: u64 = 1024 * 1024 * 1024;
		assert_eq!(size_bucket(100 * GIB), "lt-256g");
		assert_eq!(size_bucket(512 * GIB), "256g-1t");
		assert_eq!(size_bucket(2 * 1024 * GIB), "1t-4t");
		assert_eq!(size_bucket(8 * 1024 * GIB), "gt-4t");
	}
}
