//! The validated build specification.
//!
//! YAML in, [`BuildPlan`] out. Unknown top-level sections are tolerated with
//! a warning; unknown keys inside the enumerated sections are fatal. Hardware
//! overlays are deep-merged before deserialization: maps recurse, scalars and
//! lists are replaced.

use super::builder::BuilderConfig;
use super::boot::BootloaderConfig;
use super::dracut::DracutConfig;
use super::hardening::HardeningProfile;
use super::modules::{canonical_modules, ModuleDecl, CANONICAL_PIPELINE};
use super::proxmox::ProxmoxConfig;
use super::zfs::ZfsConfig;
use crate::errors::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, trace, warn};

/// Top-level sections we understand. Anything else is accepted with a
/// warning so site-local annotations don't break builds.
const KNOWN_SECTIONS: &[&str] = &[
	"builder_config",
	"proxmox_config",
	"zfs_config",
	"bootloader_config",
	"dracut_config",
	"modules",
	"telemetry_endpoint",
	"security_hardening",
];

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct BuildPlan {
	pub builder_config: BuilderConfig,
	pub proxmox_config: ProxmoxConfig,
	pub zfs_config: ZfsConfig,
	pub bootloader_config: BootloaderConfig,
	pub dracut_config: DracutConfig,
	/// Ordered module pipeline; defaults to the canonical one.
	#[serde(default = "canonical_modules")]
	pub modules: Vec<ModuleDecl>,
	/// Where the installer submits anonymized reports, when consent is given.
	pub telemetry_endpoint: Option<String>,
	pub security_hardening: HardeningProfile,
}

impl BuildPlan {
	/// Load a specification plus optional hardware overlays.
	///
	/// An empty or absent file yields the all-defaults plan.
	///
	/// # Errors
	/// [`BuildError::Validation`] for YAML syntax errors, unknown enumerated
	/// values or unknown keys in the enumerated sections;
	/// [`BuildError::MissingRequired`] for an explicitly empty module list.
	pub fn load(path: &Path, overlays: &[impl AsRef<Path>]) -> Result<Self> {
		let mut doc = read_yaml(path)?;
		for overlay in overlays {
			let overlay = overlay.as_ref();
			debug!(?overlay, "Merging hardware overlay");
			let patch = read_yaml(overlay)?;
			deep_merge(&mut doc, patch);
		}
		Self::from_value(doc)
	}

	/// Deserialize and validate an already-merged YAML document.
	///
	/// # Errors
	/// See [`BuildPlan::load`].
	pub fn from_value(doc: serde_yaml::Value) -> Result<Self> {
		if let serde_yaml::Value::Mapping(map) = &doc {
			for key in map.keys() {
				if let serde_yaml::Value::String(key) = key {
					if !KNOWN_SECTIONS.contains(&key.as_str()) {
						warn!(section = %key, "Unknown top-level section in spec, ignoring");
					}
				}
			}
		}
		let plan: Self = serde_yaml::from_value(doc)
			.map_err(|e| BuildError::validation(format!("unknown option: {e}")))?;
		plan.validate()?;
		Ok(plan)
	}

	/// # Errors
	/// First offending field as [`BuildError::Validation`] /
	/// [`BuildError::MissingRequired`].
	pub fn validate(&self) -> Result<()> {
		self.zfs_config.validate()?;
		self.bootloader_config.validate()?;
		self.dracut_config.validate()?;

		if self.modules.is_empty() {
			return Err(BuildError::missing("module list is empty"));
		}
		for decl in &self.modules {
			if !CANONICAL_PIPELINE.contains(&decl.name.as_str()) {
				return Err(BuildError::validation(format!(
					"unknown pipeline module `{}`",
					decl.name
				)));
			}
		}
		if let Some(url) = self.telemetry_endpoint.as_deref() {
			if !(url.starts_with("https://") || url.starts_with("http://")) {
				return Err(BuildError::validation(format!(
					"telemetry_endpoint must be an http(s) URL, got `{url}`"
				)));
			}
		}
		Ok(())
	}

	/// Normalized YAML rendering of the plan; reloading it yields an
	/// identical plan.
	///
	/// # Errors
	/// Serialization failures (should not happen for a validated plan).
	pub fn to_normalized_yaml(&self) -> Result<String> {
		serde_yaml::to_string(self)
			.map_err(|e| BuildError::other(format!("serializing plan: {e}")))
	}

	/// Modules that will actually run, in order.
	pub fn enabled_modules(&self) -> impl Iterator<Item = &ModuleDecl> {
		self.modules.iter().filter(|m| m.enabled)
	}
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
	trace!(?path, "Reading YAML");
	let text = std::fs::read_to_string(path)?;
	if text.trim().is_empty() {
		return Ok(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
	}
	serde_yaml::from_str(&text)
		.map_err(|e| BuildError::validation(format!("{}: {e}", path.display())))
}

/// Deep-merge `patch` onto `base`: mappings recurse, everything else
/// (scalars, sequences) is replaced outright.
pub fn deep_merge(base: &mut serde_yaml::Value, patch: serde_yaml::Value) {
	match (base, patch) {
		(serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(patch_map)) => {
			for (key, value) in patch_map {
				if base_map.contains_key(&key) {
					if let Some(slot) = base_map.get_mut(&key) {
						deep_merge(slot, value);
					}
				} else {
					base_map.insert(key, value);
				}
			}
		},
		(slot, value) => *slot = value,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfg::builder::{DebianRelease, KernelSelector};
	use crate::cfg::dracut::DracutCompression;
	use crate::cfg::zfs::Compression;
	use pretty_assertions::assert_eq;

	fn plan_from(yaml: &str) -> Result<BuildPlan> {
		BuildPlan::from_value(serde_yaml::from_str(yaml).unwrap())
	}

	#[test]
	fn empty_spec_gets_all_defaults() {
		let plan = BuildPlan::from_value(serde_yaml::Value::Mapping(Default::default())).unwrap();
		assert_eq!(plan.builder_config.debian_release, DebianRelease::Bookworm);
		assert_eq!(plan.builder_config.kernel, KernelSelector::Latest);
		assert_eq!(plan.zfs_config.compression, Compression::Lz4);
		assert!(plan.zfs_config.build_from_source);
		assert_eq!(plan.dracut_config.compression, DracutCompression::Zstd);
		assert_eq!(plan.modules.len(), CANONICAL_PIPELINE.len());
		assert!(plan.modules.iter().all(|m| m.enabled));
	}

	#[test]
	fn unknown_top_level_section_is_tolerated() {
		let plan = plan_from("x_site_notes: hello\n").unwrap();
		assert_eq!(plan.builder_config.debian_release, DebianRelease::Bookworm);
	}

	#[test]
	fn unknown_key_in_enumerated_section_is_fatal() {
		let err = plan_from("zfs_config:\n  compresion: lz4\n").unwrap_err();
		assert!(matches!(err, BuildError::Validation(_)), "got {err}");
	}

	#[test]
	fn empty_module_list_is_missing_required() {
		let err = plan_from("modules: []\n").unwrap_err();
		assert!(matches!(err, BuildError::MissingRequired(_)), "got {err}");
	}

	#[test]
	fn unknown_module_name_is_fatal() {
		let err = plan_from("modules:\n  - warp_drive\n").unwrap_err();
		assert!(matches!(err, BuildError::Validation(_)), "got {err}");
	}

	#[test]
	fn overlay_replaces_scalars_and_lists() {
		let mut base: serde_yaml::Value = serde_yaml::from_str(
			"bootloader_config:\n  serial_console: null\n  opencore:\n    enable_opencore: false\n    drivers: [OpenRuntime.efi]\n",
		)
		.unwrap();
		let patch: serde_yaml::Value = serde_yaml::from_str(
			"bootloader_config:\n  serial_console: console=ttyS0,115200n8\n  opencore:\n    enable_opencore: true\n    drivers: [OpenRuntime.efi, NvmExpressDxe.efi]\n",
		)
		.unwrap();
		deep_merge(&mut base, patch);
		let plan = BuildPlan::from_value(base).unwrap();
		assert_eq!(
			plan.bootloader_config.serial_console.as_deref(),
			Some("console=ttyS0,115200n8")
		);
		assert!(plan.bootloader_config.opencore.enable_opencore);
		// list replaced, not concatenated
		assert_eq!(plan.bootloader_config.opencore.drivers.len(), 2);
	}

	#[test]
	fn normalized_plan_round_trips() {
		let plan = plan_from(
			"builder_config:\n  debian_release: trixie\n  kernel: 6.8.12-2-pve\nzfs_config:\n  compression: zstd-9\n  ashift: 12\n",
		)
		.unwrap();
		let yaml = plan.to_normalized_yaml().unwrap();
		let reloaded: BuildPlan = serde_yaml::from_str(&yaml).unwrap();
		assert_eq!(plan, reloaded);
	}

	#[test]
	fn telemetry_endpoint_must_be_url() {
		assert!(plan_from("telemetry_endpoint: ftp://x\n").is_err());
		let plan = plan_from("telemetry_endpoint: https://stats.example/submit\n").unwrap();
		assert_eq!(plan.telemetry_endpoint.as_deref(), Some("https://stats.example/submit"));
	}

	#[test]
	fn disabled_module_skips_but_keeps_order() {
		let plan = plan_from(
			"modules:\n  - workspace_setup\n  - name: debootstrap\n    enabled: false\n  - kernel_acquisition\n",
		)
		.unwrap();
		let enabled: Vec<_> = plan.enabled_modules().map(|m| m.name.as_str()).collect();
		assert_eq!(enabled, ["workspace_setup", "kernel_acquisition"]);
	}
}
