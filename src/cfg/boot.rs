//! Bootloader section of the build specification.
//!
//! The primary bootloader is always ZFSBootMenu; OpenCore is an optional
//! first stage for firmware that cannot boot NVMe devices directly.

use crate::errors::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// Primary bootloader. Fixed value; the field exists so the spec file reads
/// naturally and so an unknown value fails loudly.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PrimaryBootloader {
	#[default]
	Zfsbootmenu,
}

fn _default_opencore_drivers() -> Vec<String> {
	vec![String::from("OpenRuntime.efi"), String::from("NvmExpressDxe.efi")]
}

/// OpenCore chainload stage.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct OpenCoreConfig {
	pub enable_opencore: bool,
	/// EFI drivers loaded before the boot entry; NVMe support at minimum.
	pub drivers: Vec<String>,
	/// PCIe device path template for the NVMe boot target, e.g.
	/// `PciRoot(0x0)/Pci(0x1,0x0)/Pci(0x0,0x0)/NVMe(0x1,...)`. Hardware
	/// overlays supply this; a placeholder is written (with a warning) when
	/// absent.
	pub device_path_template: Option<String>,
}

impl Default for OpenCoreConfig {
	fn default() -> Self {
		Self {
			enable_opencore: false,
			drivers: _default_opencore_drivers(),
			device_path_template: None,
		}
	}
}

const fn _default_zbm_image_count() -> u32 {
	2
}

/// `bootloader_config` section.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct BootloaderConfig {
	pub primary: PrimaryBootloader,
	/// Build for UEFI firmware; legacy BIOS boot stays available on the ISO
	/// either way.
	pub uefi: bool,
	/// How many ZFSBootMenu EFI images the installer places on the ESP.
	pub zbm_image_count: u32,
	/// Extra kernel command line for ZFSBootMenu-booted kernels.
	pub kernel_cmdline: Option<String>,
	/// Serial console parameters requested by a hardware overlay, e.g.
	/// `console=ttyS0,115200n8`.
	pub serial_console: Option<String>,
	#[serde(rename = "opencore")]
	pub opencore: OpenCoreConfig,
}

impl Default for BootloaderConfig {
	fn default() -> Self {
		Self {
			primary: PrimaryBootloader::Zfsbootmenu,
			uefi: true,
			zbm_image_count: _default_zbm_image_count(),
			kernel_cmdline: None,
			serial_console: None,
			opencore: OpenCoreConfig::default(),
		}
	}
}

impl BootloaderConfig {
	/// # Errors
	/// [`BuildError::Validation`] when OpenCore is enabled without drivers.
	pub fn validate(&self) -> Result<()> {
		if self.opencore.enable_opencore && self.opencore.drivers.is_empty() {
			return Err(BuildError::validation(
				"opencore enabled but the driver list is empty (need at least OpenRuntime.efi and NvmExpressDxe.efi)",
			));
		}
		if self.zbm_image_count == 0 {
			return Err(BuildError::validation("zbm_image_count must be at least 1"));
		}
		Ok(())
	}

	/// Kernel command line for ZFSBootMenu entries, serial console folded in.
	#[must_use]
	pub fn zbm_cmdline(&self) -> String {
		let mut parts = vec!["quiet", "loglevel=4"];
		if let Some(serial) = self.serial_console.as_deref() {
			parts.push(serial);
		}
		if let Some(extra) = self.kernel_cmdline.as_deref() {
			parts.push(extra);
		}
		parts.join(" ")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_zbm_with_two_images() {
		let cfg = BootloaderConfig::default();
		assert_eq!(cfg.primary, PrimaryBootloader::Zfsbootmenu);
		assert_eq!(cfg.zbm_image_count, 2);
		assert!(!cfg.opencore.enable_opencore);
		cfg.validate().unwrap();
	}

	#[test]
	fn opencore_without_drivers_fails_validation() {
		let cfg = BootloaderConfig {
			opencore: OpenCoreConfig {
				enable_opencore: true,
				drivers: vec![],
				device_path_template: None,
			},
			..Default::default()
		};
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn serial_console_lands_in_cmdline() {
		let cfg = BootloaderConfig {
			serial_console: Some("console=ttyS0,115200n8".into()),
			kernel_cmdline: Some("elevator=none".into()),
			..Default::default()
		};
		let cmdline = cfg.zbm_cmdline();
		assert!(cmdline.contains("console=ttyS0,115200n8"));
		assert!(cmdline.ends_with("elevator=none"));
	}

	#[test]
	fn unknown_primary_is_fatal() {
		let err =
			serde_yaml::from_str::<BootloaderConfig>("primary: grub\n").unwrap_err();
		assert!(err.to_string().contains("grub"));
	}
}
