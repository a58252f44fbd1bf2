//! Dracut (initramfs) section of the build specification.

use crate::errors::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// Initramfs compression. Narrower set than dataset compression; dracut
/// passes these straight through to the image writer.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DracutCompression {
	#[default]
	Zstd,
	Gzip,
	Lz4,
	Xz,
}

impl DracutCompression {
	#[must_use]
	pub const fn flag(self) -> &'static str {
		match self {
			Self::Zstd => "--compress=zstd",
			Self::Gzip => "--compress=gzip",
			Self::Lz4 => "--compress=lz4",
			Self::Xz => "--compress=xz",
		}
	}
}

fn _default_dracut_modules() -> Vec<String> {
	["zfs", "systemd", "udev-rules", "base"].map(String::from).to_vec()
}

fn _default_kernel_cmdline() -> String {
	String::from("root=zfs:AUTO")
}

/// `dracut_config` section.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct DracutConfig {
	/// Dracut modules folded into the initramfs; `zfs` is mandatory.
	pub modules: Vec<String>,
	pub compression: DracutCompression,
	/// Host-only initramfs for the installed target; the live medium always
	/// gets a generic one.
	pub hostonly: bool,
	/// Baked-in kernel command line; must keep `root=zfs:AUTO`.
	pub kernel_cmdline: String,
	/// Extra kernel drivers forced into the image (e.g. HBA drivers the
	/// hardware overlay knows the machine needs).
	pub extra_drivers: Vec<String>,
}

impl Default for DracutConfig {
	fn default() -> Self {
		Self {
			modules: _default_dracut_modules(),
			compression: DracutCompression::default(),
			hostonly: false,
			kernel_cmdline: _default_kernel_cmdline(),
			extra_drivers: Vec::new(),
		}
	}
}

impl DracutConfig {
	/// # Errors
	/// [`BuildError::Validation`] when the `zfs` module or the
	/// `root=zfs:AUTO` parameter was configured away.
	pub fn validate(&self) -> Result<()> {
		if !self.modules.iter().any(|m| m == "zfs") {
			return Err(BuildError::validation("dracut module list must include `zfs`"));
		}
		if !self.kernel_cmdline.contains("root=zfs:") {
			return Err(BuildError::validation(
				"dracut kernel_cmdline must carry a root=zfs:... parameter",
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_pass_validation() {
		let cfg = DracutConfig::default();
		cfg.validate().unwrap();
		assert_eq!(cfg.compression, DracutCompression::Zstd);
		assert!(cfg.kernel_cmdline.contains("root=zfs:AUTO"));
	}

	#[test]
	fn dropping_zfs_module_is_fatal() {
		let cfg = DracutConfig { modules: vec!["base".into()], ..Default::default() };
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn unknown_compression_is_fatal() {
		let err = serde_yaml::from_str::<DracutConfig>("compression: brotli\n").unwrap_err();
		assert!(err.to_string().contains("brotli"));
	}
}
