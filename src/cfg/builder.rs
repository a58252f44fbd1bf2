//! `builder_config` section: base system, kernel selection, workspace
//! behavior.

use crate::errors::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Debian releases we know how to debootstrap for Proxmox.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebianRelease {
	Bullseye,
	#[default]
	Bookworm,
	Trixie,
}

impl DebianRelease {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Bullseye => "bullseye",
			Self::Bookworm => "bookworm",
			Self::Trixie => "trixie",
		}
	}
}

impl fmt::Display for DebianRelease {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// `latest` or a concrete package version token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KernelSelector {
	#[default]
	Latest,
	Version(String),
}

impl fmt::Display for KernelSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Latest => f.write_str("latest"),
			Self::Version(v) => f.write_str(v),
		}
	}
}

impl FromStr for KernelSelector {
	type Err = BuildError;

	fn from_str(s: &str) -> Result<Self> {
		if s.is_empty() {
			return Err(BuildError::validation("kernel selector may not be empty"));
		}
		if s == "latest" {
			Ok(Self::Latest)
		} else {
			Ok(Self::Version(s.to_owned()))
		}
	}
}

impl Serialize for KernelSelector {
	fn serialize<S: serde::Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
		ser.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for KernelSelector {
	fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(de)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

fn _default_build_name() -> String {
	String::from("zforge")
}

fn _default_version_tag() -> String {
	String::from("dev")
}

const fn _default_watchdog_minutes() -> u64 {
	15
}

/// `builder_config` section of the specification.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct BuilderConfig {
	pub debian_release: DebianRelease,
	pub kernel: KernelSelector,
	/// Keep downloaded packages under the workspace `cache/` across builds.
	pub cache_packages: bool,
	/// Image name; lands in the ISO volume label.
	pub build_name: String,
	/// Version tag folded into the label and output file name.
	pub version_tag: String,
	/// Minutes a subprocess may go silent before the watchdog pulls it.
	pub watchdog_idle_minutes: u64,
	/// Compression for the live rootfs squashfs.
	pub squashfs_compression: crate::cfg::dracut::DracutCompression,
	/// Optional directory of extra tooling (benchmark scripts etc.) copied
	/// into the live image verbatim.
	pub extra_tools: Option<std::path::PathBuf>,
}

impl Default for BuilderConfig {
	fn default() -> Self {
		Self {
			debian_release: DebianRelease::default(),
			kernel: KernelSelector::Latest,
			cache_packages: true,
			build_name: _default_build_name(),
			version_tag: _default_version_tag(),
			watchdog_idle_minutes: _default_watchdog_minutes(),
			squashfs_compression: crate::cfg::dracut::DracutCompression::default(),
			extra_tools: None,
		}
	}
}

impl BuilderConfig {
	/// ISO volume label, e.g. `ZFORGE-DEV`.
	#[must_use]
	pub fn volume_id(&self) -> String {
		format!("{}-{}", self.build_name, self.version_tag).to_uppercase().replace(' ', "-")
	}

	#[must_use]
	pub const fn watchdog_idle(&self) -> std::time::Duration {
		std::time::Duration::from_secs(self.watchdog_idle_minutes * 60)
	}
}
