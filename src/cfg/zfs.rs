//! ZFS options of the build specification: pool defaults, compression,
//! encryption. These values flow both into the built image (dracut, installer
//! defaults) and into the installer-side pool creation contract.

use crate::errors::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// vdev topology for the target pool.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
	/// Plain striping, no redundancy.
	Stripe,
	#[default]
	Mirror,
	Raidz1,
	Raidz2,
	Raidz3,
}

impl RaidLevel {
	/// The vdev keyword passed to `zpool create`, `None` for a stripe.
	#[must_use]
	pub const fn vdev_keyword(self) -> Option<&'static str> {
		match self {
			Self::Stripe => None,
			Self::Mirror => Some("mirror"),
			Self::Raidz1 => Some("raidz1"),
			Self::Raidz2 => Some("raidz2"),
			Self::Raidz3 => Some("raidz3"),
		}
	}

	/// Smallest number of disks that makes this topology valid.
	#[must_use]
	pub const fn min_disks(self) -> usize {
		match self {
			Self::Stripe => 1,
			Self::Mirror | Self::Raidz1 => 2,
			Self::Raidz2 => 3,
			Self::Raidz3 => 4,
		}
	}
}

/// Dataset compression: `lz4`, `zstd`, `zstd-N` (1..=19), `gzip`, `gzip-N`,
/// `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
	Lz4,
	Zstd(Option<u8>),
	Gzip(Option<u8>),
	Off,
}

impl Default for Compression {
	fn default() -> Self {
		Self::Lz4
	}
}

impl fmt::Display for Compression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Lz4 => write!(f, "lz4"),
			Self::Zstd(None) => write!(f, "zstd"),
			Self::Zstd(Some(n)) => write!(f, "zstd-{n}"),
			Self::Gzip(None) => write!(f, "gzip"),
			Self::Gzip(Some(n)) => write!(f, "gzip-{n}"),
			Self::Off => write!(f, "off"),
		}
	}
}

impl FromStr for Compression {
	type Err = BuildError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"lz4" => return Ok(Self::Lz4),
			"zstd" => return Ok(Self::Zstd(None)),
			"gzip" => return Ok(Self::Gzip(None)),
			"off" => return Ok(Self::Off),
			_ => {},
		}
		if let Some(level) = s.strip_prefix("zstd-") {
			let level: u8 = level
				.parse()
				.map_err(|_| BuildError::validation(format!("bad zstd level in `{s}`")))?;
			if !(1..=19).contains(&level) {
				return Err(BuildError::validation(format!(
					"zstd level {level} out of range 1..=19"
				)));
			}
			return Ok(Self::Zstd(Some(level)));
		}
		if let Some(level) = s.strip_prefix("gzip-") {
			let level: u8 = level
				.parse()
				.map_err(|_| BuildError::validation(format!("bad gzip level in `{s}`")))?;
			if !(1..=9).contains(&level) {
				return Err(BuildError::validation(format!(
					"gzip level {level} out of range 1..=9"
				)));
			}
			return Ok(Self::Gzip(Some(level)));
		}
		Err(BuildError::validation(format!("unknown compression `{s}`")))
	}
}

impl Serialize for Compression {
	fn serialize<S: serde::Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
		ser.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Compression {
	fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(de)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// Pool sector alignment exponent: `auto` or 9/12/13.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ashift {
	#[default]
	Auto,
	Fixed(u8),
}

impl fmt::Display for Ashift {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Auto => write!(f, "auto"),
			Self::Fixed(n) => write!(f, "{n}"),
		}
	}
}

impl FromStr for Ashift {
	type Err = BuildError;

	fn from_str(s: &str) -> Result<Self> {
		if s == "auto" {
			return Ok(Self::Auto);
		}
		match s.parse::<u8>() {
			Ok(n @ (9 | 12 | 13)) => Ok(Self::Fixed(n)),
			_ => Err(BuildError::validation(format!("ashift must be auto, 9, 12 or 13, got `{s}`"))),
		}
	}
}

impl Serialize for Ashift {
	fn serialize<S: serde::Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
		match self {
			Self::Auto => ser.serialize_str("auto"),
			Self::Fixed(n) => ser.serialize_str(&n.to_string()),
		}
	}
}

impl<'de> Deserialize<'de> for Ashift {
	fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
		// YAML may hand us a bare integer or a string
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Num(i64),
			Str(String),
		}
		match Raw::deserialize(de)? {
			Raw::Num(n) => Ashift::from_str(&n.to_string()).map_err(serde::de::Error::custom),
			Raw::Str(s) => Ashift::from_str(&s).map_err(serde::de::Error::custom),
		}
	}
}

/// ARC ceiling: `auto` or an absolute byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArcMax {
	#[default]
	Auto,
	Bytes(u64),
}

impl fmt::Display for ArcMax {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Auto => write!(f, "auto"),
			Self::Bytes(n) => write!(f, "{n}"),
		}
	}
}

impl Serialize for ArcMax {
	fn serialize<S: serde::Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
		match self {
			Self::Auto => ser.serialize_str("auto"),
			Self::Bytes(n) => ser.serialize_u64(*n),
		}
	}
}

impl<'de> Deserialize<'de> for ArcMax {
	fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Num(i64),
			Str(String),
		}
		match Raw::deserialize(de)? {
			Raw::Num(n) => u64::try_from(n).map(ArcMax::Bytes).map_err(|_| {
				serde::de::Error::custom(format!("arc_max may not be negative ({n})"))
			}),
			Raw::Str(s) if s == "auto" => Ok(ArcMax::Auto),
			Raw::Str(s) => s
				.parse::<u64>()
				.map(ArcMax::Bytes)
				.map_err(|_| serde::de::Error::custom(format!("arc_max must be bytes or `auto`, got `{s}`"))),
		}
	}
}

fn _default_encryption_algorithm() -> String {
	String::from("aes-256-gcm")
}

const fn _default_pbkdf_iterations() -> u32 {
	350_000
}

const fn _default_true() -> bool {
	true
}

/// Defaults offered by the installer when the operator enables encryption.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EncryptionDefaults {
	#[serde(default)]
	pub enabled_by_default: bool,
	#[serde(default = "_default_encryption_algorithm")]
	pub algorithm: String,
	#[serde(default = "_default_pbkdf_iterations")]
	pub pbkdf_iterations: u32,
	/// Leave the pool with `keylocation=prompt` so boot asks for the
	/// passphrase.
	#[serde(default = "_default_true")]
	pub prompt_at_boot: bool,
}

impl Default for EncryptionDefaults {
	fn default() -> Self {
		Self {
			enabled_by_default: false,
			algorithm: _default_encryption_algorithm(),
			pbkdf_iterations: _default_pbkdf_iterations(),
			prompt_at_boot: true,
		}
	}
}

impl EncryptionDefaults {
	const KNOWN_ALGORITHMS: &'static [&'static str] =
		&["aes-128-ccm", "aes-192-ccm", "aes-256-ccm", "aes-128-gcm", "aes-192-gcm", "aes-256-gcm"];

	/// # Errors
	/// [`BuildError::Validation`] for an algorithm ZFS does not know.
	pub fn validate(&self) -> Result<()> {
		if !Self::KNOWN_ALGORITHMS.contains(&self.algorithm.as_str()) {
			return Err(BuildError::validation(format!(
				"unknown encryption algorithm `{}`",
				self.algorithm
			)));
		}
		Ok(())
	}
}

/// `zfs_config` section of the build specification.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ZfsConfig {
	/// Build OpenZFS from source instead of installing via DKMS.
	pub build_from_source: bool,
	/// Pin a specific OpenZFS release when building from source.
	pub zfs_version: Option<String>,
	pub compression: Compression,
	pub raid_level: RaidLevel,
	pub ashift: Ashift,
	pub arc_max: ArcMax,
	pub encryption: EncryptionDefaults,
}

impl Default for ZfsConfig {
	fn default() -> Self {
		Self {
			build_from_source: true,
			zfs_version: None,
			compression: Compression::default(),
			raid_level: RaidLevel::default(),
			ashift: Ashift::default(),
			arc_max: ArcMax::default(),
			encryption: EncryptionDefaults::default(),
		}
	}
}

impl ZfsConfig {
	/// # Errors
	/// [`BuildError::Validation`] on out-of-range encryption settings.
	pub fn validate(&self) -> Result<()> {
		self.encryption.validate()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn compression_round_trips() {
		for s in ["lz4", "zstd", "zstd-15", "gzip", "gzip-6", "off"] {
			let c: Compression = s.parse().unwrap();
			assert_eq!(c.to_string(), s);
		}
	}

	#[test]
	fn compression_rejects_junk() {
		assert!("zstd-0".parse::<Compression>().is_err());
		assert!("zstd-20".parse::<Compression>().is_err());
		assert!("lzo".parse::<Compression>().is_err());
		assert!("gzip-10".parse::<Compression>().is_err());
	}

	#[test]
	fn ashift_accepts_auto_and_valid_exponents() {
		assert_eq!("auto".parse::<Ashift>().unwrap(), Ashift::Auto);
		assert_eq!("12".parse::<Ashift>().unwrap(), Ashift::Fixed(12));
		assert!("10".parse::<Ashift>().is_err());
		assert!("14".parse::<Ashift>().is_err());
	}

	#[test]
	fn arc_max_deserializes_number_and_auto() {
		let a: ArcMax = serde_yaml::from_str("4294967296").unwrap();
		assert_eq!(a, ArcMax::Bytes(4 * 1024 * 1024 * 1024));
		let a: ArcMax = serde_yaml::from_str("auto").unwrap();
		assert_eq!(a, ArcMax::Auto);
		assert!(serde_yaml::from_str::<ArcMax>("-5").is_err());
	}

	#[test]
	fn raid_vdev_keywords() {
		assert_eq!(RaidLevel::Stripe.vdev_keyword(), None);
		assert_eq!(RaidLevel::Mirror.vdev_keyword(), Some("mirror"));
		assert_eq!(RaidLevel::Raidz2.vdev_keyword(), Some("raidz2"));
	}

	#[test]
	fn unknown_zfs_key_is_rejected() {
		let err = serde_yaml::from_str::<ZfsConfig>("compression: lz4\nfoo: 1\n").unwrap_err();
		assert!(err.to_string().contains("foo"));
	}

	#[test]
	fn encryption_defaults_validate() {
		let e = EncryptionDefaults::default();
		assert_eq!(e.algorithm, "aes-256-gcm");
		e.validate().unwrap();
		let bad = EncryptionDefaults { algorithm: "rot13".into(), ..Default::default() };
		assert!(bad.validate().is_err());
	}
}
