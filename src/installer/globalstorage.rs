//! The globalstorage contract between installer view and job modules.
//!
//! View modules write these keys, job modules read them. The key set and
//! value shapes are frozen together with the builder: the Python assets
//! shipped on the ISO implement exactly this map.

use crate::cfg::zfs::{Ashift, Compression, RaidLevel};
use crate::errors::{BuildError, Result};
use indexmap::IndexMap;
use serde_json::Value;

// key constants, verbatim on both sides of the contract
pub const ZFS_OPERATION_MODE: &str = "zfs_operation_mode";
pub const ZFS_NEW_POOL_COMMAND: &str = "zfs_new_pool_command";
pub const ZFS_NEW_POOL_NAME: &str = "zfs_new_pool_name";
pub const ZFS_INSTALL_DATASET_RELATIVE: &str = "zfs_install_dataset_relative";
pub const INSTALL_POOL: &str = "install_pool";
pub const INSTALL_DATASET: &str = "install_dataset";
pub const INSTALL_MODE: &str = "install_mode";
pub const ZFS_COMPRESSION: &str = "zfs_compression";
pub const ZFS_RECORDSIZE: &str = "zfs_recordsize";
pub const ZFS_ASHIFT: &str = "zfs_ashift";
pub const ZFS_ATIME: &str = "zfs_atime";
pub const ZFS_XATTR: &str = "zfs_xattr";
pub const ZFS_DNODESIZE: &str = "zfs_dnodesize";
pub const ZFS_ARC_MAX: &str = "zfs_arc_max";
pub const ENCRYPTION_ENABLED: &str = "encryption_enabled";
pub const ENCRYPTION_ALGORITHM: &str = "encryption_algorithm";
pub const ENCRYPTION_KEYFORMAT: &str = "encryption_keyformat";
pub const ENCRYPTION_KEYLOCATION: &str = "encryption_keylocation";
pub const ENCRYPTION_PASSPHRASE: &str = "encryption_passphrase";
pub const SECURITY_HARDENING_PROFILE: &str = "security_hardening_profile";
pub const TELEMETRY_CONSENT_GIVEN: &str = "telemetry_consent_given";
pub const TELEMETRY_ENDPOINT_URL: &str = "telemetry_endpoint_url";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
	NewPool,
	ExistingPool,
}

impl OperationMode {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::NewPool => "new_pool",
			Self::ExistingPool => "existing_pool",
		}
	}

	/// # Errors
	/// [`BuildError::Validation`] on an unknown token.
	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"new_pool" => Ok(Self::NewPool),
			"existing_pool" => Ok(Self::ExistingPool),
			other => Err(BuildError::validation(format!("unknown zfs_operation_mode `{other}`"))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
	New,
	Replace,
	Alongside,
}

impl InstallMode {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::New => "new",
			Self::Replace => "replace",
			Self::Alongside => "alongside",
		}
	}

	/// # Errors
	/// [`BuildError::Validation`] on an unknown token.
	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"new" => Ok(Self::New),
			"replace" => Ok(Self::Replace),
			"alongside" => Ok(Self::Alongside),
			other => Err(BuildError::validation(format!("unknown install_mode `{other}`"))),
		}
	}
}

/// Strongly typed view over the installer's shared key-value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalStorage(IndexMap<String, Value>);

impl GlobalStorage {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&mut self, key: &str, value: impl Into<Value>) {
		self.0.insert(key.to_owned(), value.into());
	}

	#[must_use]
	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	#[must_use]
	pub fn get_str(&self, key: &str) -> Option<&str> {
		self.0.get(key).and_then(Value::as_str)
	}

	#[must_use]
	pub fn get_bool(&self, key: &str) -> Option<bool> {
		self.0.get(key).and_then(Value::as_bool)
	}

	/// # Errors
	/// [`BuildError::Validation`] when the key is absent or malformed.
	pub fn operation_mode(&self) -> Result<OperationMode> {
		let raw = self
			.get_str(ZFS_OPERATION_MODE)
			.ok_or_else(|| BuildError::validation("zfs_operation_mode not set"))?;
		OperationMode::parse(raw)
	}

	/// # Errors
	/// [`BuildError::Validation`] when the key is absent or malformed.
	pub fn install_mode(&self) -> Result<InstallMode> {
		let raw = self
			.get_str(INSTALL_MODE)
			.ok_or_else(|| BuildError::validation("install_mode not set"))?;
		InstallMode::parse(raw)
	}

	#[must_use]
	pub fn compression(&self) -> Option<Compression> {
		self.get_str(ZFS_COMPRESSION).and_then(|s| s.parse().ok())
	}

	#[must_use]
	pub fn ashift(&self) -> Option<Ashift> {
		self.get_str(ZFS_ASHIFT).and_then(|s| s.parse().ok())
	}

	#[must_use]
	pub fn raid_level(&self) -> Option<RaidLevel> {
		self.get_str("zfs_raid_level").and_then(|s| serde_json::from_value(Value::String(s.to_owned())).ok())
	}

	#[must_use]
	pub fn telemetry_consent(&self) -> bool {
		self.get_bool(TELEMETRY_CONSENT_GIVEN).unwrap_or(false)
	}

	/// The passphrase is ephemeral: reading it removes it from the map, so
	/// it cannot linger in persistent storage after pool creation.
	pub fn take_passphrase(&mut self) -> Option<String> {
		self.0
			.shift_remove(ENCRYPTION_PASSPHRASE)
			.and_then(|v| v.as_str().map(ToOwned::to_owned))
	}

	#[must_use]
	pub fn contains(&self, key: &str) -> bool {
		self.0.contains_key(key)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn operation_mode_round_trips() {
		let mut gs = GlobalStorage::new();
		gs.set(ZFS_OPERATION_MODE, OperationMode::NewPool.as_str());
		assert_eq!(gs.operation_mode().unwrap(), OperationMode::NewPool);
		gs.set(ZFS_OPERATION_MODE, "pool_party");
		assert!(gs.operation_mode().is_err());
	}

	#[test]
	fn passphrase_is_gone_after_take() {
		let mut gs = GlobalStorage::new();
		gs.set(ENCRYPTION_PASSPHRASE, "correct horse battery staple");
		assert_eq!(gs.take_passphrase().as_deref(), Some("correct horse battery staple"));
		assert!(!gs.contains(ENCRYPTION_PASSPHRASE));
		assert_eq!(gs.take_passphrase(), None);
	}

	#[test]
	fn typed_accessors_parse_the_frozen_keys() {
		let mut gs = GlobalStorage::new();
		gs.set(ZFS_COMPRESSION, "zstd-9");
		gs.set(ZFS_ASHIFT, "12");
		gs.set(INSTALL_MODE, "replace");
		gs.set(TELEMETRY_CONSENT_GIVEN, true);
		assert_eq!(gs.compression().unwrap().to_string(), "zstd-9");
		assert_eq!(gs.ashift().unwrap().to_string(), "12");
		assert_eq!(gs.install_mode().unwrap(), InstallMode::Replace);
		assert!(gs.telemetry_consent());
	}

	#[test]
	fn consent_defaults_to_no() {
		assert!(!GlobalStorage::new().telemetry_consent());
	}
}
