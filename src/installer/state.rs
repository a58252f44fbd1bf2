//! Pool-creation wizard state machine.
//!
//! Mirrors the flow the `zfsrootselect` view walks the operator through.
//! Every state can step back to its predecessor, and stepping back out of
//! `Confirmed` reopens the inputs without losing anything: the data lives
//! beside the step marker, never inside it.

use super::globalstorage::{self, GlobalStorage, InstallMode, OperationMode};
use super::pool::PoolSpec;
use crate::cfg::zfs::{Ashift, Compression, RaidLevel};
use crate::errors::{BuildError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
	ModeSelect,
	// new-pool path
	DisksSelected,
	RaidSelected,
	PropertiesSet,
	EncryptionSet,
	// existing-pool path
	PoolSelected,
	InstallModeSelected,
	ExistingPropertiesSet,
	// terminal
	Confirmed,
}

/// Inputs gathered along the way. Survives back transitions untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct WizardData {
	pub mode: Option<OperationMode>,
	pub disks: Vec<String>,
	pub raid: RaidLevel,
	pub pool_name: String,
	pub compression: Compression,
	pub recordsize: String,
	pub ashift: Ashift,
	pub atime: bool,
	pub xattr_sa: bool,
	pub dnodesize: String,
	pub encryption_enabled: bool,
	pub encryption_algorithm: String,
	pub passphrase: Option<String>,
	/// Existing-pool path.
	pub existing_pool: Option<String>,
	pub install_mode: InstallMode,
	/// Whether the existing-pool path customizes dataset properties.
	pub customize_properties: bool,
	pub distro: String,
}

impl Default for WizardData {
	fn default() -> Self {
		Self {
			mode: None,
			disks: Vec::new(),
			raid: RaidLevel::Mirror,
			pool_name: String::from("rpool"),
			compression: Compression::Lz4,
			recordsize: String::from("128K"),
			ashift: Ashift::Auto,
			atime: false,
			xattr_sa: true,
			dnodesize: String::from("auto"),
			encryption_enabled: false,
			encryption_algorithm: String::from("aes-256-gcm"),
			passphrase: None,
			existing_pool: None,
			install_mode: InstallMode::New,
			customize_properties: false,
			distro: String::from("pve"),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Wizard {
	step: Step,
	pub data: WizardData,
}

impl Default for Wizard {
	fn default() -> Self {
		Self::new()
	}
}

impl Wizard {
	#[must_use]
	pub fn new() -> Self {
		Self { step: Step::ModeSelect, data: WizardData::default() }
	}

	#[must_use]
	pub const fn step(&self) -> Step {
		self.step
	}

	/// Step forward. The current step's inputs must be present.
	///
	/// # Errors
	/// [`BuildError::Validation`] when the step's inputs are missing or
	/// malformed.
	pub fn advance(&mut self) -> Result<Step> {
		self.step = match self.step {
			Step::ModeSelect => match self.data.mode {
				Some(OperationMode::NewPool) => Step::DisksSelected,
				Some(OperationMode::ExistingPool) => Step::PoolSelected,
				None => return Err(BuildError::validation("no operation mode selected")),
			},
			Step::DisksSelected => {
				if self.data.disks.is_empty() {
					return Err(BuildError::validation("no disks selected"));
				}
				Step::RaidSelected
			},
			Step::RaidSelected => {
				if self.data.disks.len() < self.data.raid.min_disks() {
					return Err(BuildError::validation(format!(
						"{:?} needs at least {} disks",
						self.data.raid,
						self.data.raid.min_disks()
					)));
				}
				Step::PropertiesSet
			},
			Step::PropertiesSet => {
				if self.data.encryption_enabled {
					Step::EncryptionSet
				} else {
					Step::Confirmed
				}
			},
			Step::EncryptionSet => {
				if self.data.passphrase.as_deref().is_none_or(str::is_empty) {
					return Err(BuildError::validation("encryption enabled but no passphrase"));
				}
				Step::Confirmed
			},
			Step::PoolSelected => {
				if self.data.existing_pool.is_none() {
					return Err(BuildError::validation("no pool selected"));
				}
				Step::InstallModeSelected
			},
			Step::InstallModeSelected => {
				if self.data.customize_properties {
					Step::ExistingPropertiesSet
				} else {
					Step::Confirmed
				}
			},
			Step::ExistingPropertiesSet => Step::Confirmed,
			Step::Confirmed => Step::Confirmed,
		};
		Ok(self.step)
	}

	/// Step back. Always permitted; from `Confirmed` it reopens the last
	/// input page with all data intact.
	pub fn back(&mut self) -> Step {
		self.step = match self.step {
			Step::ModeSelect | Step::DisksSelected | Step::PoolSelected => Step::ModeSelect,
			Step::RaidSelected => Step::DisksSelected,
			Step::PropertiesSet => Step::RaidSelected,
			Step::EncryptionSet => Step::PropertiesSet,
			Step::InstallModeSelected => Step::PoolSelected,
			Step::ExistingPropertiesSet => Step::InstallModeSelected,
			Step::Confirmed => match self.data.mode {
				Some(OperationMode::ExistingPool) => {
					if self.data.customize_properties {
						Step::ExistingPropertiesSet
					} else {
						Step::InstallModeSelected
					}
				},
				_ => {
					if self.data.encryption_enabled {
						Step::EncryptionSet
					} else {
						Step::PropertiesSet
					}
				},
			},
		};
		self.step
	}

	/// The `zpool create` request the confirmed inputs describe.
	///
	/// # Errors
	/// [`BuildError::Validation`] outside the new-pool path.
	pub fn pool_spec(&self) -> Result<PoolSpec> {
		if self.data.mode != Some(OperationMode::NewPool) {
			return Err(BuildError::validation("not in new-pool mode"));
		}
		Ok(PoolSpec {
			name: self.data.pool_name.clone(),
			raid: self.data.raid,
			disks: self.data.disks.clone(),
			ashift: self.data.ashift,
			compression: self.data.compression,
			recordsize: self.data.recordsize.clone(),
			atime: self.data.atime,
			xattr_sa: self.data.xattr_sa,
			dnodesize: self.data.dnodesize.clone(),
			encryption: self.data.encryption_enabled.then(|| super::pool::EncryptionSpec {
				algorithm: self.data.encryption_algorithm.clone(),
			}),
		})
	}

	/// Terminal write: the frozen globalstorage keys.
	///
	/// # Errors
	/// [`BuildError::Validation`] unless the wizard is at `Confirmed`.
	pub fn write_globalstorage(&self) -> Result<GlobalStorage> {
		if self.step != Step::Confirmed {
			return Err(BuildError::validation("wizard not confirmed yet"));
		}
		let mode =
			self.data.mode.ok_or_else(|| BuildError::validation("no operation mode"))?;
		let mut gs = GlobalStorage::new();
		gs.set(globalstorage::ZFS_OPERATION_MODE, mode.as_str());
		gs.set(globalstorage::INSTALL_MODE, self.data.install_mode.as_str());
		gs.set(globalstorage::ZFS_COMPRESSION, self.data.compression.to_string());
		gs.set(globalstorage::ZFS_RECORDSIZE, self.data.recordsize.clone());
		gs.set(globalstorage::ZFS_ASHIFT, self.data.ashift.to_string());
		gs.set(globalstorage::ZFS_ATIME, self.data.atime);
		gs.set(globalstorage::ZFS_XATTR, if self.data.xattr_sa { "sa" } else { "on" });
		gs.set(globalstorage::ZFS_DNODESIZE, self.data.dnodesize.clone());

		match mode {
			OperationMode::NewPool => {
				let spec = self.pool_spec()?;
				let argv = spec.create_argv()?;
				gs.set(globalstorage::ZFS_NEW_POOL_COMMAND, serde_json::json!(argv));
				gs.set(globalstorage::ZFS_NEW_POOL_NAME, spec.name.clone());
				gs.set(
					globalstorage::ZFS_INSTALL_DATASET_RELATIVE,
					format!("ROOT/{}", self.data.distro),
				);
				gs.set(globalstorage::INSTALL_POOL, spec.name.clone());
				gs.set(
					globalstorage::INSTALL_DATASET,
					format!("{}/ROOT/{}", spec.name, self.data.distro),
				);
			},
			OperationMode::ExistingPool => {
				let pool = self
					.data
					.existing_pool
					.clone()
					.ok_or_else(|| BuildError::validation("no pool selected"))?;
				gs.set(
					globalstorage::INSTALL_DATASET,
					format!("{pool}/ROOT/{}", self.data.distro),
				);
				gs.set(globalstorage::INSTALL_POOL, pool);
			},
		}

		gs.set(globalstorage::ENCRYPTION_ENABLED, self.data.encryption_enabled);
		if self.data.encryption_enabled {
			gs.set(globalstorage::ENCRYPTION_ALGORITHM, self.data.encryption_algorithm.clone());
			gs.set(globalstorage::ENCRYPTION_KEYFORMAT, "passphrase");
			gs.set(
				globalstorage::ENCRYPTION_KEYLOCATION,
				format!("file://{}", super::pool::KEYFILE_PATH),
			);
			if let Some(passphrase) = &self.data.passphrase {
				// ephemeral: the pool job takes it out again
				gs.set(globalstorage::ENCRYPTION_PASSPHRASE, passphrase.clone());
			}
		}
		Ok(gs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn new_pool_wizard() -> Wizard {
		let mut w = Wizard::new();
		w.data.mode = Some(OperationMode::NewPool);
		w.data.disks = vec!["sda".into(), "sdb".into()];
		w.data.raid = RaidLevel::Mirror;
		w
	}

	#[test]
	fn new_pool_walk_without_encryption() {
		let mut w = new_pool_wizard();
		assert_eq!(w.advance().unwrap(), Step::DisksSelected);
		assert_eq!(w.advance().unwrap(), Step::RaidSelected);
		assert_eq!(w.advance().unwrap(), Step::PropertiesSet);
		assert_eq!(w.advance().unwrap(), Step::Confirmed);
	}

	#[test]
	fn encryption_inserts_its_own_step() {
		let mut w = new_pool_wizard();
		w.data.encryption_enabled = true;
		w.data.passphrase = Some("correct horse battery staple".into());
		w.advance().unwrap();
		w.advance().unwrap();
		w.advance().unwrap();
		assert_eq!(w.step(), Step::EncryptionSet);
		assert_eq!(w.advance().unwrap(), Step::Confirmed);
	}

	#[test]
	fn existing_pool_walk() {
		let mut w = Wizard::new();
		w.data.mode = Some(OperationMode::ExistingPool);
		w.data.existing_pool = Some("tank".into());
		w.data.install_mode = InstallMode::Alongside;
		assert_eq!(w.advance().unwrap(), Step::PoolSelected);
		assert_eq!(w.advance().unwrap(), Step::InstallModeSelected);
		assert_eq!(w.advance().unwrap(), Step::Confirmed);
	}

	#[test]
	fn back_from_confirmed_reopens_without_data_loss() {
		let mut w = new_pool_wizard();
		while w.step() != Step::Confirmed {
			w.advance().unwrap();
		}
		let before = w.data.clone();
		assert_eq!(w.back(), Step::PropertiesSet);
		assert_eq!(w.data, before, "back transition lost data");
		// and forward again reaches Confirmed with the same inputs
		assert_eq!(w.advance().unwrap(), Step::Confirmed);
	}

	#[test]
	fn every_state_permits_back() {
		let mut w = new_pool_wizard();
		w.advance().unwrap();
		w.advance().unwrap();
		assert_eq!(w.step(), Step::RaidSelected);
		assert_eq!(w.back(), Step::DisksSelected);
		assert_eq!(w.back(), Step::ModeSelect);
		assert_eq!(w.back(), Step::ModeSelect);
	}

	#[test]
	fn missing_inputs_block_advance() {
		let mut w = Wizard::new();
		assert!(w.advance().is_err());
		w.data.mode = Some(OperationMode::NewPool);
		w.advance().unwrap();
		assert!(matches!(
			{
				w.data.disks.clear();
				w.advance()
			},
			Err(BuildError::Validation(_))
		));
	}

	#[test]
	fn confirmed_wizard_writes_the_frozen_keys() {
		let mut w = new_pool_wizard();
		w.data.encryption_enabled = true;
		w.data.passphrase = Some("correct horse battery staple".into());
		while w.step() != Step::Confirmed {
			w.advance().unwrap();
		}
		let mut gs = w.write_globalstorage().unwrap();
		assert_eq!(gs.get_str(globalstorage::ZFS_OPERATION_MODE), Some("new_pool"));
		assert_eq!(gs.get_str(globalstorage::ZFS_NEW_POOL_NAME), Some("rpool"));
		assert_eq!(gs.get_str(globalstorage::INSTALL_DATASET), Some("rpool/ROOT/pve"));
		assert_eq!(gs.get_str(globalstorage::ZFS_INSTALL_DATASET_RELATIVE), Some("ROOT/pve"));
		let argv: Vec<String> = serde_json::from_value(
			gs.get(globalstorage::ZFS_NEW_POOL_COMMAND).unwrap().clone(),
		)
		.unwrap();
		assert!(argv.join(" ").contains("mirror sda sdb"));
		assert!(argv.join(" ").contains("keylocation=file:///run/.zforge-key"));
		assert_eq!(gs.take_passphrase().as_deref(), Some("correct horse battery staple"));
	}

	#[test]
	fn unconfirmed_wizard_refuses_to_write() {
		let w = new_pool_wizard();
		assert!(w.write_globalstorage().is_err());
	}
}
