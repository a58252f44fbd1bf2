//! Pool creation contract: what the installer's pool job does with the
//! globalstorage it is handed.
//!
//! The argv builders here are the single source of truth; the Python job
//! shipped on the ISO mirrors them verbatim, and the tests below pin the
//! wire format.

use crate::cfg::zfs::{Ashift, Compression, RaidLevel};
use crate::errors::{BuildError, Result};
use std::path::Path;

/// Keyfile handed to `zpool create`; tmpfs-backed, mode 0600, deleted the
/// moment the pool exists.
pub const KEYFILE_PATH: &str = "/run/.zforge-key";

/// Where the target is mounted for population.
pub const TARGET_ROOT: &str = "/mnt/target";

/// Syntactic pool name check: starts with a letter, body is alphanumeric
/// plus `_-.`, no trailing hyphen.
#[must_use]
pub fn pool_name_valid(name: &str) -> bool {
	let mut chars = name.chars();
	let Some(first) = chars.next() else { return false };
	if !first.is_ascii_alphabetic() {
		return false;
	}
	let Some(last) = name.chars().last() else { return false };
	if name.len() < 2 || last == '-' {
		return false;
	}
	name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSpec {
	pub algorithm: String,
}

/// Everything the pool job needs to build its `zpool create` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
	pub name: String,
	pub raid: RaidLevel,
	pub disks: Vec<String>,
	pub ashift: Ashift,
	pub compression: Compression,
	pub recordsize: String,
	pub atime: bool,
	pub xattr_sa: bool,
	pub dnodesize: String,
	pub encryption: Option<EncryptionSpec>,
}

impl PoolSpec {
	/// # Errors
	/// [`BuildError::Validation`] for a bad name, an empty disk list or too
	/// few disks for the topology.
	pub fn validate(&self) -> Result<()> {
		if !pool_name_valid(&self.name) {
			return Err(BuildError::validation(format!("invalid pool name `{}`", self.name)));
		}
		if self.disks.is_empty() {
			return Err(BuildError::validation("no disks selected"));
		}
		if self.disks.len() < self.raid.min_disks() {
			return Err(BuildError::validation(format!(
				"{:?} needs at least {} disks, got {}",
				self.raid,
				self.raid.min_disks(),
				self.disks.len()
			)));
		}
		Ok(())
	}

	/// The full `zpool create` argv.
	///
	/// # Errors
	/// Validation errors from [`PoolSpec::validate`].
	pub fn create_argv(&self) -> Result<Vec<String>> {
		self.validate()?;
		let mut argv: Vec<String> =
			["zpool", "create", "-f", "-m", "none"].map(ToOwned::to_owned).to_vec();

		if let Ashift::Fixed(n) = self.ashift {
			argv.push("-o".into());
			argv.push(format!("ashift={n}"));
		}
		for prop in [
			format!("compression={}", self.compression),
			format!("recordsize={}", self.recordsize),
			format!("atime={}", if self.atime { "on" } else { "off" }),
			format!("xattr={}", if self.xattr_sa { "sa" } else { "on" }),
			format!("dnodesize={}", self.dnodesize),
			String::from("acltype=posixacl"),
			String::from("normalization=formD"),
		] {
			argv.push("-O".into());
			argv.push(prop);
		}
		if let Some(enc) = &self.encryption {
			for prop in [
				format!("encryption={}", enc.algorithm),
				String::from("keyformat=passphrase"),
				format!("keylocation=file://{KEYFILE_PATH}"),
			] {
				argv.push("-O".into());
				argv.push(prop);
			}
		}

		argv.push(self.name.clone());
		if let Some(vdev) = self.raid.vdev_keyword() {
			argv.push(vdev.to_owned());
		}
		argv.extend(self.disks.iter().cloned());
		Ok(argv)
	}

	/// Commands run right after `zpool create`, in order: nested datasets,
	/// install-dataset properties, then the key moves to prompt so boot
	/// asks for the passphrase.
	#[must_use]
	pub fn post_create_argvs(&self, distro: &str) -> Vec<Vec<String>> {
		let pool = &self.name;
		let root_ds = format!("{pool}/ROOT");
		let install_ds = format!("{pool}/ROOT/{distro}");
		let mut cmds = vec![
			svec(&["zfs", "create", "-o", "mountpoint=none", &root_ds]),
			svec(&["zfs", "create", "-o", "mountpoint=/", "-o", "canmount=noauto", &install_ds]),
			svec(&["zpool", "set", &format!("bootfs={install_ds}"), pool]),
		];
		if self.encryption.is_some() {
			cmds.push(svec(&["zfs", "set", "keylocation=prompt", pool]));
		}
		cmds
	}

	/// Export/import cycle that locks the target mountpoint before
	/// population.
	#[must_use]
	pub fn remount_argvs(&self, distro: &str) -> Vec<Vec<String>> {
		let pool = &self.name;
		let install_ds = format!("{pool}/ROOT/{distro}");
		vec![
			svec(&["zpool", "export", pool]),
			svec(&["zpool", "import", "-N", "-R", TARGET_ROOT, pool]),
			svec(&["zfs", "mount", &install_ds]),
		]
	}
}

fn svec(parts: &[&str]) -> Vec<String> {
	parts.iter().map(|s| (*s).to_owned()).collect()
}

/// Write the passphrase keyfile with owner-only permissions.
///
/// # Errors
/// IO errors; the path's parent must exist (it is `/run` in production).
pub fn write_keyfile(path: &Path, passphrase: &str) -> Result<()> {
	use std::io::Write;
	use std::os::unix::fs::OpenOptionsExt;
	let mut file = std::fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(0o600)
		.open(path)?;
	file.write_all(passphrase.as_bytes())?;
	Ok(())
}

/// Remove the keyfile; called unconditionally after `zpool create`.
///
/// # Errors
/// IO errors other than the file already being gone.
pub fn remove_keyfile(path: &Path) -> Result<()> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e.into()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn spec() -> PoolSpec {
		PoolSpec {
			name: "rpool".into(),
			raid: RaidLevel::Mirror,
			disks: vec!["sda".into(), "sdb".into()],
			ashift: Ashift::Fixed(12),
			compression: Compression::Lz4,
			recordsize: "128K".into(),
			atime: false,
			xattr_sa: true,
			dnodesize: "auto".into(),
			encryption: None,
		}
	}

	#[test]
	fn pool_names_follow_the_grammar() {
		for good in ["rpool", "tank2", "a1", "pool-a", "p.ool", "Pool_9."] {
			assert!(pool_name_valid(good), "{good} should be valid");
		}
		for bad in ["", "r", "9pool", "-pool", "pool-", "po ol", "po/ol", "rpoolé"] {
			assert!(!pool_name_valid(bad), "{bad} should be invalid");
		}
	}

	#[test]
	fn create_argv_plain_mirror() {
		let argv = spec().create_argv().unwrap();
		let joined = argv.join(" ");
		assert!(joined.starts_with("zpool create -f -m none"));
		assert!(joined.contains("-o ashift=12"));
		assert!(joined.contains("-O compression=lz4"));
		assert!(joined.contains("-O atime=off"));
		assert!(joined.contains("-O xattr=sa"));
		assert!(joined.contains("-O dnodesize=auto"));
		assert!(joined.ends_with("rpool mirror sda sdb"));
	}

	#[test]
	fn create_argv_with_encryption_uses_the_keyfile() {
		let mut s = spec();
		s.encryption = Some(EncryptionSpec { algorithm: "aes-256-gcm".into() });
		let argv = s.create_argv().unwrap();
		let joined = argv.join(" ");
		assert!(joined.contains("-O encryption=aes-256-gcm"));
		assert!(joined.contains("-O keyformat=passphrase"));
		assert!(joined.contains("-O keylocation=file:///run/.zforge-key"));
		// encryption options come before the pool name and vdevs
		let name_pos = argv.iter().position(|a| a == "rpool").unwrap();
		let enc_pos = argv.iter().position(|a| a.starts_with("encryption=")).unwrap();
		assert!(enc_pos < name_pos);
	}

	#[test]
	fn keyfile_is_created_0600_and_removed() {
		use std::os::unix::fs::PermissionsExt;
		let tmp = tempfile::tempdir().unwrap();
		let key = tmp.path().join(".zforge-key");
		write_keyfile(&key, "correct horse battery staple").unwrap();
		let mode = std::fs::metadata(&key).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o600);
		remove_keyfile(&key).unwrap();
		assert!(!key.exists());
		// double removal tolerated
		remove_keyfile(&key).unwrap();
	}

	#[test]
	fn post_create_sets_prompt_only_when_encrypted() {
		let plain = spec().post_create_argvs("pve");
		assert!(!plain.iter().any(|c| c.join(" ").contains("keylocation=prompt")));

		let mut s = spec();
		s.encryption = Some(EncryptionSpec { algorithm: "aes-256-gcm".into() });
		let cmds = s.post_create_argvs("pve");
		let last = cmds.last().unwrap().join(" ");
		assert_eq!(last, "zfs set keylocation=prompt rpool");
		assert!(cmds[0].join(" ").contains("rpool/ROOT"));
		assert!(cmds[1].join(" ").contains("rpool/ROOT/pve"));
	}

	#[test]
	fn remount_locks_the_target_root() {
		let cmds = spec().remount_argvs("pve");
		assert_eq!(cmds[0].join(" "), "zpool export rpool");
		assert_eq!(cmds[1].join(" "), "zpool import -N -R /mnt/target rpool");
		assert_eq!(cmds[2].join(" "), "zfs mount rpool/ROOT/pve");
	}

	#[test]
	fn too_few_disks_for_raidz2_is_rejected() {
		let mut s = spec();
		s.raid = RaidLevel::Raidz2;
		assert!(matches!(s.create_argv().unwrap_err(), BuildError::Validation(_)));
	}
}
