//! Build error taxonomy.
//!
//! Every failure the pipeline can surface is one of these kinds. Modules
//! return them, the pipeline runner records them in the checkpoint store,
//! and `main` maps them to the CLI exit-code contract.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Error, Debug)]
pub enum BuildError {
	/// The build specification is malformed or carries an unknown
	/// enumerated value.
	#[error("invalid build specification: {0}")]
	Validation(String),

	/// A required host tool, asset or installer module is absent.
	#[error("missing requirement: {0}")]
	MissingRequired(String),

	/// Network failure after retries were exhausted.
	#[error("network operation failed after {attempts} attempts: {context}")]
	Network { context: String, attempts: u32 },

	/// apt/dpkg failed inside the chroot.
	#[error("package installation failed: {0}")]
	PackageInstall(String),

	/// ZFS would not build or load against the installed kernel headers.
	#[error("ZFS does not match kernel {kernel}: {details}")]
	KernelZfsMismatch { kernel: String, details: String },

	/// dracut exited non-zero while regenerating the initramfs.
	#[error("initramfs regeneration failed: {0}")]
	InitramfsRegen(String),

	/// xorriso/mksquashfs/mkfs.vfat failure during image assembly.
	#[error("ISO assembly failed: {0}")]
	IsoAssembly(String),

	/// A second chroot session was requested while one is active.
	#[error("chroot is busy: another session is active")]
	ChrootBusy,

	/// A mount under the workspace would not come down after retries.
	#[error("mount leaked at {path}: {details}")]
	MountLeak { path: PathBuf, details: String },

	/// The workspace was marked dirty by a previous mount leak and
	/// refuses further mounts.
	#[error("workspace at {0} is dirty; refusing to reuse it (clean it first)")]
	WorkspaceDirty(PathBuf),

	/// Subprocess produced no output past the idle threshold.
	#[error("command `{command}` stalled: no output for {idle_secs}s")]
	Stalled { command: String, idle_secs: u64 },

	/// A required installer module source tree is not present.
	#[error("installer module `{0}` is missing from the module sources")]
	InstallerAssetMissing(String),

	/// The user asked us to stop.
	#[error("build cancelled")]
	Cancelled,

	/// A subprocess exited non-zero; carries argv, code and stderr tail.
	#[error("command `{command}` exited with {code}: {stderr_tail}")]
	CommandFailed { command: String, code: i32, stderr_tail: String },

	#[error("template rendering failed: {0}")]
	Template(#[from] tera::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("{0}")]
	Other(String),
}

impl BuildError {
	/// CLI exit code for this error per the command-line contract.
	#[must_use]
	pub const fn exit_code(&self) -> i32 {
		match self {
			Self::Validation(_) => 1,
			Self::WorkspaceDirty(_) => 3,
			Self::Cancelled => 130,
			_ => 2,
		}
	}

	pub fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	pub fn missing(msg: impl Into<String>) -> Self {
		Self::MissingRequired(msg.into())
	}

	pub fn other(msg: impl Into<String>) -> Self {
		Self::Other(msg.into())
	}

	/// True when the error came out of a subprocess the caller may want to
	/// tolerate (e.g. removing a package that is not installed).
	#[must_use]
	pub const fn is_command_failure(&self) -> bool {
		matches!(self, Self::CommandFailed { .. })
	}
}
