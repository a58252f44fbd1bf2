//! Chroot executor: scoped sessions with managed bind mounts.
//!
//! A [`ChrootSession`] owns the kernel-filesystem bind mounts (dev, devpts,
//! proc, sys, run) plus the optional package-cache mount. Mounts go up in a
//! fixed order and come down in reverse on every exit path; "already
//! unmounted" is tolerated. The chroot is an exclusive resource: one session
//! process-wide, nesting gets [`BuildError::ChrootBusy`].

use crate::errors::{BuildError, Result};
use crate::util::{self, CmdOutput};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Bind sources mounted into every session, in mount order.
const KERNEL_MOUNTS: &[(&str, &str)] = &[
	("/dev", "dev"),
	("/dev/pts", "dev/pts"),
	("/proc", "proc"),
	("/sys", "sys"),
	("/run", "run"),
];

/// Where the package cache lands inside the chroot.
pub const CACHE_MOUNTPOINT: &str = "var/cache/apt/archives";

static CHROOT_BUSY: AtomicBool = AtomicBool::new(false);

pub struct ChrootExecutor {
	root: PathBuf,
	cache: Option<PathBuf>,
	idle: Duration,
}

impl ChrootExecutor {
	#[must_use]
	pub fn new(root: PathBuf, cache: Option<PathBuf>, idle: Duration) -> Self {
		Self { root, cache, idle }
	}

	/// Open a session: take the process-wide slot, raise the bind mounts.
	///
	/// # Errors
	/// - [`BuildError::ChrootBusy`] when a session is already active.
	/// - Mount syscall failures (the mounts raised so far are torn down).
	pub fn enter(&self) -> Result<ChrootSession> {
		if CHROOT_BUSY.swap(true, Ordering::SeqCst) {
			return Err(BuildError::ChrootBusy);
		}
		let mut session = ChrootSession {
			root: self.root.clone(),
			idle: self.idle,
			mounted: Vec::new(),
		};
		if let Err(e) = session.mount_all(self.cache.as_deref()) {
			// session drop releases the slot and whatever got mounted
			return Err(e);
		}
		Ok(session)
	}
}

pub struct ChrootSession {
	root: PathBuf,
	idle: Duration,
	/// Mount targets in mount order; unmounted in reverse.
	mounted: Vec<PathBuf>,
}

impl ChrootSession {
	fn mount_all(&mut self, cache: Option<&Path>) -> Result<()> {
		use nix::mount::{mount, MsFlags};

		for (src, rel) in KERNEL_MOUNTS {
			let target = self.root.join(rel);
			std::fs::create_dir_all(&target)?;
			trace!(src, ?target, "Bind mounting");
			mount(
				Some(Path::new(src)),
				&target,
				None::<&str>,
				MsFlags::MS_BIND,
				None::<&str>,
			)
			.map_err(|e| {
				BuildError::other(format!("bind mount {src} -> {}: {e}", target.display()))
			})?;
			self.mounted.push(target);
		}

		if let Some(cache) = cache {
			let target = self.root.join(CACHE_MOUNTPOINT);
			std::fs::create_dir_all(&target)?;
			trace!(?cache, ?target, "Bind mounting package cache");
			mount(Some(cache), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
				.map_err(|e| {
					BuildError::other(format!("bind mount cache: {e}"))
				})?;
			self.mounted.push(target);
		}
		debug!(root = ?self.root, mounts = self.mounted.len(), "Chroot session open");
		Ok(())
	}

	#[must_use]
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Run `argv` inside the chroot. Non-zero exit comes back as
	/// [`BuildError::CommandFailed`] with the argv, exit code and stderr
	/// tail; the session stays usable either way.
	///
	/// # Errors
	/// Command failure, watchdog stall, or cancellation.
	pub fn run(&self, argv: &[&str]) -> Result<CmdOutput> {
		self.run_with(argv, &[], None)
	}

	/// [`ChrootSession::run`] with extra environment and optional stdin.
	///
	/// # Errors
	/// See [`ChrootSession::run`].
	pub fn run_with(
		&self, argv: &[&str], env: &[(&str, &str)], stdin: Option<&str>,
	) -> Result<CmdOutput> {
		let Some((program, args)) = argv.split_first() else {
			return Err(BuildError::other("empty argv for chroot run"));
		};
		let mut cmd = Command::new("chroot");
		cmd.arg(&self.root).arg(program).args(args);
		cmd.env_clear()
			.env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin")
			.env("HOME", "/root")
			.env("LC_ALL", "C")
			.env("DEBIAN_FRONTEND", "noninteractive");
		for (k, v) in env {
			cmd.env(k, v);
		}
		util::run_streamed_with_stdin(&mut cmd, self.idle, stdin)
	}

	/// Like [`ChrootSession::run`], but a non-zero exit is logged and
	/// swallowed. For operations whose contract tolerates failure, e.g.
	/// removing a package that is not installed.
	///
	/// # Errors
	/// Stall and cancellation still propagate.
	pub fn run_tolerant(&self, argv: &[&str]) -> Result<Option<CmdOutput>> {
		match self.run(argv) {
			Ok(out) => Ok(Some(out)),
			Err(e @ (BuildError::Stalled { .. } | BuildError::Cancelled)) => Err(e),
			Err(e) => {
				debug!(error = %e, "Tolerated command failure");
				Ok(None)
			},
		}
	}

	/// Write a shell script into the chroot's /tmp and execute it there.
	///
	/// # Errors
	/// IO writing the script, plus everything [`ChrootSession::run`] can
	/// return.
	pub fn run_script(&self, name: &str, script: &str) -> Result<CmdOutput> {
		let tmp_dir = self.root.join("tmp");
		std::fs::create_dir_all(&tmp_dir)?;
		let mut file = tempfile::Builder::new()
			.prefix("zforge-")
			.suffix(&format!("-{name}.sh"))
			.tempfile_in(&tmp_dir)?;
		let body =
			if script.starts_with("#!") { script.to_owned() } else { format!("#!/bin/sh\nset -e\n{script}") };
		file.write_all(body.as_bytes())?;
		{
			use std::os::unix::fs::PermissionsExt;
			std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755))?;
		}
		let rel = Path::new("/tmp").join(
			file.path().file_name().ok_or_else(|| BuildError::other("script has no name"))?,
		);
		let rel = rel.to_string_lossy().into_owned();
		self.run(&["/bin/sh", &rel])
	}

	fn unmount_all(&mut self) {
		use nix::mount::{umount2, MntFlags};

		while let Some(target) = self.mounted.pop() {
			trace!(?target, "Unmounting");
			match umount2(&target, MntFlags::empty()) {
				Ok(()) => {},
				Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => {
					// already unmounted; tolerated
				},
				Err(e) => {
					warn!(?target, error = %e, "Unmount failed, detaching lazily");
					if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
						// workspace release sweeps /proc/mounts as backstop
						warn!(?target, error = %e, "Lazy unmount failed too");
					}
				},
			}
		}
	}
}

impl Drop for ChrootSession {
	fn drop(&mut self) {
		self.unmount_all();
		CHROOT_BUSY.store(false, Ordering::SeqCst);
		debug!(root = ?self.root, "Chroot session closed");
	}
}
