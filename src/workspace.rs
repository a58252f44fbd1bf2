//! Build workspace: a directory tree owned exclusively by one build.
//!
//! Fixed subpaths (chroot, cache, iso staging, EFI staging, live rootfs,
//! checkpoint state) plus the mount hygiene the rest of the pipeline leans
//! on: on every exit path all kernel-visible mounts under `chroot/` come
//! down before the workspace is considered released. A mount that will not
//! come down marks the workspace dirty; dirty workspaces refuse further
//! mounts until cleaned.

use crate::errors::{BuildError, Result};
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

const DIRTY_MARKER: &str = ".zforge-dirty";
const CACHE_LOCK: &str = ".zforge-cache.lock";

/// Fixed workspace subdirectories, created on acquire.
const SUBDIRS: &[&str] = &["chroot", "cache", "iso", "efi", "live", "state", "out"];

pub struct Workspace {
	root: PathBuf,
	/// Held for the whole build; serializes package-cache access between
	/// concurrent builds sharing a cache.
	_cache_lock: fs::File,
	released: bool,
}

impl Workspace {
	/// Acquire the workspace at `root`, creating the subpath layout.
	///
	/// # Errors
	/// - [`BuildError::WorkspaceDirty`] when a previous build leaked a mount
	///   here and nobody cleaned up.
	/// - IO errors creating directories or taking the cache lock.
	pub fn acquire(root: impl Into<PathBuf>) -> Result<Self> {
		let root = root.into();
		if Self::is_dirty(&root) {
			return Err(BuildError::WorkspaceDirty(root));
		}
		info!(?root, "Acquiring workspace");
		for sub in SUBDIRS {
			fs::create_dir_all(root.join(sub))?;
		}
		let lock_path = root.join("cache").join(CACHE_LOCK);
		let cache_lock = fs::File::create(&lock_path)?;
		debug!(?lock_path, "Waiting for package cache lock");
		cache_lock.lock_exclusive().map_err(BuildError::Io)?;
		Ok(Self { root, _cache_lock: cache_lock, released: false })
	}

	#[must_use]
	pub fn root(&self) -> &Path {
		&self.root
	}

	#[must_use]
	pub fn chroot(&self) -> PathBuf {
		self.root.join("chroot")
	}

	#[must_use]
	pub fn cache(&self) -> PathBuf {
		self.root.join("cache")
	}

	#[must_use]
	pub fn iso_dir(&self) -> PathBuf {
		self.root.join("iso")
	}

	#[must_use]
	pub fn efi_dir(&self) -> PathBuf {
		self.root.join("efi")
	}

	#[must_use]
	pub fn live_dir(&self) -> PathBuf {
		self.root.join("live")
	}

	#[must_use]
	pub fn state_dir(&self) -> PathBuf {
		self.root.join("state")
	}

	#[must_use]
	pub fn output_dir(&self) -> PathBuf {
		self.root.join("out")
	}

	#[must_use]
	pub fn is_dirty(root: &Path) -> bool {
		root.join(DIRTY_MARKER).exists()
	}

	fn mark_dirty(&self) {
		if let Err(e) = fs::write(self.root.join(DIRTY_MARKER), b"mount leak\n") {
			warn!(error = %e, "Could not write dirty marker");
		}
	}

	/// Tear down anything still mounted under `chroot/` and release the
	/// workspace. The tree itself is retained for post-mortem and resume.
	///
	/// # Errors
	/// [`BuildError::MountLeak`] when a mount survives normal and lazy
	/// unmounting; the workspace is marked dirty first.
	pub fn release(mut self) -> Result<()> {
		self.released = true;
		let leaked = sweep_unmount(&self.chroot());
		match leaked {
			Ok(()) => {
				info!(root = ?self.root, "Workspace released");
				Ok(())
			},
			Err(e) => {
				self.mark_dirty();
				Err(e)
			},
		}
	}

	/// Destroy the workspace tree entirely, cleaning a dirty marker too.
	///
	/// # Errors
	/// [`BuildError::MountLeak`] when mounts refuse to come down even
	/// lazily; IO errors removing the tree.
	pub fn destroy(root: &Path) -> Result<()> {
		if root.exists() {
			sweep_unmount(&root.join("chroot"))?;
			info!(?root, "Destroying workspace");
			fs::remove_dir_all(root)?;
		}
		Ok(())
	}
}

impl Drop for Workspace {
	fn drop(&mut self) {
		if self.released {
			return;
		}
		// unwind path: same sweep, but only log
		if let Err(e) = sweep_unmount(&self.chroot()) {
			warn!(error = %e, "Mounts leaked during unwind");
			self.mark_dirty();
		}
	}
}

/// Everything mounted at or below `prefix`, deepest first, parsed from
/// `/proc/self/mounts`.
fn mounts_under(prefix: &Path) -> Vec<PathBuf> {
	let Ok(table) = fs::read_to_string("/proc/self/mounts") else {
		return Vec::new();
	};
	parse_mounts(&table, prefix)
}

fn parse_mounts(table: &str, prefix: &Path) -> Vec<PathBuf> {
	let mut mounts: Vec<PathBuf> = table
		.lines()
		.filter_map(|line| line.split_whitespace().nth(1))
		.map(|target| PathBuf::from(unescape_mount_path(target)))
		.filter(|target| target.starts_with(prefix))
		.collect();
	// deepest first so nested mounts come down before their parents
	mounts.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
	mounts
}

// /proc/mounts octal-escapes spaces and friends
fn unescape_mount_path(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut chars = s.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		let oct: String = chars.by_ref().take(3).collect();
		match u8::from_str_radix(&oct, 8) {
			Ok(b) => out.push(b as char),
			Err(_) => {
				out.push('\\');
				out.push_str(&oct);
			},
		}
	}
	out
}

/// Unmount everything under `prefix`, retrying lazily.
///
/// # Errors
/// [`BuildError::MountLeak`] naming the first mount that would not come
/// down even with `MNT_DETACH`.
pub fn sweep_unmount(prefix: &Path) -> Result<()> {
	use nix::mount::{umount2, MntFlags};

	for target in mounts_under(prefix) {
		trace!(?target, "Unmounting");
		match umount2(&target, MntFlags::empty()) {
			Ok(()) => continue,
			Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => {
				// already gone; tolerated
				continue;
			},
			Err(e) => {
				warn!(?target, error = %e, "Unmount failed, retrying lazily");
				if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
					return Err(BuildError::MountLeak {
						path: target,
						details: e.to_string(),
					});
				}
			},
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn acquire_creates_layout() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("ws");
		let ws = Workspace::acquire(&root).unwrap();
		for sub in SUBDIRS {
			assert!(root.join(sub).is_dir(), "missing {sub}");
		}
		assert_eq!(ws.chroot(), root.join("chroot"));
		ws.release().unwrap();
		assert!(root.exists(), "workspace tree is retained after release");
	}

	#[test]
	fn dirty_workspace_refuses_acquire() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("ws");
		fs::create_dir_all(&root).unwrap();
		fs::write(root.join(DIRTY_MARKER), "x").unwrap();
		let err = Workspace::acquire(&root).unwrap_err();
		assert!(matches!(err, BuildError::WorkspaceDirty(_)));
		assert_eq!(err.exit_code(), 3);
	}

	#[test]
	fn destroy_removes_tree() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path().join("ws");
		let ws = Workspace::acquire(&root).unwrap();
		ws.release().unwrap();
		Workspace::destroy(&root).unwrap();
		assert!(!root.exists());
	}

	#[test]
	fn parse_mounts_filters_and_orders_deepest_first() {
		let table = "\
proc /w/chroot/proc proc rw 0 0
udev /w/chroot/dev devtmpfs rw 0 0
devpts /w/chroot/dev/pts devpts rw 0 0
sysfs /sys sysfs rw 0 0
tmpfs /w/chroot/run tmpfs rw 0 0
";
		let mounts = parse_mounts(table, Path::new("/w/chroot"));
		assert_eq!(mounts.len(), 4);
		assert_eq!(mounts[0], PathBuf::from("/w/chroot/dev/pts"));
		assert!(!mounts.contains(&PathBuf::from("/sys")));
	}

	#[test]
	fn mount_paths_unescape_octal() {
		assert_eq!(unescape_mount_path("/mnt/with\\040space"), "/mnt/with space");
		assert_eq!(unescape_mount_path("/plain"), "/plain");
	}
}
