//! First pipeline stage: host prerequisites and workspace layout.

use crate::errors::{BuildError, Result};
use crate::pipeline::{BuildContext, BuildModule};
use itertools::Itertools;
use tracing::{debug, info};

/// Host tools the later stages shell out to, with the Debian package that
/// provides each.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
	("debootstrap", "debootstrap"),
	("chroot", "coreutils"),
	("xorriso", "xorriso"),
	("mksquashfs", "squashfs-tools"),
	("unsquashfs", "squashfs-tools"),
	("mkfs.vfat", "dosfstools"),
	("mount", "mount"),
];

pub struct WorkspaceSetup;

impl BuildModule for WorkspaceSetup {
	fn name(&self) -> &'static str {
		"workspace_setup"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		if !nix::unistd::geteuid().is_root() {
			return Err(BuildError::missing("root privilege (mounts and chroots ahead)"));
		}

		let missing: Vec<_> = REQUIRED_TOOLS
			.iter()
			.filter(|(tool, _)| which::which(tool).is_err())
			.collect();
		if !missing.is_empty() {
			let listing = missing
				.iter()
				.map(|(tool, package)| format!("{tool} (install: {package})"))
				.join(", ");
			return Err(BuildError::missing(format!("host tools: {listing}")));
		}

		// idempotent: Workspace::acquire already laid these out, a rerun
		// after manual deletion heals them
		for dir in [
			ctx.workspace.chroot(),
			ctx.workspace.cache(),
			ctx.workspace.iso_dir(),
			ctx.workspace.efi_dir(),
			ctx.workspace.live_dir(),
			ctx.workspace.state_dir(),
			ctx.workspace.output_dir(),
		] {
			std::fs::create_dir_all(&dir)?;
			debug!(?dir, "Ensured workspace subpath");
		}

		info!("Host prerequisites satisfied");
		Ok(None)
	}
}
