//! Dracut takeover: drop initramfs-tools, install dracut, write the ZFS
//! aware configuration, install the copy-to-RAM module and generate the
//! live initramfs.

use crate::errors::{BuildError, Result};
use crate::modules::kernel::installed_kernel_version;
use crate::pipeline::{BuildContext, BuildModule};
use crate::tpl;
use crate::util;
use std::path::Path;
use tracing::{debug, info};

/// Repo-relative source of the copy-to-RAM dracut module.
const TORAM_MODULE: &str = "dracut/90zforge-toram";

pub struct DracutConfig;

impl BuildModule for DracutConfig {
	fn name(&self) -> &'static str {
		"dracut_config"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let chroot = ctx.workspace.chroot();
		let kver = installed_kernel_version(&chroot)?;
		if !chroot.join("sbin/zfs").exists() && !chroot.join("usr/sbin/zfs").exists() {
			return Err(BuildError::missing("zfs userland in the chroot (run zfs_build first)"));
		}

		let executor = ctx.chroot_executor();
		let session = executor.enter()?;

		// initramfs-tools would fight dracut over /boot triggers
		info!("Removing competing initramfs generator");
		session.run_tolerant(&["apt-get", "remove", "-y", "--purge", "initramfs-tools", "initramfs-tools-core"])?;

		session
			.run(&["apt-get", "install", "-y", "--no-install-recommends", "dracut", "dracut-core", "zstd"])
			.map_err(|e| BuildError::PackageInstall(e.to_string()))?;

		write_dracut_conf(ctx, &chroot)?;
		ensure_hostid(&chroot)?;
		install_toram_module(ctx, &chroot)?;

		// the ISO needs a generic image; the target regenerates its own
		// hostonly image at install time per the written config
		info!(%kver, "Generating live initramfs");
		let image = format!("/boot/initramfs-{kver}.img");
		session
			.run(&[
				"dracut",
				"--force",
				"--no-hostonly",
				"-a",
				"dmsquash-live pollcdrom zforge-toram",
				"--kver",
				&kver,
				&image,
			])
			.map_err(|e| BuildError::InitramfsRegen(e.to_string()))?;

		let canonical = chroot.join("boot/initramfs.img");
		if canonical.exists() || canonical.is_symlink() {
			std::fs::remove_file(&canonical)?;
		}
		std::os::unix::fs::symlink(format!("initramfs-{kver}.img"), &canonical)?;
		debug!(?canonical, "Compatibility symlink in place");

		Ok(Some(serde_json::json!({ "kver": kver })))
	}
}

fn write_dracut_conf(ctx: &BuildContext, chroot: &Path) -> Result<()> {
	let dc = &ctx.plan.dracut_config;
	let modules = dc.modules.join(" ");
	let drivers = dc.extra_drivers.join(" ");
	let compress = match dc.compression {
		crate::cfg::dracut::DracutCompression::Zstd => "zstd",
		crate::cfg::dracut::DracutCompression::Gzip => "gzip",
		crate::cfg::dracut::DracutCompression::Lz4 => "lz4",
		crate::cfg::dracut::DracutCompression::Xz => "xz",
	};
	let hostonly = if dc.hostonly { "yes" } else { "no" };
	let cmdline = dc.kernel_cmdline.clone();
	tpl!("dracut-zforge.conf.tera" => { modules, drivers, compress, hostonly, cmdline }
		=> chroot.join("etc/dracut.conf.d/90-zforge.conf"));
	Ok(())
}

/// ZFS refuses to import pools without a stable host id; make one if the
/// chroot has none.
fn ensure_hostid(chroot: &Path) -> Result<()> {
	let hostid = chroot.join("etc/hostid");
	if hostid.exists() {
		return Ok(());
	}
	let bytes = uuid::Uuid::new_v4().into_bytes();
	let id: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
	util::just_write(&hostid, id)?;
	info!(?hostid, "Generated host id");
	Ok(())
}

fn install_toram_module(ctx: &BuildContext, chroot: &Path) -> Result<()> {
	let src = ctx.assets_dir.join(TORAM_MODULE);
	if !src.join("module-setup.sh").exists() {
		return Err(BuildError::missing(format!(
			"copy-to-RAM dracut module sources at {}",
			src.display()
		)));
	}
	let dest = chroot.join("usr/lib/dracut/modules.d/90zforge-toram");
	util::copy_dir(&src, &dest)?;
	for entry in std::fs::read_dir(&dest)? {
		use std::os::unix::fs::PermissionsExt;
		let entry = entry?;
		std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o755))?;
	}
	info!("Installed copy-to-RAM dracut module");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hostid_is_four_bytes_and_stable() {
		let tmp = tempfile::tempdir().unwrap();
		ensure_hostid(tmp.path()).unwrap();
		let first = std::fs::read(tmp.path().join("etc/hostid")).unwrap();
		assert_eq!(first.len(), 4);
		// second call must not rewrite it
		ensure_hostid(tmp.path()).unwrap();
		let second = std::fs::read(tmp.path().join("etc/hostid")).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn missing_toram_sources_error_names_the_path() {
		let tmp = tempfile::tempdir().unwrap();
		let ws = crate::workspace::Workspace::acquire(tmp.path().join("ws")).unwrap();
		let ctx = crate::pipeline::BuildContext::new(
			crate::cfg::BuildPlan::default(),
			ws,
			tmp.path().join("no-assets"),
		);
		let err = install_toram_module(&ctx, &ctx.workspace.chroot()).unwrap_err();
		assert!(err.to_string().contains("90zforge-toram"));
	}
}
