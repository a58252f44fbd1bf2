//! Bootloader staging: ZFSBootMenu under the EFI tree, optionally an
//! OpenCore first stage for NVMe-blind firmware, plus their configuration
//! templates.

use crate::errors::{BuildError, Result};
use crate::pipeline::{BuildContext, BuildModule};
use crate::tpl;
use crate::util::{self, run_streamed};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Release EFI bundle; the redirect always points at the latest build.
const ZBM_RELEASE_URL: &str = "https://get.zfsbootmenu.org/efi";

/// Written when a hardware overlay supplies no PCIe device path. Boots
/// nothing as-is; the warning tells the operator to fix the overlay.
pub const PLACEHOLDER_DEVICE_PATH: &str =
	"PciRoot(0x0)/Pci(0x1,0x0)/Pci(0x0,0x0)/NVMe(0x1,00-00-00-00-00-00-00-00)";

/// Where OpenCore chainloads ZFSBootMenu from, relative to the ESP.
pub const ZBM_ESP_PATH: &str = "\\EFI\\BOOT\\BOOTX64.EFI";

pub struct BootloaderSetup;

impl BuildModule for BootloaderSetup {
	fn name(&self) -> &'static str {
		"bootloader_setup"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let efi = ctx.workspace.efi_dir();
		let zbm_image = acquire_zfsbootmenu(ctx)?;

		std::fs::create_dir_all(efi.join("EFI/BOOT"))?;
		std::fs::copy(&zbm_image, efi.join("EFI/BOOT/BOOTX64.EFI"))?;
		// second copy under a stable name for the installer to place on ESPs
		std::fs::create_dir_all(efi.join("EFI/ZBM"))?;
		std::fs::copy(&zbm_image, efi.join("EFI/ZBM/ZFSBOOTMENU.EFI"))?;
		info!("Staged ZFSBootMenu EFI image");

		write_zbm_config(ctx)?;

		if ctx.plan.bootloader_config.opencore.enable_opencore {
			stage_opencore(ctx, &efi)?;
		}

		Ok(None)
	}
}

/// Use a repo-local image when provided, otherwise fetch the release bundle
/// into the package cache (kept across builds).
fn acquire_zfsbootmenu(ctx: &BuildContext) -> Result<PathBuf> {
	let local = ctx.assets_dir.join("boot/zfsbootmenu.EFI");
	if local.exists() {
		info!(?local, "Using repo-local ZFSBootMenu image");
		return Ok(local);
	}
	let cached = ctx.workspace.cache().join("zfsbootmenu/zfsbootmenu-release-x86_64.EFI");
	if cached.exists() {
		info!(?cached, "Using cached ZFSBootMenu image");
		return Ok(cached);
	}
	std::fs::create_dir_all(cached.parent().ok_or_else(|| BuildError::other("cache path has no parent"))?)?;
	let idle = ctx.plan.builder_config.watchdog_idle();
	util::retry_network("fetch zfsbootmenu", || {
		let mut cmd = Command::new("wget");
		cmd.arg("-qO").arg(&cached).arg(ZBM_RELEASE_URL);
		run_streamed(&mut cmd, idle).map(drop)
	})?;
	Ok(cached)
}

fn write_zbm_config(ctx: &BuildContext) -> Result<()> {
	let distro = ctx.plan.builder_config.build_name.clone();
	let cmdline = ctx.plan.bootloader_config.zbm_cmdline();
	let dest = ctx.workspace.chroot().join("etc/zfsbootmenu/config.yaml");
	tpl!("zfsbootmenu-config.yaml.tera" => { distro, cmdline } => dest);
	Ok(())
}

fn stage_opencore(ctx: &BuildContext, efi: &Path) -> Result<()> {
	let oc = &ctx.plan.bootloader_config.opencore;
	let src = ctx.assets_dir.join("boot/opencore");
	if !src.join("OpenCore.efi").exists() {
		return Err(BuildError::missing(format!(
			"OpenCore EFI tree at {} (enable_opencore is set)",
			src.display()
		)));
	}

	let dest = efi.join("EFI/OC");
	std::fs::create_dir_all(dest.join("Drivers"))?;
	std::fs::copy(src.join("OpenCore.efi"), dest.join("OpenCore.efi"))?;
	for driver in &oc.drivers {
		let driver_src = src.join("Drivers").join(driver);
		if !driver_src.exists() {
			return Err(BuildError::missing(format!(
				"OpenCore driver {driver} under {}",
				src.join("Drivers").display()
			)));
		}
		std::fs::copy(&driver_src, dest.join("Drivers").join(driver))?;
	}

	let device_path = oc.device_path_template.clone().unwrap_or_else(|| {
		warn!(
			"Hardware overlay supplies no PCIe device path for OpenCore; \
			 writing a placeholder that will need editing before boot"
		);
		PLACEHOLDER_DEVICE_PATH.to_owned()
	});
	write_opencore_plist(&dest.join("config.plist"), &device_path, &oc.drivers)?;
	info!("Staged OpenCore chainload stage");
	Ok(())
}

/// Single boot entry chainloading ZFSBootMenu through the given device path.
fn write_opencore_plist(dest: &Path, device_path: &str, drivers: &[String]) -> Result<()> {
	let chainload = ZBM_ESP_PATH;
	tpl!("opencore-config.plist.tera" => { device_path, chainload, drivers } => dest);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plist_carries_single_chainload_entry() {
		let tmp = tempfile::tempdir().unwrap();
		let dest = tmp.path().join("config.plist");
		write_opencore_plist(
			&dest,
			"PciRoot(0x0)/Pci(0x3,0x0)/Pci(0x0,0x0)",
			&["OpenRuntime.efi".into(), "NvmExpressDxe.efi".into()],
		)
		.unwrap();
		let plist = std::fs::read_to_string(&dest).unwrap();
		assert!(plist.contains("PciRoot(0x0)/Pci(0x3,0x0)/Pci(0x0,0x0)"));
		assert!(plist.contains("\\EFI\\BOOT\\BOOTX64.EFI"));
		assert!(plist.contains("NvmExpressDxe.efi"));
		assert_eq!(plist.matches("<key>Path</key>").count(), 1, "one boot entry only");
	}

	#[test]
	fn placeholder_path_is_wired_when_overlay_is_silent() {
		assert!(PLACEHOLDER_DEVICE_PATH.starts_with("PciRoot"));
		assert!(PLACEHOLDER_DEVICE_PATH.contains("NVMe"));
	}
}
