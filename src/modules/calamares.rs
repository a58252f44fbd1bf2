//! Calamares integration: install the installer framework, copy the custom
//! job/view modules into the live rootfs and compose the installer
//! sequence.

use crate::errors::{BuildError, Result};
use crate::pipeline::{BuildContext, BuildModule};
use crate::tpl;
use crate::util;
use std::path::Path;
use tracing::{debug, info};

/// Frozen list of installer modules this image must ship. A missing source
/// tree for any of these fails the build early.
pub const REQUIRED_MODULES: &[&str] = &[
	"zfspooldetect",
	"zfsrootselect",
	"zfsbootloader",
	"proxmoxconfig",
	"zforgefinalize",
	"securityhardening",
	"telemetryconsent",
	"telemetryjob",
];

/// Runs while the welcome page is up; pool discovery results are in
/// globalstorage before `zfsrootselect` renders.
const INIT_SEQUENCE: &[&str] = &["zfspooldetect"];

/// Pages shown to the operator, in order.
const SHOW_SEQUENCE: &[&str] = &[
	"welcome",
	"locale",
	"keyboard",
	"telemetryconsent",
	"netinstall",
	"partition",
	"zfsrootselect",
	"users",
	"summary",
];

/// Jobs executed after confirmation, in order. `telemetryjob` runs last and
/// is non-fatal by design.
const EXEC_SEQUENCE: &[&str] = &[
	"unpackfs",
	"fstab",
	"users",
	"networkcfg",
	"bootloader",
	"zfsbootloader",
	"proxmoxconfig",
	"securityhardening",
	"zforgefinalize",
	"telemetryjob",
];

pub struct CalamaresIntegration;

impl BuildModule for CalamaresIntegration {
	fn name(&self) -> &'static str {
		"calamares_integration"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let module_root = ctx.assets_dir.join("calamares/modules");
		check_module_sources(&module_root)?;

		let executor = ctx.chroot_executor();
		let session = executor.enter()?;
		session
			.run(&["apt-get", "install", "-y", "calamares", "qml-module-qtquick2"])
			.map_err(|e| BuildError::PackageInstall(e.to_string()))?;

		let chroot = ctx.workspace.chroot();
		for name in REQUIRED_MODULES {
			let dest = chroot.join("etc/calamares/modules").join(name);
			util::copy_dir(&module_root.join(name), &dest)?;
			debug!(module = %name, "Installed installer module");
		}

		write_settings(ctx, &chroot)?;
		write_branding(ctx, &chroot)?;

		info!(modules = REQUIRED_MODULES.len(), "Installer composed");
		Ok(None)
	}
}

/// Every required module must bring a descriptor plus at least one
/// script/view file.
fn check_module_sources(module_root: &Path) -> Result<()> {
	for name in REQUIRED_MODULES {
		let dir = module_root.join(name);
		if !dir.join("module.desc").exists() {
			return Err(BuildError::InstallerAssetMissing((*name).to_owned()));
		}
		let has_payload = std::fs::read_dir(&dir)?
			.filter_map(std::result::Result::ok)
			.any(|e| e.file_name() != "module.desc");
		if !has_payload {
			return Err(BuildError::InstallerAssetMissing((*name).to_owned()));
		}
	}
	Ok(())
}

fn write_settings(ctx: &BuildContext, chroot: &Path) -> Result<()> {
	let init_sequence = INIT_SEQUENCE;
	let show_sequence = SHOW_SEQUENCE;
	let exec_sequence = EXEC_SEQUENCE;
	let branding = ctx.plan.builder_config.build_name.clone();
	tpl!("calamares-settings.conf.tera" => { init_sequence, show_sequence, exec_sequence, branding }
		=> chroot.join("etc/calamares/settings.conf"));
	Ok(())
}

fn write_branding(ctx: &BuildContext, chroot: &Path) -> Result<()> {
	let name = ctx.plan.builder_config.build_name.clone();
	let version = ctx.plan.builder_config.version_tag.clone();
	tpl!("calamares-branding.desc.tera" => { name, version }
		=> chroot.join("etc/calamares/branding").join(&name).join("branding.desc"));
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn scaffold_modules(root: &Path, names: &[&str]) {
		for name in names {
			let dir = root.join(name);
			std::fs::create_dir_all(&dir).unwrap();
			std::fs::write(dir.join("module.desc"), "type: job\n").unwrap();
			std::fs::write(dir.join("main.py"), "# job\n").unwrap();
		}
	}

	#[test]
	fn all_modules_present_passes() {
		let tmp = tempfile::tempdir().unwrap();
		scaffold_modules(tmp.path(), REQUIRED_MODULES);
		check_module_sources(tmp.path()).unwrap();
	}

	#[test]
	fn missing_module_is_named() {
		let tmp = tempfile::tempdir().unwrap();
		let partial: Vec<&str> =
			REQUIRED_MODULES.iter().copied().filter(|n| *n != "zfsbootloader").collect();
		scaffold_modules(tmp.path(), &partial);
		let err = check_module_sources(tmp.path()).unwrap_err();
		match err {
			BuildError::InstallerAssetMissing(name) => assert_eq!(name, "zfsbootloader"),
			other => panic!("unexpected error: {other}"),
		}
	}

	#[test]
	fn descriptor_without_payload_is_missing_too() {
		let tmp = tempfile::tempdir().unwrap();
		scaffold_modules(tmp.path(), REQUIRED_MODULES);
		let lonely = tmp.path().join("telemetryjob");
		std::fs::remove_file(lonely.join("main.py")).unwrap();
		let err = check_module_sources(tmp.path()).unwrap_err();
		assert!(matches!(err, BuildError::InstallerAssetMissing(n) if n == "telemetryjob"));
	}

	#[test]
	fn telemetry_runs_last_in_exec_sequence() {
		assert_eq!(EXEC_SEQUENCE.last(), Some(&"telemetryjob"));
		assert!(SHOW_SEQUENCE.contains(&"telemetryconsent"));
		assert!(SHOW_SEQUENCE.contains(&"zfsrootselect"));
		// every custom job is scheduled
		for name in ["zfsbootloader", "proxmoxconfig", "securityhardening", "zforgefinalize"] {
			assert!(EXEC_SEQUENCE.contains(&name), "{name} not scheduled");
		}
	}
}
