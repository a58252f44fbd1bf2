//! Build-time staging of the security hardening profiles.
//!
//! The selected profile's assets are staged under
//! `/usr/share/zforge/hardening` in the live rootfs; the installer's
//! `securityhardening` job copies them into the target. The baseline sysctl
//! and umask are applied to the live system itself as well.

use crate::cfg::hardening::HardeningProfile;
use crate::errors::{BuildError, Result};
use crate::pipeline::{BuildContext, BuildModule};
use crate::util;
use std::path::Path;
use tracing::{debug, info};

/// (asset file, target path inside the system) per profile; `server` stages
/// baseline plus its own rows.
const BASELINE_ASSETS: &[(&str, &str)] = &[
	("hardening/sysctl-hardening.conf", "etc/sysctl.d/90-zforge-hardening.conf"),
	("hardening/blacklist-uncommon-fs.conf", "etc/modprobe.d/zforge-blacklist.conf"),
	("hardening/umask.sh", "etc/profile.d/zforge-umask.sh"),
];

const SERVER_ASSETS: &[(&str, &str)] = &[
	("hardening/sshd-hardening.conf", "etc/ssh/sshd_config.d/90-zforge.conf"),
	("hardening/nftables-default-deny.conf", "etc/nftables.conf"),
];

pub struct SecurityHardening;

impl BuildModule for SecurityHardening {
	fn name(&self) -> &'static str {
		"security_hardening"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let profile = ctx.plan.security_hardening;
		if !profile.is_active() {
			info!("Hardening profile is `none`, nothing to stage");
			return Ok(Some(serde_json::json!({ "profile": "none" })));
		}

		let chroot = ctx.workspace.chroot();
		let staged = chroot.join("usr/share/zforge/hardening").join(profile.as_str());
		stage_assets(ctx, &staged, BASELINE_ASSETS)?;
		if profile == HardeningProfile::Server {
			stage_assets(ctx, &staged, SERVER_ASSETS)?;
			let executor = ctx.chroot_executor();
			let session = executor.enter()?;
			session
				.run(&["apt-get", "install", "-y", "--no-install-recommends", "nftables", "openssh-server"])
				.map_err(|e| BuildError::PackageInstall(e.to_string()))?;
		}

		// live system gets the baseline immediately; the target re-applies
		// through the installer job
		for (asset, target) in BASELINE_ASSETS {
			let src = ctx.assets_dir.join(asset);
			let dest = chroot.join(target);
			if let Some(parent) = dest.parent() {
				std::fs::create_dir_all(parent)?;
			}
			std::fs::copy(&src, &dest)?;
		}
		util::just_write(
			staged.join("profile"),
			format!("{}\n", profile.as_str()),
		)?;

		info!(profile = profile.as_str(), "Hardening assets staged");
		Ok(Some(serde_json::json!({ "profile": profile.as_str() })))
	}
}

fn stage_assets(ctx: &BuildContext, staged: &Path, assets: &[(&str, &str)]) -> Result<()> {
	for (asset, target) in assets {
		let src = ctx.assets_dir.join(asset);
		if !src.exists() {
			return Err(BuildError::missing(format!("hardening asset {}", src.display())));
		}
		// keep the target-relative path so the installer job can replay it
		let dest = staged.join(target);
		if let Some(parent) = dest.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::copy(&src, &dest)?;
		debug!(%asset, %target, "Staged hardening asset");
	}
	Ok(())
}
