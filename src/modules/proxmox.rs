//! Proxmox integration: repository, package set, subscription banner.

use crate::errors::{BuildError, Result};
use crate::pipeline::{BuildContext, BuildModule};
use crate::util;
use itertools::Itertools;
use tracing::{debug, info};

/// The web UI asset carrying the subscription dialog.
const PROXMOXLIB: &str = "/usr/share/javascript/proxmox-widget-toolkit/proxmoxlib.js";

pub struct ProxmoxIntegration;

impl BuildModule for ProxmoxIntegration {
	fn name(&self) -> &'static str {
		"proxmox_integration"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let chroot = ctx.workspace.chroot();
		let suite = ctx.plan.builder_config.debian_release.as_str();

		util::just_write(
			chroot.join("etc/apt/sources.list.d/pve.list"),
			format!("deb [signed-by=/usr/share/keyrings/proxmox-release.gpg] http://download.proxmox.com/debian/pve {suite} pve-no-subscription\n"),
		)?;
		// the enterprise repo needs a subscription; make sure a leftover
		// list file cannot break apt update
		let enterprise = chroot.join("etc/apt/sources.list.d/pve-enterprise.list");
		if enterprise.exists() {
			std::fs::remove_file(&enterprise)?;
		}

		let executor = ctx.chroot_executor();
		let session = executor.enter()?;
		util::retry_network("apt-get update", || session.run(&["apt-get", "update"]).map(drop))?;

		let packages = ctx.plan.proxmox_config.effective_packages();
		info!(packages = %packages.iter().join(","), "Installing Proxmox packages");
		let mut argv = vec!["apt-get", "install", "-y"];
		argv.extend(packages.iter().map(String::as_str));
		session.run(&argv).map_err(|e| BuildError::PackageInstall(e.to_string()))?;

		if ctx.plan.proxmox_config.remove_subscription_banner {
			suppress_subscription_banner(&session)?;
		}

		Ok(Some(serde_json::json!({ "proxmox_version": ctx.plan.proxmox_config.version })))
	}
}

/// Patch the "No valid subscription" dialog out of the widget toolkit.
/// Tolerates the file being absent (minimal installs).
fn suppress_subscription_banner(session: &crate::chroot::ChrootSession) -> Result<()> {
	let sed = format!(
		"if [ -f {PROXMOXLIB} ]; then \
		   sed -i.zforge-orig \"s/data.status.toLowerCase() !== 'active'/false/\" {PROXMOXLIB}; \
		 fi"
	);
	session.run(&["sh", "-c", &sed])?;
	debug!("Subscription banner suppressed");
	Ok(())
}
