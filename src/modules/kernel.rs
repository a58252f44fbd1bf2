//! Kernel acquisition: pick a Proxmox kernel series, install kernel,
//! headers and firmware into the chroot.

use crate::errors::{BuildError, Result};
use crate::cfg::builder::KernelSelector;
use crate::pipeline::{BuildContext, BuildModule};
use crate::util;
use tracing::{debug, info};

/// Oldest kernel series `latest` may resolve to; older ones predate the
/// OpenZFS releases we build against.
const MIN_KERNEL_SERIES: (u32, u32) = (6, 2);

/// Proxmox repository definition written before the kernel install. The
/// full Proxmox integration happens later; the kernel packages alone need
/// the repo this early.
const PVE_REPO_KEY_URL: &str =
	"https://enterprise.proxmox.com/debian/proxmox-release-bookworm.gpg";

pub struct KernelAcquisition;

impl BuildModule for KernelAcquisition {
	fn name(&self) -> &'static str {
		"kernel_acquisition"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let executor = ctx.chroot_executor();
		let session = executor.enter()?;
		let suite = ctx.plan.builder_config.debian_release.as_str();

		// repo + key so apt can see proxmox kernels
		util::just_write(
			ctx.workspace.chroot().join("etc/apt/sources.list.d/pve-kernel.list"),
			format!("deb [signed-by=/usr/share/keyrings/proxmox-release.gpg] http://download.proxmox.com/debian/pve {suite} pve-no-subscription\n"),
		)?;
		util::retry_network("fetch proxmox release key", || {
			session
				.run(&[
					"wget",
					"-qO",
					"/usr/share/keyrings/proxmox-release.gpg",
					PVE_REPO_KEY_URL,
				])
				.map(drop)
		})?;
		util::retry_network("apt-get update", || session.run(&["apt-get", "update"]).map(drop))?;

		let series = match &ctx.plan.builder_config.kernel {
			KernelSelector::Version(v) => v.clone(),
			KernelSelector::Latest => {
				let listing =
					session.run(&["apt-cache", "search", "--names-only", "^proxmox-kernel-[0-9]"])?;
				resolve_latest_series(&listing.stdout, MIN_KERNEL_SERIES)?
			},
		};
		info!(%series, "Installing kernel");

		let kernel_pkg = format!("proxmox-kernel-{series}");
		let headers_pkg = format!("proxmox-headers-{series}");
		session
			.run(&[
				"apt-get",
				"install",
				"-y",
				"--no-install-recommends",
				&kernel_pkg,
				&headers_pkg,
				"pve-firmware",
			])
			.map_err(|e| BuildError::PackageInstall(e.to_string()))?;

		let kver = installed_kernel_version(&ctx.workspace.chroot())?;
		debug!(%kver, "Kernel modules directory present");

		Ok(Some(serde_json::json!({ "series": series, "kver": kver })))
	}
}

/// Concrete version of the (single) kernel installed in the chroot, read
/// from `/lib/modules`.
///
/// # Errors
/// [`BuildError::MissingRequired`] when no kernel is installed yet.
pub fn installed_kernel_version(chroot: &std::path::Path) -> Result<String> {
	let pattern = chroot.join("lib/modules/*").to_string_lossy().into_owned();
	let mut versions: Vec<String> = glob::glob(&pattern)
		.map_err(|e| BuildError::other(format!("bad glob: {e}")))?
		.filter_map(|entry| {
			entry.ok().and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
		})
		.collect();
	versions.sort();
	versions
		.pop()
		.ok_or_else(|| BuildError::missing("an installed kernel (run kernel_acquisition first)"))
}

/// Pick the newest `proxmox-kernel-X.Y` series from an `apt-cache search`
/// listing, subject to the floor.
fn resolve_latest_series(listing: &str, floor: (u32, u32)) -> Result<String> {
	let mut best: Option<(u32, u32)> = None;
	for line in listing.lines() {
		let Some(name) = line.split_whitespace().next() else { continue };
		let Some(series) = parse_kernel_series(name) else { continue };
		if series >= floor && best.is_none_or(|b| series > b) {
			best = Some(series);
		}
	}
	best.map(|(major, minor)| format!("{major}.{minor}")).ok_or_else(|| {
		BuildError::missing(format!(
			"a proxmox-kernel package at {}.{} or newer in the configured repositories",
			floor.0, floor.1
		))
	})
}

/// `proxmox-kernel-6.8` → `(6, 8)`. Signed/meta variants like
/// `proxmox-kernel-6.8.12-2-pve-signed` are ignored; the series meta package
/// is what we install.
fn parse_kernel_series(package: &str) -> Option<(u32, u32)> {
	let rest = package.strip_prefix("proxmox-kernel-")?;
	let mut parts = rest.split('.');
	let major: u32 = parts.next()?.parse().ok()?;
	let minor: u32 = parts.next()?.parse().ok()?;
	if parts.next().is_some() {
		return None; // fully qualified version, not a series meta package
	}
	Some((major, minor))
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	const LISTING: &str = "\
proxmox-kernel-6.2 - Proxmox Kernel Image
proxmox-kernel-6.5 - Proxmox Kernel Image
proxmox-kernel-6.8 - Proxmox Kernel Image
proxmox-kernel-6.8.12-2-pve - Proxmox Kernel Image (signed)
proxmox-default-kernel - Default Proxmox Kernel Image
";

	#[test]
	fn latest_series_wins() {
		assert_eq!(resolve_latest_series(LISTING, (6, 2)).unwrap(), "6.8");
	}

	#[test]
	fn floor_filters_old_series() {
		assert_eq!(resolve_latest_series(LISTING, (6, 6)).unwrap(), "6.8");
		let err = resolve_latest_series("proxmox-kernel-5.15 - old\n", (6, 2)).unwrap_err();
		assert!(matches!(err, BuildError::MissingRequired(_)));
	}

	#[test]
	fn fully_qualified_versions_are_not_series() {
		assert_eq!(parse_kernel_series("proxmox-kernel-6.8"), Some((6, 8)));
		assert_eq!(parse_kernel_series("proxmox-kernel-6.8.12-2-pve"), None);
		assert_eq!(parse_kernel_series("proxmox-default-kernel"), None);
	}

	#[test]
	fn installed_kernel_version_picks_newest() {
		let tmp = tempfile::tempdir().unwrap();
		let modules = tmp.path().join("lib/modules");
		std::fs::create_dir_all(modules.join("6.8.12-1-pve")).unwrap();
		std::fs::create_dir_all(modules.join("6.8.12-2-pve")).unwrap();
		assert_eq!(installed_kernel_version(tmp.path()).unwrap(), "6.8.12-2-pve");
	}

	#[test]
	fn missing_kernel_is_missing_required() {
		let tmp = tempfile::tempdir().unwrap();
		assert!(matches!(
			installed_kernel_version(tmp.path()).unwrap_err(),
			BuildError::MissingRequired(_)
		));
	}
}
