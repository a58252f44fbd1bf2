//! Encryption support: make sure the image can create and unlock encrypted
//! pools before it ever reaches hardware.

use crate::errors::{BuildError, Result};
use crate::pipeline::{BuildContext, BuildModule};
use tracing::{debug, info};

pub struct EncryptionSupport;

impl BuildModule for EncryptionSupport {
	fn name(&self) -> &'static str {
		"encryption_support"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let executor = ctx.chroot_executor();
		let session = executor.enter()?;

		let out = session
			.run(&["zfs", "version"])
			.map_err(|_| BuildError::missing("zfs userland in the chroot (run zfs_build first)"))?;
		let version_line = out.stdout.lines().next().unwrap_or_default().to_owned();
		if !supports_native_encryption(&version_line) {
			return Err(BuildError::missing(format!(
				"a ZFS userland with native encryption (0.8+), found `{version_line}`"
			)));
		}
		debug!(%version_line, "Native encryption available");

		// keyfiles live on a tmpfs during pool creation; /run is always
		// tmpfs on the live image, assert rather than assume
		let fstype = session.run(&["sh", "-c", "stat -f -c %T /run"])?;
		if fstype.stdout.trim() != "tmpfs" {
			return Err(BuildError::missing(format!(
				"/run on tmpfs in the live image (found {})",
				fstype.stdout.trim()
			)));
		}

		ctx.plan.zfs_config.encryption.validate()?;
		info!("Encryption tooling verified");
		Ok(Some(serde_json::json!({ "zfs": version_line })))
	}
}

/// `zfs-2.2.4-1` / `zfs-0.8.6` style version lines; native encryption
/// arrived in 0.8.
fn supports_native_encryption(version_line: &str) -> bool {
	let Some(rest) = version_line.trim().strip_prefix("zfs-") else {
		return false;
	};
	let mut parts = rest.split(['.', '-']);
	let Some(major) = parts.next().and_then(|p| p.parse::<u32>().ok()) else {
		return false;
	};
	let minor = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
	major >= 1 || (major == 0 && minor >= 8)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_gate_accepts_modern_rejects_ancient() {
		assert!(supports_native_encryption("zfs-2.2.4-1"));
		assert!(supports_native_encryption("zfs-0.8.6"));
		assert!(!supports_native_encryption("zfs-0.7.13"));
		assert!(!supports_native_encryption("what even is this"));
	}
}
