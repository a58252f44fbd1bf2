//! OpenZFS: DKMS packages or a from-source build against the installed
//! kernel headers.

use crate::errors::{BuildError, Result};
use crate::modules::kernel::installed_kernel_version;
use crate::pipeline::{BuildContext, BuildModule};
use crate::util;
use tracing::{debug, info, warn};

const ZFS_GIT_URL: &str = "https://github.com/openzfs/zfs.git";

/// Build dependencies for a from-source OpenZFS build.
const BUILD_DEPS: &[&str] = &[
	"build-essential",
	"autoconf",
	"automake",
	"libtool",
	"gawk",
	"alien",
	"fakeroot",
	"dkms",
	"libblkid-dev",
	"uuid-dev",
	"libudev-dev",
	"libssl-dev",
	"zlib1g-dev",
	"libaio-dev",
	"libattr1-dev",
	"libelf-dev",
	"python3",
	"python3-dev",
	"python3-setuptools",
	"python3-cffi",
	"libffi-dev",
	"git",
];

pub struct ZfsBuild;

impl BuildModule for ZfsBuild {
	fn name(&self) -> &'static str {
		"zfs_build"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let kver = installed_kernel_version(&ctx.workspace.chroot())?;
		let executor = ctx.chroot_executor();
		let session = executor.enter()?;

		if ctx.plan.zfs_config.build_from_source {
			info!(%kver, "Building OpenZFS from source");
			build_from_source(ctx, &session, &kver)?;
		} else {
			info!(%kver, "Installing OpenZFS via DKMS");
			session
				.run(&[
					"apt-get",
					"install",
					"-y",
					"zfs-dkms",
					"zfsutils-linux",
					"libzfs4linux",
				])
				.map_err(|e| match e {
					BuildError::CommandFailed { .. } => BuildError::KernelZfsMismatch {
						kernel: kver.clone(),
						details: e.to_string(),
					},
					other => other,
				})?;
		}

		// the real proof is initramfs generation and live boot; modprobe is
		// only meaningful when the build host runs the chroot's kernel
		let host_kver = host_kernel_release().unwrap_or_default();
		if host_kver == kver {
			session.run(&["modprobe", "zfs"]).map_err(|e| BuildError::KernelZfsMismatch {
				kernel: kver.clone(),
				details: e.to_string(),
			})?;
		} else {
			debug!(%host_kver, chroot_kver = %kver, "Host kernel differs, skipping modprobe check");
		}

		let zfs_version = match session.run(&["zfs", "version"]) {
			Ok(out) => out.stdout.lines().next().unwrap_or("unknown").to_owned(),
			Err(e) => {
				warn!(error = %e, "Could not read zfs version");
				String::from("unknown")
			},
		};
		info!(%zfs_version, "ZFS ready");
		Ok(Some(serde_json::json!({ "zfs_version": zfs_version, "kver": kver })))
	}
}

fn build_from_source(
	ctx: &BuildContext, session: &crate::chroot::ChrootSession, kver: &str,
) -> Result<()> {
	let mut argv = vec!["apt-get", "install", "-y", "--no-install-recommends"];
	argv.extend_from_slice(BUILD_DEPS);
	session.run(&argv).map_err(|e| BuildError::PackageInstall(e.to_string()))?;

	// the retained workspace is the checkpoint: a rerun over the same
	// chroot skips the clone
	if ctx.workspace.chroot().join("usr/src/zfs/configure.ac").exists() {
		info!("OpenZFS checkout already present in the chroot");
	} else {
		let mut clone = vec!["git", "clone", "--depth=1"];
		let tag;
		if let Some(version) = ctx.plan.zfs_config.zfs_version.as_deref() {
			tag = format!("zfs-{version}");
			clone.extend_from_slice(&["--branch", &tag]);
		}
		clone.extend_from_slice(&[ZFS_GIT_URL, "/usr/src/zfs"]);
		util::retry_network("git clone openzfs", || session.run(&clone).map(drop))?;
	}

	let build = format!(
		"cd /usr/src/zfs\n\
		 ./autogen.sh\n\
		 ./configure --with-linux=/lib/modules/{kver}/build --with-linux-obj=/lib/modules/{kver}/build\n\
		 make -j\"$(nproc)\"\n\
		 make install\n\
		 depmod {kver}\n\
		 ldconfig\n"
	);
	session.run_script("zfs-build", &build).map_err(|e| BuildError::KernelZfsMismatch {
		kernel: kver.to_owned(),
		details: e.to_string(),
	})?;
	Ok(())
}

fn host_kernel_release() -> Option<String> {
	std::process::Command::new("uname")
		.arg("-r")
		.output()
		.ok()
		.filter(|o| o.status.success())
		.map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_deps_cover_the_autotools_stack() {
		for dep in ["autoconf", "automake", "libtool", "dkms", "libelf-dev"] {
			assert!(BUILD_DEPS.contains(&dep), "{dep} missing");
		}
	}

	#[test]
	fn host_kernel_release_is_readable() {
		assert!(host_kernel_release().is_some());
	}
}
