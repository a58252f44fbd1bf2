//! Populate the chroot with a minimal Debian base system.

use crate::errors::Result;
use crate::pipeline::{BuildContext, BuildModule};
use crate::util::{self, run_streamed};
use crate::tpl;
use std::process::Command;
use tracing::{debug, info};

/// Packages debootstrap folds into the base install so the very next stages
/// can talk to repositories.
const SEED_PACKAGES: &str = "ca-certificates,gnupg,locales,wget";

pub struct Debootstrap;

impl BuildModule for Debootstrap {
	fn name(&self) -> &'static str {
		"debootstrap"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let chroot = ctx.workspace.chroot();
		let release = ctx.plan.builder_config.debian_release;

		if chroot.join("usr/bin/dpkg").exists() {
			info!(?chroot, "Base system already present, not rerunning debootstrap");
		} else {
			info!(%release, "Bootstrapping base system");
			let idle = ctx.plan.builder_config.watchdog_idle();
			util::retry_network("debootstrap", || {
				let mut cmd = Command::new("debootstrap");
				cmd.arg("--variant=minbase")
					.arg(format!("--include={SEED_PACKAGES}"))
					.arg(release.as_str())
					.arg(&chroot)
					.arg("http://deb.debian.org/debian");
				run_streamed(&mut cmd, idle).map(drop)
			})?;
		}

		let suite = release.as_str();
		tpl!("sources.list.tera" => { suite } => chroot.join("etc/apt/sources.list"));

		if ctx.plan.builder_config.cache_packages {
			debug!("Enabling package cache retention");
			util::just_write(
				chroot.join("etc/apt/apt.conf.d/01zforge-cache"),
				"APT::Keep-Downloaded-Packages \"true\";\nBinary::apt::APT::Keep-Downloaded-Packages \"true\";\n",
			)?;
			if let Some(proxy) = crate::env_flag!("ZFORGE_APT_PROXY") {
				util::just_write(
					chroot.join("etc/apt/apt.conf.d/02zforge-proxy"),
					format!("Acquire::http::Proxy \"{proxy}\";\n"),
				)?;
			}
		}

		let executor = ctx.chroot_executor();
		let session = executor.enter()?;
		util::retry_network("apt-get update", || session.run(&["apt-get", "update"]).map(drop))?;
		session.run(&["locale-gen", "en_US.UTF-8"]).map(drop).or_else(|_| {
			// minbase images may lack locale-gen until locales configures
			session
				.run(&["dpkg-reconfigure", "-f", "noninteractive", "locales"])
				.map(drop)
		})?;

		info!("Base system ready");
		Ok(None)
	}
}
