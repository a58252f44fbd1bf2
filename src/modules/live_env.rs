//! Live environment: autologin, installer autostart, live user, branding.

use crate::errors::Result;
use crate::pipeline::{BuildContext, BuildModule};
use crate::tpl;
use crate::util;
use tracing::{debug, info};

/// Unprivileged account the live session runs as.
pub const LIVE_USER: &str = "zforge";

/// The only commands the live user may escalate; the installer needs these
/// and nothing else.
const SUDO_COMMANDS: &str =
	"/usr/bin/calamares, /usr/sbin/zpool, /usr/sbin/zfs, /usr/sbin/chroot, /usr/local/sbin/zforge-bench";

pub struct LiveEnvironment;

impl BuildModule for LiveEnvironment {
	fn name(&self) -> &'static str {
		"live_environment"
	}

	fn execute(
		&self, ctx: &BuildContext, _resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>> {
		let chroot = ctx.workspace.chroot();
		let executor = ctx.chroot_executor();
		let session = executor.enter()?;

		// tolerated: user exists on reruns
		session.run_tolerant(&[
			"useradd",
			"--create-home",
			"--shell",
			"/bin/bash",
			"--comment",
			"zforge live session",
			LIVE_USER,
		])?;
		session.run(&["passwd", "-d", LIVE_USER]).map(drop)?;

		util::just_write(
			chroot.join("etc/sudoers.d/10-zforge-live"),
			format!("{LIVE_USER} ALL=(ALL) NOPASSWD: {SUDO_COMMANDS}\n"),
		)?;

		let user = LIVE_USER;
		tpl!("lightdm-autologin.conf.tera" => { user }
			=> chroot.join("etc/lightdm/lightdm.conf.d/50-zforge-autologin.conf"));

		util::just_write(
			chroot.join("etc/xdg/autostart/zforge-installer.desktop"),
			"[Desktop Entry]\n\
			 Type=Application\n\
			 Name=Install Proxmox VE (ZFS on root)\n\
			 Exec=sudo -E calamares\n\
			 X-GNOME-Autostart-enabled=true\n",
		)?;

		let name = &ctx.plan.builder_config.build_name;
		let tag = &ctx.plan.builder_config.version_tag;
		util::just_write(
			chroot.join("etc/issue"),
			format!("{name} {tag} \\n \\l\nProxmox VE installer on OpenZFS-on-root\n\n"),
		)?;
		util::just_write(
			chroot.join("etc/motd"),
			format!("\n  {name} {tag} live environment\n  The installer starts automatically on the console.\n\n"),
		)?;

		if let Some(tools) = ctx.plan.builder_config.extra_tools.as_deref() {
			info!(?tools, "Copying extra tooling into the live image");
			util::copy_dir(tools, &chroot.join("usr/local/lib/zforge/tools"))?;
		}

		debug!("Live environment configured");
		Ok(None)
	}
}
