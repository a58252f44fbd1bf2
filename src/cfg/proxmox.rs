//! Proxmox section of the build specification.

use serde_derive::{Deserialize, Serialize};

fn _default_pve_version() -> String {
	String::from("8")
}

fn _default_pve_packages() -> Vec<String> {
	["proxmox-ve", "postfix", "open-iscsi", "chrony"].map(String::from).to_vec()
}

/// `proxmox_config` section. Tolerates unknown keys (the Proxmox surface
/// grows release to release); the enumerated core sections do not.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxmoxConfig {
	/// Proxmox VE major version token; selects the repository suite.
	pub version: String,
	/// Install only `pve-manager` + qemu-server instead of the full meta
	/// package.
	pub minimal_install: bool,
	pub packages: Vec<String>,
	/// Strip the "No valid subscription" dialog from the web UI assets.
	pub remove_subscription_banner: bool,
}

impl Default for ProxmoxConfig {
	fn default() -> Self {
		Self {
			version: _default_pve_version(),
			minimal_install: false,
			packages: _default_pve_packages(),
			remove_subscription_banner: true,
		}
	}
}

impl ProxmoxConfig {
	/// Package set adjusted for the minimal flag.
	#[must_use]
	pub fn effective_packages(&self) -> Vec<String> {
		if self.minimal_install {
			["pve-manager", "qemu-server", "pve-qemu-kvm"].map(String::from).to_vec()
		} else {
			self.packages.clone()
		}
	}
}
