//! Declared pipeline module list.
//!
//! Order is authoritative: later modules may depend on everything an earlier
//! module left behind. Enable flags only skip, they never reorder.

use serde::{Deserialize, Serialize};

/// The canonical pipeline, in execution order.
pub const CANONICAL_PIPELINE: &[&str] = &[
	"workspace_setup",
	"debootstrap",
	"kernel_acquisition",
	"zfs_build",
	"dracut_config",
	"proxmox_integration",
	"bootloader_setup",
	"live_environment",
	"calamares_integration",
	"security_hardening",
	"encryption_support",
	"iso_generation",
];

const fn _default_true() -> bool {
	true
}

/// One `(name, enabled)` pair from the spec file. A bare string enables the
/// module; the map form can switch it off.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModuleDecl {
	pub name: String,
	pub enabled: bool,
}

impl ModuleDecl {
	#[must_use]
	pub fn enabled(name: &str) -> Self {
		Self { name: name.to_owned(), enabled: true }
	}
}

impl<'de> Deserialize<'de> for ModuleDecl {
	fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Name(String),
			Full {
				name: String,
				#[serde(default = "_default_true")]
				enabled: bool,
			},
		}
		Ok(match Raw::deserialize(de)? {
			Raw::Name(name) => Self { name, enabled: true },
			Raw::Full { name, enabled } => Self { name, enabled },
		})
	}
}

/// The canonical module list as `ModuleDecl`s, all enabled.
#[must_use]
pub fn canonical_modules() -> Vec<ModuleDecl> {
	CANONICAL_PIPELINE.iter().map(|name| ModuleDecl::enabled(name)).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bare_string_enables_module() {
		let decls: Vec<ModuleDecl> =
			serde_yaml::from_str("- debootstrap\n- name: zfs_build\n  enabled: false\n").unwrap();
		assert_eq!(decls[0], ModuleDecl::enabled("debootstrap"));
		assert_eq!(decls[1].name, "zfs_build");
		assert!(!decls[1].enabled);
	}

	#[test]
	fn canonical_pipeline_has_twelve_stages() {
		assert_eq!(CANONICAL_PIPELINE.len(), 12);
		assert_eq!(CANONICAL_PIPELINE[0], "workspace_setup");
		assert_eq!(CANONICAL_PIPELINE[11], "iso_generation");
	}
}
