//! Pipeline stages, one module per file, registered in canonical order.

pub mod workspace_setup;
pub mod debootstrap;
pub mod kernel;
pub mod zfs_build;
pub mod dracut;
pub mod proxmox;
pub mod bootloader;
pub mod live_env;
pub mod calamares;
pub mod hardening;
pub mod encryption;
pub mod iso;

use crate::pipeline::{BuildModule, ModuleRegistry};

/// All known modules keyed by name, in canonical pipeline order.
#[must_use]
pub fn registry() -> ModuleRegistry {
	let modules: Vec<Box<dyn BuildModule>> = vec![
		Box::new(workspace_setup::WorkspaceSetup),
		Box::new(debootstrap::Debootstrap),
		Box::new(kernel::KernelAcquisition),
		Box::new(zfs_build::ZfsBuild),
		Box::new(dracut::DracutConfig),
		Box::new(proxmox::ProxmoxIntegration),
		Box::new(bootloader::BootloaderSetup),
		Box::new(live_env::LiveEnvironment),
		Box::new(calamares::CalamaresIntegration),
		Box::new(hardening::SecurityHardening),
		Box::new(encryption::EncryptionSupport),
		Box::new(iso::IsoGeneration),
	];
	modules.into_iter().map(|m| (m.name(), m)).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfg::modules::CANONICAL_PIPELINE;

	#[test]
	fn registry_matches_the_canonical_pipeline() {
		let reg = registry();
		let names: Vec<_> = reg.keys().copied().collect();
		assert_eq!(names, CANONICAL_PIPELINE);
	}
}
