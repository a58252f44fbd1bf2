//! Security hardening profile selection.

use serde::{Deserialize, Serialize};

/// Hardening applied to the installed target. `Baseline` covers umask,
/// sysctl and a filesystem-module blacklist; `Server` adds the sshd drop-in
/// and a default-deny firewall; `None` leaves the target alone.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardeningProfile {
	#[default]
	Baseline,
	Server,
	None,
}

impl HardeningProfile {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Baseline => "baseline",
			Self::Server => "server",
			Self::None => "none",
		}
	}

	/// Whether the profile stages any assets at all.
	#[must_use]
	pub const fn is_active(self) -> bool {
		!matches!(self, Self::None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn profile_parses_and_defaults() {
		let p: HardeningProfile = serde_yaml::from_str("server").unwrap();
		assert_eq!(p, HardeningProfile::Server);
		assert_eq!(HardeningProfile::default(), HardeningProfile::Baseline);
		assert!(serde_yaml::from_str::<HardeningProfile>("paranoid").is_err());
	}

	#[test]
	fn none_is_inactive() {
		assert!(!HardeningProfile::None.is_active());
		assert!(HardeningProfile::Baseline.is_active());
	}
}
