//! Durable per-module checkpoints.
//!
//! One JSON file under the workspace `state/` directory records, for every
//! module, its last outcome plus an opaque resume payload the module may
//! hand back. Only the pipeline runner mutates it. Writes are
//! write-tmp-then-rename so a crash never leaves a torn file.

use crate::errors::{BuildError, Result};
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

const STORE_FILE: &str = "checkpoints.json";

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
	Success,
	Error,
	Skipped,
}

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq)]
pub struct Checkpoint {
	pub status: CheckpointStatus,
	/// Unix seconds of the last status change.
	pub completed_at: u64,
	/// Error message when `status == Error`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// Opaque module-owned resume payload.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resume: Option<serde_json::Value>,
}

pub struct CheckpointStore {
	path: PathBuf,
	records: IndexMap<String, Checkpoint>,
}

fn now_unix() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl CheckpointStore {
	/// Open (or start empty) the store under `state_dir`.
	///
	/// # Errors
	/// IO reading an existing file; a corrupt store is a hard error rather
	/// than a silent restart from scratch.
	pub fn open(state_dir: &Path) -> Result<Self> {
		let path = state_dir.join(STORE_FILE);
		let records = if path.exists() {
			let text = std::fs::read_to_string(&path)?;
			serde_json::from_str(&text).map_err(|e| {
				BuildError::other(format!("corrupt checkpoint store {}: {e}", path.display()))
			})?
		} else {
			IndexMap::new()
		};
		debug!(?path, modules = records.len(), "Opened checkpoint store");
		Ok(Self { path, records })
	}

	fn persist(&self) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let tmp = self.path.with_extension("json.tmp");
		let text = serde_json::to_string_pretty(&self.records)
			.map_err(|e| BuildError::other(format!("serializing checkpoints: {e}")))?;
		std::fs::write(&tmp, text)?;
		std::fs::rename(&tmp, &self.path)?;
		trace!(path = ?self.path, "Checkpoints persisted");
		Ok(())
	}

	/// # Errors
	/// IO persisting the store.
	pub fn record_success(
		&mut self, module: &str, resume: Option<serde_json::Value>,
	) -> Result<()> {
		self.records.insert(
			module.to_owned(),
			Checkpoint {
				status: CheckpointStatus::Success,
				completed_at: now_unix(),
				error: None,
				resume,
			},
		);
		self.persist()
	}

	/// # Errors
	/// IO persisting the store.
	pub fn record_error(&mut self, module: &str, error: &BuildError) -> Result<()> {
		// keep the old resume payload so a fixed rerun can pick it up
		let resume = self.records.get(module).and_then(|c| c.resume.clone());
		self.records.insert(
			module.to_owned(),
			Checkpoint {
				status: CheckpointStatus::Error,
				completed_at: now_unix(),
				error: Some(error.to_string()),
				resume,
			},
		);
		self.persist()
	}

	/// # Errors
	/// IO persisting the store.
	pub fn record_skipped(&mut self, module: &str) -> Result<()> {
		self.records.insert(
			module.to_owned(),
			Checkpoint {
				status: CheckpointStatus::Skipped,
				completed_at: now_unix(),
				error: None,
				resume: None,
			},
		);
		self.persist()
	}

	#[must_use]
	pub fn get(&self, module: &str) -> Option<&Checkpoint> {
		self.records.get(module)
	}

	#[must_use]
	pub fn is_success(&self, module: &str) -> bool {
		self.get(module).is_some_and(|c| c.status == CheckpointStatus::Success)
	}

	#[must_use]
	pub fn resume_payload(&self, module: &str) -> Option<serde_json::Value> {
		self.get(module).and_then(|c| c.resume.clone())
	}

	/// All records in insertion order, for `inspect-checkpoint`.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &Checkpoint)> {
		self.records.iter().map(|(name, cp)| (name.as_str(), cp))
	}

	/// Index of the first module (by declared order) whose checkpoint is not
	/// a success; `None` when the whole pipeline already completed.
	#[must_use]
	pub fn first_incomplete(&self, module_order: &[&str]) -> Option<usize> {
		module_order.iter().position(|name| !self.is_success(name))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn records_survive_reload() {
		let tmp = tempfile::tempdir().unwrap();
		let mut store = CheckpointStore::open(tmp.path()).unwrap();
		store
			.record_success("kernel_acquisition", Some(serde_json::json!({"version": "6.8.12-2-pve"})))
			.unwrap();
		store.record_error("zfs_build", &BuildError::other("boom")).unwrap();

		let store = CheckpointStore::open(tmp.path()).unwrap();
		assert!(store.is_success("kernel_acquisition"));
		assert_eq!(
			store.resume_payload("kernel_acquisition").unwrap()["version"],
			"6.8.12-2-pve"
		);
		let failed = store.get("zfs_build").unwrap();
		assert_eq!(failed.status, CheckpointStatus::Error);
		assert_eq!(failed.error.as_deref(), Some("boom"));
	}

	#[test]
	fn first_incomplete_resumes_after_last_success() {
		let tmp = tempfile::tempdir().unwrap();
		let mut store = CheckpointStore::open(tmp.path()).unwrap();
		let order = ["workspace_setup", "debootstrap", "kernel_acquisition"];
		assert_eq!(store.first_incomplete(&order), Some(0));

		store.record_success("workspace_setup", None).unwrap();
		store.record_error("debootstrap", &BuildError::other("net down")).unwrap();
		assert_eq!(store.first_incomplete(&order), Some(1));

		store.record_success("debootstrap", None).unwrap();
		store.record_success("kernel_acquisition", None).unwrap();
		assert_eq!(store.first_incomplete(&order), None);
	}

	#[test]
	fn error_keeps_previous_resume_payload() {
		let tmp = tempfile::tempdir().unwrap();
		let mut store = CheckpointStore::open(tmp.path()).unwrap();
		store.record_success("zfs_build", Some(serde_json::json!({"zfs": "2.2.4"}))).unwrap();
		store.record_error("zfs_build", &BuildError::other("modprobe failed")).unwrap();
		assert_eq!(store.resume_payload("zfs_build").unwrap()["zfs"], "2.2.4");
	}
}
