//! Module registry and pipeline runner.
//!
//! Modules execute strictly sequentially in declared order; each one
//! observes the workspace exactly as its predecessors left it. The runner is
//! the only writer of the checkpoint store: success and error checkpoints
//! are persisted as they happen, and `--resume` fast-forwards past every
//! module whose checkpoint already says success.

use crate::cfg::BuildPlan;
use crate::checkpoint::CheckpointStore;
use crate::chroot::ChrootExecutor;
use crate::errors::{BuildError, Result};
use crate::util;
use crate::workspace::Workspace;
use indexmap::IndexMap;
use std::path::PathBuf;
use tracing::{info, info_span, warn};

/// Everything a module may touch: the validated plan and the workspace.
pub struct BuildContext {
	pub plan: BuildPlan,
	pub workspace: Workspace,
	/// Repo directory holding installer-module and dracut assets.
	pub assets_dir: PathBuf,
}

impl BuildContext {
	#[must_use]
	pub fn new(plan: BuildPlan, workspace: Workspace, assets_dir: PathBuf) -> Self {
		Self { plan, workspace, assets_dir }
	}

	/// Chroot executor wired to this build's cache policy and watchdog.
	#[must_use]
	pub fn chroot_executor(&self) -> ChrootExecutor {
		let cache = self
			.plan
			.builder_config
			.cache_packages
			.then(|| self.workspace.cache());
		ChrootExecutor::new(
			self.workspace.chroot(),
			cache,
			self.plan.builder_config.watchdog_idle(),
		)
	}
}

/// One pipeline stage. Implementations are registered by name; `execute`
/// receives the resume payload its previous successful run returned.
pub trait BuildModule {
	fn name(&self) -> &'static str;

	/// # Errors
	/// Any [`BuildError`]; the runner records it and halts the pipeline.
	fn execute(
		&self, ctx: &BuildContext, resume: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>>;
}

pub type ModuleRegistry = IndexMap<&'static str, Box<dyn BuildModule>>;

pub struct PipelineRunner {
	ctx: BuildContext,
	store: CheckpointStore,
	registry: ModuleRegistry,
}

impl PipelineRunner {
	/// # Errors
	/// Opening the checkpoint store.
	pub fn new(ctx: BuildContext, registry: ModuleRegistry) -> Result<Self> {
		let store = CheckpointStore::open(&ctx.workspace.state_dir())?;
		Ok(Self { ctx, store, registry })
	}

	/// Walk the declared modules in order. With `resume`, modules whose
	/// checkpoint is already a success are not re-executed.
	///
	/// # Errors
	/// The first module error, after it has been checkpointed.
	pub fn run(&mut self, resume: bool) -> Result<()> {
		let decls: Vec<_> = self.ctx.plan.modules.clone();
		for decl in decls {
			util::check_cancelled().inspect_err(|e| {
				drop(self.store.record_error(&decl.name, e));
			})?;

			if resume && self.store.is_success(&decl.name) {
				info!(module = %decl.name, "Checkpoint says success, skipping");
				continue;
			}
			if !decl.enabled {
				info!(module = %decl.name, "Disabled, skipping");
				self.store.record_skipped(&decl.name)?;
				continue;
			}

			let module = self.registry.get(decl.name.as_str()).ok_or_else(|| {
				BuildError::missing(format!("module `{}` is not registered", decl.name))
			})?;

			let span = info_span!("module", name = %decl.name);
			let _enter = span.enter();
			info!("Executing");
			let resume_payload = self.store.resume_payload(&decl.name);
			match module.execute(&self.ctx, resume_payload) {
				Ok(payload) => {
					self.store.record_success(&decl.name, payload)?;
					info!("Completed");
				},
				Err(e) => {
					warn!(error = %e, "Module failed");
					self.store.record_error(&decl.name, &e)?;
					return Err(e);
				},
			}
		}
		Ok(())
	}

	/// Give the workspace back once the run is over.
	#[must_use]
	pub fn into_workspace(self) -> Workspace {
		self.ctx.workspace
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfg::modules::ModuleDecl;
	use pretty_assertions::assert_eq;
	use std::cell::RefCell;
	use std::rc::Rc;

	struct Scripted {
		name: &'static str,
		fail: bool,
		log: Rc<RefCell<Vec<String>>>,
	}

	impl BuildModule for Scripted {
		fn name(&self) -> &'static str {
			self.name
		}

		fn execute(
			&self, _ctx: &BuildContext, resume: Option<serde_json::Value>,
		) -> Result<Option<serde_json::Value>> {
			self.log.borrow_mut().push(format!("{}:{}", self.name, resume.is_some()));
			if self.fail {
				return Err(BuildError::other("scripted failure"));
			}
			Ok(Some(serde_json::json!({"ran": self.name})))
		}
	}

	fn context(tmp: &tempfile::TempDir, modules: &[(&'static str, bool)]) -> BuildContext {
		let mut plan = BuildPlan::default();
		plan.modules = modules
			.iter()
			.map(|(name, enabled)| ModuleDecl { name: (*name).to_owned(), enabled: *enabled })
			.collect();
		let ws = Workspace::acquire(tmp.path().join("ws")).unwrap();
		BuildContext::new(plan, ws, PathBuf::from("assets"))
	}

	fn registry(
		specs: &[(&'static str, bool)], log: &Rc<RefCell<Vec<String>>>,
	) -> ModuleRegistry {
		specs
			.iter()
			.map(|(name, fail)| {
				(
					*name,
					Box::new(Scripted { name: *name, fail: *fail, log: Rc::clone(log) })
						as Box<dyn BuildModule>,
				)
			})
			.collect()
	}

	#[test]
	fn modules_run_in_declared_order() {
		crate::util::reset_cancel_for_tests();
		let tmp = tempfile::tempdir().unwrap();
		let log = Rc::new(RefCell::new(Vec::new()));
		let ctx = context(&tmp, &[("alpha", true), ("beta", true)]);
		let reg = registry(&[("alpha", false), ("beta", false)], &log);
		let mut runner = PipelineRunner::new(ctx, reg).unwrap();
		runner.run(false).unwrap();
		assert_eq!(*log.borrow(), ["alpha:false", "beta:false"]);
	}

	#[test]
	fn error_aborts_and_checkpoints() {
		crate::util::reset_cancel_for_tests();
		let tmp = tempfile::tempdir().unwrap();
		let log = Rc::new(RefCell::new(Vec::new()));
		let ctx = context(&tmp, &[("alpha", true), ("beta", true), ("gamma", true)]);
		let state_dir = ctx.workspace.state_dir();
		let reg = registry(&[("alpha", false), ("beta", true), ("gamma", false)], &log);
		let mut runner = PipelineRunner::new(ctx, reg).unwrap();
		runner.run(false).unwrap_err();
		// gamma never ran
		assert_eq!(*log.borrow(), ["alpha:false", "beta:false"]);

		let store = CheckpointStore::open(&state_dir).unwrap();
		assert!(store.is_success("alpha"));
		assert!(!store.is_success("beta"));
		assert!(store.get("beta").unwrap().error.as_deref().unwrap().contains("scripted"));
		assert!(store.get("gamma").is_none());
	}

	#[test]
	fn resume_skips_completed_and_hands_back_payload() {
		crate::util::reset_cancel_for_tests();
		let tmp = tempfile::tempdir().unwrap();
		let log = Rc::new(RefCell::new(Vec::new()));
		let ctx = context(&tmp, &[("alpha", true), ("beta", true)]);
		let state_dir = ctx.workspace.state_dir();
		let reg = registry(&[("alpha", false), ("beta", true)], &log);
		let mut runner = PipelineRunner::new(ctx, reg).unwrap();
		runner.run(false).unwrap_err();
		drop(runner.into_workspace().release());

		// "fix" beta and resume: alpha must not re-execute, beta sees its
		// stale resume payload (none here, it never succeeded)
		let log2 = Rc::new(RefCell::new(Vec::new()));
		let mut plan = BuildPlan::default();
		plan.modules =
			vec![ModuleDecl::enabled("alpha"), ModuleDecl::enabled("beta")];
		let ws = Workspace::acquire(tmp.path().join("ws")).unwrap();
		let ctx = BuildContext::new(plan, ws, PathBuf::from("assets"));
		let reg = registry(&[("alpha", false), ("beta", false)], &log2);
		let mut runner = PipelineRunner::new(ctx, reg).unwrap();
		runner.run(true).unwrap();
		assert_eq!(*log2.borrow(), ["beta:false"]);

		let store = CheckpointStore::open(&state_dir).unwrap();
		assert!(store.is_success("alpha") && store.is_success("beta"));
	}

	#[test]
	fn resume_over_full_success_is_a_noop() {
		crate::util::reset_cancel_for_tests();
		let tmp = tempfile::tempdir().unwrap();
		let log = Rc::new(RefCell::new(Vec::new()));
		let ctx = context(&tmp, &[("alpha", true)]);
		let reg = registry(&[("alpha", false)], &log);
		let mut runner = PipelineRunner::new(ctx, reg).unwrap();
		runner.run(false).unwrap();
		runner.run(true).unwrap();
		assert_eq!(log.borrow().len(), 1, "resume over success re-executed a module");
	}

	#[test]
	fn disabled_module_is_checkpointed_as_skipped() {
		crate::util::reset_cancel_for_tests();
		let tmp = tempfile::tempdir().unwrap();
		let log = Rc::new(RefCell::new(Vec::new()));
		let ctx = context(&tmp, &[("alpha", false), ("beta", true)]);
		let state_dir = ctx.workspace.state_dir();
		let reg = registry(&[("alpha", false), ("beta", false)], &log);
		let mut runner = PipelineRunner::new(ctx, reg).unwrap();
		runner.run(false).unwrap();
		assert_eq!(*log.borrow(), ["beta:false"]);
		let store = CheckpointStore::open(&state_dir).unwrap();
		assert_eq!(
			store.get("alpha").unwrap().status,
			crate::checkpoint::CheckpointStatus::Skipped
		);
	}
}
