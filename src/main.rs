#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::pedantic)]
#![warn(clippy::suspicious)]
#![allow(clippy::implicit_return)]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};
use zforge::errors::{BuildError, Result};
use zforge::{cfg, checkpoint, modules, pipeline, util, workspace};

const WORKDIR: &str = "zforge-work";

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct ZforgeCli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run (or resume) the build pipeline.
	Build {
		/// Build specification file; absent file means all defaults
		#[arg(long, default_value = "zforge.yaml")]
		spec: PathBuf,

		/// Hardware overlay(s), deep-merged onto the spec in order
		#[arg(long)]
		overlay: Vec<PathBuf>,

		/// Continue from the first module without a success checkpoint
		#[arg(long)]
		resume: bool,

		/// Destroy the workspace (even a dirty one) before building
		#[arg(long)]
		clean: bool,

		/// Workspace root directory
		#[arg(long, default_value = WORKDIR)]
		workspace: PathBuf,

		/// Directory holding installer-module and dracut assets
		#[arg(long, default_value = "assets")]
		assets: PathBuf,
	},
	/// Print per-module checkpoint statuses for a workspace.
	InspectCheckpoint {
		#[arg(long, default_value = WORKDIR)]
		workspace: PathBuf,
	},
}

fn main() -> ExitCode {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			eprintln!("failed reading .env: {e}");
			return ExitCode::FAILURE;
		}
	}

	if let Err(e) = color_eyre::install() {
		eprintln!("failed installing error hooks: {e}");
		return ExitCode::FAILURE;
	}

	// default to info level logging, override with ZFORGE_LOG env var
	let filter = EnvFilter::try_from_env("ZFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	let fmtlyr = fmt::layer().pretty().with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);
	if tracing::subscriber::set_global_default(subscriber).is_err() {
		eprintln!("failed setting default subscriber");
		return ExitCode::FAILURE;
	}

	let cli = ZforgeCli::parse();

	match run(cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!(kind = ?error_kind(&e), "{e}");
			u8::try_from(e.exit_code()).map_or(ExitCode::FAILURE, ExitCode::from)
		},
	}
}

fn run(cli: ZforgeCli) -> Result<()> {
	match cli.command {
		Command::Build { spec, overlay, resume, clean, workspace, assets } => {
			build(&spec, &overlay, resume, clean, workspace, assets)
		},
		Command::InspectCheckpoint { workspace } => inspect_checkpoint(&workspace),
	}
}

fn build(
	spec: &std::path::Path, overlays: &[PathBuf], resume: bool, clean: bool,
	workspace_root: PathBuf, assets: PathBuf,
) -> Result<()> {
	if sudo::escalate_if_needed().is_err() {
		return Err(BuildError::missing("root privilege (sudo escalation failed)"));
	}
	util::install_signal_handlers()?;

	let plan = if spec.exists() {
		cfg::BuildPlan::load(spec, overlays)?
	} else {
		warn!(?spec, "Spec file does not exist, building with defaults");
		cfg::BuildPlan::from_value(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()))?
	};
	info!(
		release = %plan.builder_config.debian_release,
		kernel = %plan.builder_config.kernel,
		modules = plan.modules.len(),
		"Loaded build plan"
	);

	if clean {
		workspace::Workspace::destroy(&workspace_root)?;
	}

	let workspace = workspace::Workspace::acquire(workspace_root)?;
	let ctx = pipeline::BuildContext::new(plan, workspace, assets);
	let mut runner = pipeline::PipelineRunner::new(ctx, modules::registry())?;

	info!("Building image");
	match runner.run(resume) {
		Ok(()) => {
			runner.into_workspace().release()?;
			info!("Build complete");
			Ok(())
		},
		Err(e) => {
			// workspace is retained for post-mortem; its Drop still sweeps
			// any mounts the failed module left behind
			warn!("Workspace retained for inspection; fix the cause and rerun with --resume");
			Err(e)
		},
	}
}

fn inspect_checkpoint(workspace_root: &std::path::Path) -> Result<()> {
	let state_dir = workspace_root.join("state");
	if !state_dir.join("checkpoints.json").exists() {
		println!("no checkpoints recorded under {}", workspace_root.display());
		return Ok(());
	}
	let store = checkpoint::CheckpointStore::open(&state_dir)?;
	println!("{:<24} {:<9} {:<21} error", "module", "status", "completed");
	for (name, cp) in store.iter() {
		let when = format_unix(cp.completed_at);
		let status = match cp.status {
			checkpoint::CheckpointStatus::Success => "success",
			checkpoint::CheckpointStatus::Error => "error",
			checkpoint::CheckpointStatus::Skipped => "skipped",
		};
		println!("{name:<24} {status:<9} {when:<21} {}", cp.error.as_deref().unwrap_or("-"));
	}
	match store.first_incomplete(cfg::modules::CANONICAL_PIPELINE) {
		Some(idx) => println!(
			"\n--resume would continue at: {}",
			cfg::modules::CANONICAL_PIPELINE.get(idx).unwrap_or(&"?")
		),
		None => println!("\nall modules complete; --resume is a no-op"),
	}
	Ok(())
}

fn format_unix(secs: u64) -> String {
	let fmt = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
	i64::try_from(secs)
		.ok()
		.and_then(|s| time::OffsetDateTime::from_unix_timestamp(s).ok())
		.and_then(|t| t.format(fmt).ok())
		.unwrap_or_else(|| secs.to_string())
}

const fn error_kind(e: &BuildError) -> &'static str {
	match e {
		BuildError::Validation(_) => "validation",
		BuildError::MissingRequired(_) => "missing-required",
		BuildError::Network { .. } => "network",
		BuildError::PackageInstall(_) => "package-install",
		BuildError::KernelZfsMismatch { .. } => "kernel-zfs-mismatch",
		BuildError::InitramfsRegen(_) => "initramfs-regen",
		BuildError::IsoAssembly(_) => "iso-assembly",
		BuildError::ChrootBusy => "chroot-busy",
		BuildError::MountLeak { .. } => "mount-leak",
		BuildError::WorkspaceDirty(_) => "workspace-dirty",
		BuildError::Stalled { .. } => "stalled",
		BuildError::InstallerAssetMissing(_) => "installer-asset-missing",
		BuildError::Cancelled => "cancelled",
		BuildError::CommandFailed { .. } => "command-failed",
		BuildError::Template(_) => "template",
		BuildError::Io(_) => "io",
		BuildError::Other(_) => "other",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unix_formatting_is_sane() {
		assert_eq!(format_unix(0), "1970-01-01 00:00:00");
		assert!(format_unix(1_722_470_400).starts_with("2024-08-01"));
	}

	#[test]
	fn error_kinds_are_kebab() {
		assert_eq!(error_kind(&BuildError::ChrootBusy), "chroot-busy");
		assert_eq!(error_kind(&BuildError::Cancelled), "cancelled");
	}
}
