//! Process plumbing and small fs helpers shared by every pipeline module.

use crate::errors::{BuildError, Result};
use std::io::BufRead;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Run a command, capture output, error out with argv+stderr on non-zero.
#[macro_export]
macro_rules! run {
	($n:expr $(, $arr:expr)* $(,)?) => {{
		let out = std::process::Command::new($n)
			.args([$($arr,)*])
			.output()?;
		if out.status.success() {
			Ok(out.stdout)
		} else {
			let argv = [$n.to_string() $(, $arr.to_string())*].join(" ");
			Err($crate::errors::BuildError::CommandFailed {
				command: argv,
				code: out.status.code().unwrap_or(-1),
				stderr_tail: $crate::util::tail_lines(
					&String::from_utf8_lossy(&out.stderr), 40),
			})
		}
	}};
}

/// Read an env var as an `Option<String>`.
#[macro_export]
macro_rules! env_flag {
	($name:expr) => {
		std::env::var($name).ok()
	};
}

/// Render a tera template bundled under `templates/` and write the result.
///
/// ```ignore
/// tpl!("dracut-zforge.conf.tera" => { compress, hostonly, cmdline } => &dest);
/// ```
#[macro_export]
macro_rules! tpl {
	($tpl:literal => { $($key:ident $(: $val:expr)?),* $(,)? } => $dest:expr) => {{
		let mut ctx = tera::Context::new();
		$( $crate::tpl!(@insert ctx, $key $(, $val)?); )*
		let rendered = tera::Tera::one_off(
			include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/", $tpl)),
			&ctx,
			false,
		)?;
		$crate::util::just_write($dest, rendered)?;
	}};
	(@insert $ctx:ident, $key:ident) => {
		$ctx.insert(stringify!($key), &$key);
	};
	(@insert $ctx:ident, $key:ident, $val:expr) => {
		$ctx.insert(stringify!($key), &$val);
	};
}

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_cancel(_: i32) {
	CANCELLED.store(true, Ordering::SeqCst);
}

/// Route SIGINT/SIGTERM into the global cancel flag.
///
/// # Errors
/// Fails if the sigaction syscalls fail.
pub fn install_signal_handlers() -> Result<()> {
	use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
	let action =
		SigAction::new(SigHandler::Handler(handle_cancel), SaFlags::empty(), SigSet::empty());
	// SAFETY: the handler only stores to an AtomicBool, which is
	// async-signal-safe
	unsafe {
		signal::sigaction(signal::SIGINT, &action)
			.and_then(|_| signal::sigaction(signal::SIGTERM, &action))
			.map_err(|e| BuildError::other(format!("sigaction: {e}")))?;
	}
	Ok(())
}

#[must_use]
pub fn cancel_requested() -> bool {
	CANCELLED.load(Ordering::SeqCst)
}

/// # Errors
/// Returns [`BuildError::Cancelled`] when a signal was received.
pub fn check_cancelled() -> Result<()> {
	if cancel_requested() {
		return Err(BuildError::Cancelled);
	}
	Ok(())
}

#[cfg(test)]
pub(crate) fn reset_cancel_for_tests() {
	CANCELLED.store(false, Ordering::SeqCst);
}

/// Last `n` lines of a blob of subprocess output.
#[must_use]
pub fn tail_lines(s: &str, n: usize) -> String {
	let lines: Vec<&str> = s.lines().collect();
	let start = lines.len().saturating_sub(n);
	lines.get(start..).unwrap_or_default().join("\n")
}

/// How many lines of stderr we keep for error reports.
pub const STDERR_TAIL_LINES: usize = 40;

/// Default watchdog idle threshold.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Grace between SIGTERM and SIGKILL when putting a subprocess down.
const KILL_GRACE: Duration = Duration::from_secs(10);

pub struct CmdOutput {
	pub stdout: String,
	pub stderr: String,
	pub code: i32,
}

impl CmdOutput {
	#[must_use]
	pub const fn success(&self) -> bool {
		self.code == 0
	}
}

enum Line {
	Out(String),
	Err(String),
	Eof,
}

fn reader_thread(
	stream: impl std::io::Read + Send + 'static, tx: &mpsc::Sender<Line>,
	wrap: fn(String) -> Line,
) -> std::thread::JoinHandle<()> {
	let tx = tx.clone();
	std::thread::spawn(move || {
		for line in BufReader::new(stream).lines() {
			let Ok(line) = line else { break };
			if tx.send(wrap(line)).is_err() {
				break;
			}
		}
		drop(tx.send(Line::Eof));
	})
}

fn terminate(child: &mut Child) {
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::Pid;
	#[allow(clippy::cast_possible_wrap)]
	let pid = Pid::from_raw(child.id() as i32);
	drop(kill(pid, Signal::SIGTERM));
	let deadline = Instant::now() + KILL_GRACE;
	while Instant::now() < deadline {
		if let Ok(Some(_)) = child.try_wait() {
			return;
		}
		std::thread::sleep(Duration::from_millis(200));
	}
	warn!("subprocess ignored SIGTERM, sending SIGKILL");
	drop(child.kill());
	drop(child.wait());
}

/// Run a command streaming its output line-by-line into the log, with an
/// idle watchdog and cancellation support.
///
/// The watchdog fires when the subprocess goes `idle` without producing a
/// single line on either stream; the command is then terminated (SIGTERM,
/// SIGKILL after 10 s) and [`BuildError::Stalled`] is returned. A pending
/// cancellation terminates the command the same way.
///
/// # Errors
/// - [`BuildError::Stalled`], [`BuildError::Cancelled`]
/// - [`BuildError::CommandFailed`] on non-zero exit
pub fn run_streamed(cmd: &mut Command, idle: Duration) -> Result<CmdOutput> {
	run_streamed_with_stdin(cmd, idle, None)
}

/// [`run_streamed`] with bytes fed to the subprocess stdin.
///
/// # Errors
/// Same as [`run_streamed`].
pub fn run_streamed_with_stdin(
	cmd: &mut Command, idle: Duration, stdin: Option<&str>,
) -> Result<CmdOutput> {
	use std::io::Write;

	let cmd_display = display_command(cmd);
	check_cancelled()?;
	debug!(command = %cmd_display, "Spawning");

	cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
	if stdin.is_some() {
		cmd.stdin(Stdio::piped());
	} else {
		cmd.stdin(Stdio::null());
	}
	let mut child = cmd.spawn()?;
	if let Some(input) = stdin {
		let mut pipe =
			child.stdin.take().ok_or_else(|| BuildError::other("no stdin pipe"))?;
		pipe.write_all(input.as_bytes())?;
		drop(pipe);
	}

	let (tx, rx) = mpsc::channel();
	let out = child.stdout.take().ok_or_else(|| BuildError::other("no stdout pipe"))?;
	let err = child.stderr.take().ok_or_else(|| BuildError::other("no stderr pipe"))?;
	let h_out = reader_thread(out, &tx, Line::Out);
	let h_err = reader_thread(err, &tx, Line::Err);
	drop(tx);

	let mut stdout = String::new();
	let mut stderr = String::new();
	let mut eofs = 0_u8;
	let mut last_output = Instant::now();

	while eofs < 2 {
		if cancel_requested() {
			terminate(&mut child);
			return Err(BuildError::Cancelled);
		}
		match rx.recv_timeout(Duration::from_millis(500)) {
			Ok(Line::Out(l)) => {
				trace!(target: "subprocess", "{l}");
				stdout.push_str(&l);
				stdout.push('\n');
				last_output = Instant::now();
			},
			Ok(Line::Err(l)) => {
				trace!(target: "subprocess", "{l}");
				stderr.push_str(&l);
				stderr.push('\n');
				last_output = Instant::now();
			},
			Ok(Line::Eof) => eofs = eofs.saturating_add(1),
			Err(mpsc::RecvTimeoutError::Timeout) => {
				if last_output.elapsed() >= idle {
					warn!(command = %cmd_display, "Watchdog: no output past idle threshold");
					terminate(&mut child);
					return Err(BuildError::Stalled {
						command: cmd_display,
						idle_secs: idle.as_secs(),
					});
				}
			},
			Err(mpsc::RecvTimeoutError::Disconnected) => break,
		}
	}
	drop(h_out.join());
	drop(h_err.join());

	let status = child.wait()?;
	let code = status.code().unwrap_or(-1);
	if status.success() {
		Ok(CmdOutput { stdout, stderr, code })
	} else {
		Err(BuildError::CommandFailed {
			command: cmd_display,
			code,
			stderr_tail: tail_lines(&stderr, STDERR_TAIL_LINES),
		})
	}
}

fn display_command(cmd: &Command) -> String {
	let mut s = cmd.get_program().to_string_lossy().into_owned();
	for arg in cmd.get_args() {
		s.push(' ');
		s.push_str(&arg.to_string_lossy());
	}
	s
}

/// Retry a transient network operation: 3 attempts, exponential backoff with
/// a 2 s base and a 30 s cap.
///
/// # Errors
/// [`BuildError::Network`] once the attempts are exhausted; cancellation and
/// watchdog errors pass through untouched.
pub fn retry_network<T>(context: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
	const ATTEMPTS: u32 = 3;
	const BASE: Duration = Duration::from_secs(2);
	const CAP: Duration = Duration::from_secs(30);

	let mut last = String::new();
	for attempt in 1..=ATTEMPTS {
		check_cancelled()?;
		match f() {
			Ok(v) => return Ok(v),
			Err(e @ (BuildError::Cancelled | BuildError::Stalled { .. })) => return Err(e),
			Err(e) => {
				warn!(%context, attempt, error = %e, "Network operation failed");
				last = e.to_string();
				if attempt < ATTEMPTS {
					let backoff = BASE.saturating_mul(1 << (attempt - 1)).min(CAP);
					std::thread::sleep(backoff);
				}
			},
		}
	}
	Err(BuildError::Network { context: format!("{context}: {last}"), attempts: ATTEMPTS })
}

/// Write a file, creating parent directories first.
///
/// # Errors
/// IO errors from `create_dir_all`/`write`.
pub fn just_write(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
	let path = path.as_ref();
	trace!(?path, "Writing file");
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, content)?;
	Ok(())
}

/// Write an executable script (mode 0755).
///
/// # Errors
/// IO errors.
pub fn just_write_script(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
	use std::os::unix::fs::PermissionsExt;
	just_write(&path, content)?;
	std::fs::set_permissions(path.as_ref(), std::fs::Permissions::from_mode(0o755))?;
	Ok(())
}

/// Recursively copy a directory, preserving symlinks.
///
/// # Errors
/// Fails when `src` does not exist or on IO errors.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
	if !src.exists() {
		return Err(BuildError::missing(format!("source directory {}", src.display())));
	}
	std::fs::create_dir_all(dest)?;

	for entry in std::fs::read_dir(src)? {
		let entry = entry?;
		let entry_path = entry.path();
		let dest_path = dest.join(entry.file_name());
		let file_type = std::fs::symlink_metadata(&entry_path)?.file_type();
		if file_type.is_dir() {
			copy_dir(&entry_path, &dest_path)?;
		} else if file_type.is_file() {
			std::fs::copy(&entry_path, &dest_path)?;
		} else if file_type.is_symlink() {
			let target = std::fs::read_link(&entry_path)?;
			std::os::unix::fs::symlink(target, &dest_path)?;
		}
	}
	Ok(())
}

/// Create a sparse file of the given size.
///
/// # Errors
/// IO errors.
pub fn create_sparse(path: &Path, size: u64) -> Result<()> {
	debug!(?path, size, "Creating sparse file");
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let file = std::fs::File::create(path)?;
	file.set_len(size)?;
	Ok(())
}

/// Attach a file to the next free loop device. The handle detaches on drop.
///
/// # Errors
/// Fails when no loop device is free or the attach ioctl fails.
pub fn loopdev_with_file(path: &Path) -> Result<(PathBuf, LoopHandle)> {
	let lc = loopdev::LoopControl::open().map_err(BuildError::Io)?;
	let device = lc.next_free().map_err(BuildError::Io)?;
	device.with().read_only(false).autoclear(false).attach(path).map_err(BuildError::Io)?;
	let ldp = device.path().ok_or_else(|| BuildError::other("loop device has no path"))?;
	debug!(?ldp, file = ?path, "Attached loop device");
	Ok((ldp, LoopHandle(device)))
}

pub struct LoopHandle(loopdev::LoopDevice);

impl Drop for LoopHandle {
	fn drop(&mut self) {
		if let Err(e) = self.0.detach() {
			warn!(error = %e, "Failed to detach loop device");
		}
	}
}
