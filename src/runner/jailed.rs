//! Jailed runner implementation
//!
//! Executes the untrusted candidate inside the provisioned jail with a hard
//! wall-clock timeout. On expiry the candidate's whole process group gets
//! SIGKILL. Output read up to that point is kept.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CommandSpec, JailError, RunLimits, RunOutcome, RunStatus, Runner};
use crate::sandbox::JailConfig;

/// PATH handed to the candidate; the rest of the environment is cleared
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// How long pipe readers may keep draining after the candidate was reaped
const READER_GRACE: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 8192;

/// Runner that executes code inside the jail
pub struct JailedRunner {
    jail: JailConfig,
}

impl JailedRunner {
    /// Create a new jailed runner
    pub fn new(jail: JailConfig) -> Self {
        Self { jail }
    }

    pub fn jail(&self) -> &JailConfig {
        &self.jail
    }

    /// Run a command in the jail
    pub async fn execute(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin_content: Option<&[u8]>,
    ) -> Result<RunOutcome, JailError> {
        if limits.timeout.is_zero() {
            return Err(JailError::InvalidTimeout);
        }
        if cmd.program.is_empty() {
            return Err(JailError::EmptyCommand);
        }
        let host_program = self.jail.resolve_executable(Path::new(&cmd.program))?;

        // Always exec a path, so the binary checked above is the one that runs
        let mut command = if self.jail.chroot {
            Command::new(self.jail.jail_path(Path::new(&cmd.program)))
        } else {
            Command::new(&host_program)
        };
        command
            .args(&cmd.args)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .envs(cmd.env_pairs())
            .stdin(if stdin_content.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if self.jail.chroot {
            let root = self.jail.root.clone();
            let work_dir = self.jail.work_dir.clone();
            // SAFETY: chroot and chdir are async-signal-safe and the closure
            // only touches paths owned by the closure.
            unsafe {
                command.pre_exec(move || {
                    nix::unistd::chroot(root.as_path())?;
                    nix::unistd::chdir(work_dir.as_path())?;
                    Ok(())
                });
            }
        } else {
            command.current_dir(self.jail.host_work_dir());
        }

        debug!(
            "Running jailed program: {:?} (chroot: {})",
            cmd.to_vec(),
            self.jail.chroot
        );

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| JailError::Spawn {
            program: host_program.clone(),
            source,
        })?;
        // The child leads its own group, so its pid is the group id
        let pgid = child.id();

        let stdout = Capture::spawn(child.stdout.take(), limits.max_output_bytes);
        let stderr = Capture::spawn(child.stderr.take(), limits.max_output_bytes);

        let feeder = match (stdin_content, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.to_vec();
                Some(tokio::spawn(async move {
                    // The candidate may exit without reading its input
                    let _ = pipe.write_all(&input).await;
                }))
            }
            _ => None,
        };

        let status = match tokio::time::timeout(limits.timeout, child.wait()).await {
            Ok(Ok(status)) => match run_status(status) {
                Ok(status) => status,
                Err(e) => {
                    kill_group(pgid);
                    return Err(e);
                }
            },
            Ok(Err(e)) => {
                kill_group(pgid);
                return Err(JailError::Wait(e));
            }
            Err(_) => {
                info!(
                    "Candidate exceeded {:?} timeout, killing process group {:?}",
                    limits.timeout, pgid
                );
                kill_group(pgid);
                child.wait().await.map_err(JailError::Wait)?;
                RunStatus::TimedOut
            }
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // Reclaim anything the candidate left running in its group
        kill_group(pgid);
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;

        debug!(
            "Jailed program finished: status={:?}, elapsed={}ms, stdout={}B, stderr={}B",
            status,
            elapsed_ms,
            stdout.len(),
            stderr.len()
        );

        Ok(RunOutcome::new(status, elapsed_ms, stdout, stderr))
    }
}

#[async_trait]
impl Runner for JailedRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
    ) -> Result<RunOutcome, JailError> {
        self.execute(cmd, limits, stdin).await
    }
}

fn run_status(status: ExitStatus) -> Result<RunStatus, JailError> {
    match (status.code(), status.signal()) {
        (Some(code), _) => Ok(RunStatus::Exited(code)),
        (None, Some(sig)) => Ok(RunStatus::Signaled(sig)),
        (None, None) => Err(JailError::UnknownStatus(status.into_raw())),
    }
}

fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

/// Background reader of one output pipe
///
/// The pipe is drained to EOF so the candidate never blocks on a full pipe,
/// but only the first `limit` bytes are kept. The buffer is shared so a
/// reader stuck on a pipe held open by an escaped descendant can be
/// abandoned without losing what it already read.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(pipe: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                        let room = limit.saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        });
        Self { buffer, task }
    }

    async fn finish(mut self) -> Vec<u8> {
        if tokio::time::timeout(READER_GRACE, &mut self.task)
            .await
            .is_err()
        {
            warn!("Output pipe still open after the candidate exited, abandoning reader");
            self.task.abort();
        }
        let mut buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TIMEOUT_STATUS;
    use tempfile::tempdir;

    fn host_runner(work_dir: &Path) -> JailedRunner {
        JailedRunner::new(JailConfig::new("/", work_dir))
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_captures_streams_and_exit_code() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());

        let outcome = runner
            .execute(
                &sh("echo out; echo err >&2; exit 3"),
                &RunLimits::default(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.exit_status(), 3);
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_runs_in_work_dir_with_clean_env() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());
        let cmd = sh("pwd; echo \"$GREETING:$HOME\"").with_env(["GREETING=hi"]);

        let outcome = runner
            .execute(&cmd, &RunLimits::default(), None)
            .await
            .unwrap();

        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        let mut lines = outcome.stdout.lines();
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            cwd
        );
        assert_eq!(lines.next(), Some("hi:"));
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());

        let outcome = runner
            .execute(&sh("cat"), &RunLimits::default(), Some(b"1 2 3\n"))
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "1 2 3\n");
        assert!(outcome.status == RunStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_signal_death_is_negative() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());

        let outcome = runner
            .execute(&sh("kill -9 $$"), &RunLimits::default(), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Signaled(9));
        assert_eq!(outcome.exit_status(), -9);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_partial_output() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());
        let limits = RunLimits::new(1, 1024);

        let started = Instant::now();
        let outcome = runner
            .execute(&sh("echo started; trap '' TERM; sleep 30"), &limits, None)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(outcome.timed_out());
        assert_eq!(outcome.exit_status(), TIMEOUT_STATUS);
        assert!(outcome.elapsed_ms >= 1000);
        assert_eq!(outcome.stdout, "started\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_descendants() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());
        let marker = dir.path().join("marker");
        let script = format!(
            "(sleep 2; touch '{}') >/dev/null 2>&1 & echo started; sleep 30",
            marker.display()
        );

        let outcome = runner
            .execute(&sh(&script), &RunLimits::new(1, 1024), None)
            .await
            .unwrap();
        assert!(outcome.timed_out());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_exit_reclaims_background_children() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());
        let marker = dir.path().join("marker");
        let script = format!(
            "(sleep 1; touch '{}') >/dev/null 2>&1 & exit 0",
            marker.display()
        );

        let outcome = runner
            .execute(&sh(&script), &RunLimits::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Exited(0));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn test_unrecognized_wait_status_is_rejected() {
        assert_eq!(
            run_status(ExitStatus::from_raw(3 << 8)).unwrap(),
            RunStatus::Exited(3)
        );
        assert_eq!(
            run_status(ExitStatus::from_raw(9)).unwrap(),
            RunStatus::Signaled(9)
        );
        // stopped by SIGSTOP: neither an exit nor a death
        assert!(matches!(
            run_status(ExitStatus::from_raw(0x137f)),
            Err(JailError::UnknownStatus(0x137f))
        ));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());
        let limits = RunLimits::new(5, 4);

        let outcome = runner
            .execute(&sh("printf 0123456789"), &limits, None)
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "0123");
        assert_eq!(outcome.status, RunStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_setup_errors() {
        let dir = tempdir().unwrap();
        let runner = host_runner(dir.path());
        let data = dir.path().join("data.txt");
        std::fs::write(&data, "not a program").unwrap();

        let missing = runner
            .execute(
                &CommandSpec::new("/nonexistent/prog"),
                &RunLimits::default(),
                None,
            )
            .await;
        assert!(matches!(missing, Err(JailError::NotFound(_))));

        let not_exec = runner
            .execute(
                &CommandSpec::new(data.to_string_lossy()),
                &RunLimits::default(),
                None,
            )
            .await;
        assert!(matches!(not_exec, Err(JailError::NotExecutable(_))));

        let zero = runner
            .execute(&sh("true"), &RunLimits::new(0, 1024), None)
            .await;
        assert!(matches!(zero, Err(JailError::InvalidTimeout)));

        let empty = runner
            .execute(&CommandSpec::new(""), &RunLimits::default(), None)
            .await;
        assert!(matches!(empty, Err(JailError::EmptyCommand)));
    }
}
