//! Testcase checker
//!
//! Runs the candidate once inside the jail, then compares the captured
//! console streams and the expected filesystem artifacts against the
//! recorded expectations and assembles the verdict.

use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CheckerConfig;
use crate::core::verdict::{
    ConsoleStream, FileResult, TcResult, TcStatus, VerdictBuilder, VerdictError,
};
use crate::engine::diff::{self, DiffStatus, DirDiff, FileDiff};
use crate::engine::resolver::{ArtifactPair, ConsolePair, EntryKind, PathPairResolver};
use crate::runner::{
    CommandSpec, JailedRunner, RunLimits, RunOutcome, Runner, NOT_LAUNCHED_STATUS,
};

/// Per-testcase customization points
///
/// Every method has a default; a testcase overrides only what it needs
/// (a looser diff, extra arguments, a different exit policy).
pub trait CheckerHooks: Send + Sync {
    fn build_command(&self, target: &Path, args: &[String], env: &[String]) -> CommandSpec {
        CommandSpec::new(target.to_string_lossy())
            .with_args(args.iter().cloned())
            .with_env(env.iter().cloned())
    }

    /// Verdict for a run that finished before the timeout
    fn classify_exit(&self, outcome: &RunOutcome, success_status: i32) -> TcStatus {
        if outcome.exit_status() == success_status {
            TcStatus::Success
        } else {
            TcStatus::Fail
        }
    }

    /// `limit` bounds how much of each file is loaded to render the diff
    fn diff_file(&self, expected: &Path, actual: &Path, limit: usize) -> FileDiff {
        diff::diff_files(expected, actual, limit)
    }

    fn diff_dir(&self, expected: &Path, actual: &Path) -> DirDiff {
        diff::diff_dirs(expected, actual)
    }

    /// Artifacts to compare, out of everything in the expected tree
    fn select_artifacts(&self, pairs: Vec<ArtifactPair>) -> Vec<ArtifactPair> {
        pairs
    }
}

/// Hooks with the stock behavior
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl CheckerHooks for DefaultHooks {}

pub struct Checker {
    config: CheckerConfig,
    resolver: PathPairResolver,
    runner: Box<dyn Runner>,
    hooks: Arc<dyn CheckerHooks>,
}

impl Checker {
    pub fn new(config: CheckerConfig) -> Self {
        let resolver = PathPairResolver::new(config.layout());
        let runner = Box::new(JailedRunner::new(config.jail.clone()));
        Self {
            config,
            resolver,
            runner,
            hooks: Arc::new(DefaultHooks),
        }
    }

    pub fn with_runner(mut self, runner: impl Runner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    pub fn with_hooks(mut self, hooks: impl CheckerHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Execute the testcase and produce its verdict
    ///
    /// Only a verdict that cannot be assembled is an error; run failures and
    /// comparison failures are reported inside the verdict.
    pub async fn check(&self) -> Result<TcResult, VerdictError> {
        let cmd = self
            .hooks
            .build_command(&self.config.target, &self.config.args, &self.config.env);
        let limits: RunLimits = self.config.limits();
        let stdin = self.read_stdin().await;

        info!("Running testcase: {:?}", cmd.to_vec());
        let outcome = match self.runner.run(&cmd, &limits, stdin.as_deref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to launch the candidate: {}", e);
                return not_launched();
            }
        };

        let result = if outcome.timed_out() {
            TcStatus::Timeout
        } else {
            self.hooks
                .classify_exit(&outcome, self.config.success_status)
        };
        info!(
            "Candidate finished: result={}, pstatus={}, etime={}ms",
            result,
            outcome.exit_status(),
            outcome.elapsed_ms
        );

        let mut builder = VerdictBuilder::new(result, outcome.elapsed_ms, outcome.exit_status());

        let stored = self.store_console(&outcome).await;
        for (stream, entry) in self.compare_console(&outcome, &stored).await {
            builder.set_console(stream, entry)?;
        }

        for entry in self.compare_artifacts().await {
            match builder.add_file(entry) {
                Ok(()) => {}
                Err(VerdictError::DuplicateArtifact(name)) => {
                    let key = (2..)
                        .map(|n| format!("{}~{}", name, n))
                        .find(|key| !builder.has_file(key))
                        .unwrap_or_default();
                    warn!(
                        "Artifact {:?} selected twice, recording the second as {:?}",
                        name, key
                    );
                    builder.add_file(FileResult::unavailable(key))?;
                }
                Err(e) => return Err(e),
            }
        }

        let verdict = builder.finish()?;
        info!(
            "Verdict assembled: result={}, {} artifacts, all identical: {}",
            verdict.result(),
            verdict.fio().len(),
            verdict.all_identical()
        );
        Ok(verdict)
    }

    async fn read_stdin(&self) -> Option<Vec<u8>> {
        let path = self.resolver.layout().stdin_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read recorded stdin {:?}: {}", path, e);
                None
            }
        }
    }

    /// Persist the captured streams where the console comparison reads them
    /// and return the streams that were stored
    async fn store_console(&self, outcome: &RunOutcome) -> Vec<ConsoleStream> {
        let layout = self.resolver.layout();
        if let Err(e) = tokio::fs::create_dir_all(&layout.actual_root).await {
            warn!("Failed to create {:?}: {}", layout.actual_root, e);
            return Vec::new();
        }

        let mut stored = Vec::with_capacity(ConsoleStream::ALL.len());
        for stream in ConsoleStream::ALL {
            let bytes = match stream {
                ConsoleStream::Stdout => &outcome.stdout_bytes,
                ConsoleStream::Stderr => &outcome.stderr_bytes,
            };
            let path = layout.actual_console_path(stream);
            // A leftover from an earlier run must never be compared
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to clear {:?}: {}", path, e);
                    continue;
                }
            }
            match tokio::fs::write(&path, bytes).await {
                Ok(()) => stored.push(stream),
                Err(e) => {
                    warn!("Failed to store captured {} at {:?}: {}", stream.name(), path, e)
                }
            }
        }
        stored
    }

    async fn compare_console(
        &self,
        outcome: &RunOutcome,
        stored: &[ConsoleStream],
    ) -> Vec<(ConsoleStream, FileResult)> {
        let recorded = self.resolver.console_pairs().unwrap_or_else(|e| {
            warn!("No recorded console output: {}", e);
            Vec::new()
        });

        let limit = self.config.max_output_bytes;
        let tasks: Vec<(ConsoleStream, String, JoinHandle<FileDiff>)> = ConsoleStream::ALL
            .into_iter()
            .map(|stream| {
                // An unrecorded stream still gets a slot; its diff is an error
                let pair: ConsolePair = recorded
                    .iter()
                    .find(|p| p.stream == stream)
                    .cloned()
                    .unwrap_or_else(|| self.resolver.console_pair(stream));
                let captured = match stream {
                    ConsoleStream::Stdout => outcome.stdout.clone(),
                    ConsoleStream::Stderr => outcome.stderr.clone(),
                };
                let hooks = Arc::clone(&self.hooks);
                let is_stored = stored.contains(&stream);
                let task = tokio::task::spawn_blocking(move || {
                    if is_stored {
                        hooks.diff_file(&pair.expected, &pair.actual, limit)
                    } else {
                        FileDiff::error()
                    }
                });
                (stream, captured, task)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (stream, captured, task) in tasks {
            let diff = task.await.unwrap_or_else(|e| {
                warn!("Comparison of {} failed: {}", stream.name(), e);
                FileDiff::error()
            });
            debug!("Compared {}: {:?}", stream.name(), diff.status);
            results.push((
                stream,
                FileResult::console(stream, diff.status, captured, diff.text),
            ));
        }
        results
    }

    async fn compare_artifacts(&self) -> Vec<FileResult> {
        let pairs = match self.resolver.file_pairs() {
            Ok(pairs) => self.hooks.select_artifacts(pairs),
            Err(e) => {
                warn!("Failed to enumerate expected artifacts: {}", e);
                return Vec::new();
            }
        };

        let limit = self.config.max_output_bytes;
        let tasks: Vec<(String, JoinHandle<FileResult>)> = pairs
            .into_iter()
            .map(|pair| {
                let hooks = Arc::clone(&self.hooks);
                let name = pair.relative.clone();
                let task = tokio::task::spawn_blocking(move || {
                    compare_artifact(hooks.as_ref(), &pair, limit)
                });
                (name, task)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let entry = task.await.unwrap_or_else(|e| {
                warn!("Comparison of {:?} failed: {}", name, e);
                FileResult::unavailable(name)
            });
            debug!("Compared {:?}: {:?}", entry.name(), entry.status());
            results.push(entry);
        }
        results
    }
}

fn compare_artifact(hooks: &dyn CheckerHooks, pair: &ArtifactPair, limit: usize) -> FileResult {
    let perm = diff::permissions(&pair.actual);
    match pair.kind {
        EntryKind::Directory => {
            let dir = hooks.diff_dir(&pair.expected, &pair.actual);
            let text = if dir.mask != 0 {
                format!("{:04o}", dir.mask)
            } else {
                String::new()
            };
            FileResult::new(pair.relative.as_str(), dir.status, "", text, perm)
        }
        EntryKind::File | EntryKind::Other => {
            let file = hooks.diff_file(&pair.expected, &pair.actual, limit);
            let content = diff::read_text(&pair.actual, limit).unwrap_or_default();
            FileResult::new(pair.relative.as_str(), file.status, content, file.text, perm)
        }
    }
}

fn not_launched() -> Result<TcResult, VerdictError> {
    let mut builder = VerdictBuilder::new(TcStatus::Error, 0, NOT_LAUNCHED_STATUS);
    for stream in ConsoleStream::ALL {
        builder.set_console(
            stream,
            FileResult::console(stream, DiffStatus::Error, "", ""),
        )?;
    }
    builder.finish()
}
