//! Sandbox execution: run candidate source in an isolated scratch directory.
//!
//! [`SandboxExecutor`] is the seam the orchestration core verifies fixes
//! through. A [`Program`] is the whole file set to stage (the candidate at its
//! project-relative path among the other project files) plus the script the
//! interpreter starts, which need not be the file being fixed.
//!
//! [`LocalSandbox`] runs a program with a local interpreter in a fresh temp
//! directory, with a wall-clock timeout, an address-space ceiling (Unix) and
//! capped output. The child runs in its own process group, and the group is
//! killed after every run. A timeout is an ordinary failed result.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::budget::truncate_chars;
use crate::error::{DiagnosticsError, DiagnosticsResult};

/// File name the candidate is staged under when no project path is known.
pub const ENTRY_FILE: &str = "main.py";

/// Exit code reported for timeouts and infrastructure failures.
pub const ABNORMAL_EXIT: i32 = -1;

/// Outcome of running one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// A run that never produced process output (bad input, spawn failure, timeout).
    pub fn abnormal(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: ABNORMAL_EXIT,
            timed_out: false,
            duration_ms: 0,
        }
    }

    /// The most useful failure text: stderr, else stdout.
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Files to stage and the script to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Project-relative path -> content, candidate included
    pub files: BTreeMap<String, String>,
    /// Path of the file the candidate replaces
    pub target: String,
    /// Path handed to the interpreter
    pub entry: String,
}

impl Program {
    /// A lone file staged as `main.py` and run directly.
    pub fn single(source: impl Into<String>) -> Self {
        Self::at(ENTRY_FILE, source)
    }

    /// A lone file staged at `path` and run directly.
    pub fn at(path: impl Into<String>, source: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            files: BTreeMap::from([(path.clone(), source.into())]),
            target: path.clone(),
            entry: path,
        }
    }

    /// `files` with `target` replaced by `candidate`, started from `entry`.
    pub fn with_candidate(
        files: &BTreeMap<String, String>,
        target: &str,
        entry: &str,
        candidate: &str,
    ) -> Self {
        let mut files = files.clone();
        files.insert(target.to_string(), candidate.to_string());
        Self {
            files,
            target: target.to_string(),
            entry: entry.to_string(),
        }
    }

    /// Content staged at `target`.
    pub fn candidate(&self) -> &str {
        self.files.get(&self.target).map(String::as_str).unwrap_or_default()
    }

    /// Every staged file except the target.
    pub fn other_files(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .filter(|(path, _)| **path != self.target)
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect()
    }
}

/// Runs untrusted source and reports what happened.
///
/// Implementations enforce their own timeout and resource ceiling and never
/// leave a running process behind.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn run(&self, program: &Program) -> ExecutionResult;
}

/// Local interpreter sandbox.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    interpreter: Vec<String>,
    timeout: Duration,
    memory_limit_mb: Option<u64>,
    max_output_chars: usize,
}

impl LocalSandbox {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
    pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 10_000;

    /// `interpreter` is split shell-style, e.g. `"python3 -X utf8"`.
    pub fn new(interpreter: &str, timeout: Duration) -> DiagnosticsResult<Self> {
        let argv = shlex::split(interpreter)
            .filter(|parts| !parts.is_empty())
            .ok_or_else(|| {
                DiagnosticsError::config(format!("invalid interpreter command: {interpreter:?}"))
            })?;
        if timeout.is_zero() {
            return Err(DiagnosticsError::config("sandbox timeout must be positive"));
        }
        Ok(Self {
            interpreter: argv,
            timeout,
            memory_limit_mb: Some(Self::DEFAULT_MEMORY_LIMIT_MB),
            max_output_chars: Self::DEFAULT_MAX_OUTPUT_CHARS,
        })
    }

    /// `None` disables the address-space ceiling.
    pub fn with_memory_limit(mut self, limit_mb: Option<u64>) -> Self {
        self.memory_limit_mb = limit_mb;
        self
    }

    pub fn with_max_output(mut self, chars: usize) -> Self {
        self.max_output_chars = chars;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, workdir: &Path, entry: &str) -> tokio::process::Command {
        let mut cmd = match self.memory_limit_mb {
            #[cfg(unix)]
            Some(limit_mb) => {
                // `ulimit -v` takes KiB.
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c")
                    .arg(r#"ulimit -v "$1" && shift && exec "$@""#)
                    .arg("sandbox")
                    .arg((limit_mb * 1024).to_string())
                    .args(&self.interpreter)
                    .arg(entry);
                cmd
            }
            _ => {
                let mut cmd = tokio::process::Command::new(&self.interpreter[0]);
                cmd.args(&self.interpreter[1..]).arg(entry);
                cmd
            }
        };

        // The project root is the working directory; the interpreter puts the
        // entry script's own directory on the import path.
        cmd.current_dir(workdir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, killed as a whole once the run is over.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    fn stage(&self, dir: &Path, program: &Program) -> Result<(), String> {
        if !program.files.contains_key(&program.entry) {
            return Err(format!("entry script {} is not among the staged files", program.entry));
        }
        for (rel, content) in &program.files {
            if !is_safe_relative(rel) {
                return Err(format!("rejected file path: {rel}"));
            }
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| format!("failed to stage {rel}: {e}"))?;
            }
            std::fs::write(&path, content).map_err(|e| format!("failed to stage {rel}: {e}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxExecutor for LocalSandbox {
    async fn run(&self, program: &Program) -> ExecutionResult {
        let workdir = match tempfile::Builder::new().prefix("sandbox-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return ExecutionResult::abnormal(format!("failed to create sandbox: {e}")),
        };
        if let Err(msg) = self.stage(workdir.path(), program) {
            warn!(error = %msg, "Sandbox staging failed");
            return ExecutionResult::abnormal(msg);
        }

        let start = Instant::now();
        let child = match self.command(workdir.path(), &program.entry).spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionResult::abnormal(format!("Failed to execute: {e}")),
        };
        let group = child.id();
        let outcome = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        if let Some(group) = group {
            kill_process_group(group);
        }

        match outcome {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(ABNORMAL_EXIT);
                debug!(entry = %program.entry, exit_code, duration_ms, "Sandbox run finished");
                ExecutionResult {
                    success: output.status.success(),
                    stdout: truncate_chars(
                        &String::from_utf8_lossy(&output.stdout),
                        self.max_output_chars,
                    ),
                    stderr: truncate_chars(
                        &String::from_utf8_lossy(&output.stderr),
                        self.max_output_chars,
                    ),
                    exit_code,
                    timed_out: false,
                    duration_ms,
                }
            }
            Ok(Err(e)) => ExecutionResult {
                duration_ms,
                ..ExecutionResult::abnormal(format!("Failed to execute: {e}"))
            },
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Sandbox run timed out");
                ExecutionResult {
                    timed_out: true,
                    duration_ms,
                    ..ExecutionResult::abnormal(format!(
                        "Execution timed out after {}s",
                        self.timeout.as_secs()
                    ))
                }
            }
        }
    }
}

/// SIGKILL every process left in the run's group.
#[cfg(unix)]
fn kill_process_group(group: u32) {
    let Ok(pgid) = libc::pid_t::try_from(group) else {
        return;
    };
    if pgid <= 0 {
        return;
    }
    // SAFETY: killpg only sends a signal. ESRCH (group already gone) is the
    // common case and is ignored.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pgid, "Killed leftover sandbox processes");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: u32) {}

/// Relative, without `..`, root or drive components.
fn is_safe_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
