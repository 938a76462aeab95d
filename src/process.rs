//! External command execution.
//!
//! Every tool the pipeline drives (rpm, rpmbuild, sbverify, createrepo_c, ...)
//! is described by a [`Cmd`] value and handed to a [`Runner`]. Components never
//! build shell strings; the runner alone spawns processes and captures output.
//!
//! # Example
//!
//! ```rust,ignore
//! use mok_repackager::process::{Cmd, HostRunner};
//!
//! let runner = HostRunner::default();
//! let out = Cmd::new("rpm")
//!     .args(["-qlp"])
//!     .arg_path(&package)
//!     .error_msg("rpm manifest query failed")
//!     .run_with(&runner)?;
//! for line in out.stdout.lines() { /* ... */ }
//! ```

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// A typed command request: program plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    stdout_file: Option<PathBuf>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdout_file: None,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// Append an rpm-style `--define "<name> <value>"` pair.
    pub fn define(self, name: &str, value: &str) -> Self {
        self.arg("--define").arg(format!("{} {}", name, value))
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Redirect standard output into `path` instead of capturing it.
    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout_file = Some(path.to_path_buf());
        self
    }

    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn stdout_file(&self) -> Option<&Path> {
        self.stdout_file.as_deref()
    }

    /// Argument following the first occurrence of `flag`.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Run through `runner` and require exit status 0.
    pub fn run_with(&self, runner: &dyn Runner) -> Result<CmdOutput> {
        let output = runner.run(self)?;
        if output.success() {
            return Ok(output);
        }

        warn!(command = %self, code = ?output.code, "command failed");
        let msg = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("{} failed", self.program));
        bail!(
            "{}\n  Command: {}\n  Exit code: {}\n  Output: {}",
            msg,
            self,
            output
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            output.combined().trim()
        )
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        if let Some(path) = &self.stdout_file {
            write!(f, " > {}", shell_quote(&path.to_string_lossy()))?;
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+%@".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}\n{}", self.stdout.trim_end(), self.stderr)
    }

    /// Last `lines` lines of combined output.
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined();
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Executes [`Cmd`] requests.
///
/// `run` returns `Err` only when the process could not be started; a non-zero
/// exit is reported through [`CmdOutput::code`] so callers decide what it means.
pub trait Runner {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Whether `program` can be resolved on this host.
    fn has_program(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        debug!(command = %cmd, "running");

        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args).stdin(Stdio::null());
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        if let Some(path) = &cmd.stdout_file {
            let file = File::create(path)
                .with_context(|| format!("creating output file '{}'", path.display()))?;
            command.stdout(Stdio::from(file));
        }

        let output = command
            .output()
            .with_context(|| format!("spawning '{}'", cmd.program))?;

        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
