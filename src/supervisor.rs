use crate::error::{KeyFinderError, Result};
use crate::ui::{GracefulShutdown, OutputFormatter};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// How often the process table is re-read while waiting for Calibre.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// E-book manager processes that lock the library or the plugin settings.
#[cfg(windows)]
pub const CALIBRE_PROCESSES: &[&str] = &[
    "calibre.exe",
    "calibre-parallel.exe",
    "calibredb.exe",
    "ebook-convert.exe",
];
#[cfg(not(windows))]
pub const CALIBRE_PROCESSES: &[&str] = &["calibre", "calibre-parallel", "calibredb", "ebook-convert"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn new<O: Into<String>, E: Into<String>>(exit_code: i32, stdout: O, stderr: E) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed(ToolOutput),
    TimedOut { after: Duration },
}

/// Runs external programs one at a time with a hard time limit.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, command: &ToolCommand, timeout: Duration) -> Result<ToolOutcome> {
        tracing::debug!(command = %command.display(), ?timeout, "starting tool");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = cmd.spawn().map_err(|source| KeyFinderError::ToolLaunch {
            program: command.program.display().to_string(),
            source,
        })?;

        // Dropping the wait future on timeout kills the child.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let output = ToolOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    elapsed: started.elapsed(),
                };
                tracing::debug!(
                    program = %command.program.display(),
                    exit_code = ?output.exit_code,
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    "tool finished"
                );
                Ok(ToolOutcome::Completed(output))
            }
            Ok(Err(e)) => Err(KeyFinderError::Io(e)),
            Err(_) => {
                tracing::warn!(program = %command.program.display(), ?timeout, "tool timed out and was killed");
                Ok(ToolOutcome::TimedOut { after: timeout })
            }
        }
    }
}

pub trait ProcessTable: Send + Sync {
    fn running_names(&self) -> Result<Vec<String>>;

    fn is_any_running(&self, names: &[&str]) -> Result<bool> {
        let wanted: Vec<String> = names.iter().map(|n| normalize_process_name(n)).collect();
        Ok(self
            .running_names()?
            .iter()
            .map(|n| normalize_process_name(n))
            .any(|n| wanted.contains(&n)))
    }
}

/// Reads the OS process table with `tasklist` (or `ps` off Windows).
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn running_names(&self) -> Result<Vec<String>> {
        let (program, args) = listing_command();
        let output = std::process::Command::new(program)
            .args(args)
            .output()
            .map_err(|e| KeyFinderError::ProcessList {
                message: format!("{}: {}", program, e),
            })?;

        if !output.status.success() {
            return Err(KeyFinderError::ProcessList {
                message: format!("{} exited with {}", program, output.status),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        #[cfg(windows)]
        let names = parse_tasklist_csv(&stdout);
        #[cfg(not(windows))]
        let names = parse_ps_output(&stdout);
        Ok(names)
    }
}

#[cfg(windows)]
fn listing_command() -> (&'static str, &'static [&'static str]) {
    ("tasklist", &["/FO", "CSV", "/NH"])
}

#[cfg(not(windows))]
fn listing_command() -> (&'static str, &'static [&'static str]) {
    ("ps", &["-A", "-o", "comm="])
}

pub fn parse_tasklist_csv(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix('"')?;
            let end = rest.find('"')?;
            Some(rest[..end].to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

pub fn parse_ps_output(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_process_name(name: &str) -> String {
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or(name);
    let lower = base.trim().to_lowercase();
    lower
        .strip_suffix(".exe")
        .map(str::to_string)
        .unwrap_or(lower)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    NotRunning,
    Closed { waited: Duration },
    Unverified,
}

/// Blocks until none of `names` are running. There is no upper bound; only
/// Ctrl+C ends the wait early.
pub async fn wait_for_exit(
    table: &dyn ProcessTable,
    names: &[&str],
    interval: Duration,
    shutdown: &GracefulShutdown,
    output: &OutputFormatter,
) -> Result<WaitOutcome> {
    let started = Instant::now();
    let mut announced = false;

    loop {
        shutdown.check_shutdown()?;

        match table.is_any_running(names) {
            Ok(false) if !announced => return Ok(WaitOutcome::NotRunning),
            Ok(false) => {
                output.success("Calibre has been closed");
                return Ok(WaitOutcome::Closed {
                    waited: started.elapsed(),
                });
            }
            Ok(true) => {
                if !announced {
                    output.warning("Calibre is currently running");
                    output.detail("Please close Calibre completely to continue");
                    output.detail("Waiting for Calibre to close...");
                    announced = true;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not check for running Calibre processes");
                output.warning("Could not check whether Calibre is running - continuing");
                return Ok(WaitOutcome::Unverified);
            }
        }

        tokio::time::sleep(interval).await;
    }
}
