use crate::error::Result;
use chrono::{DateTime, Local};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Extraction,
    Import,
    Conversion,
}

impl PhaseKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            PhaseKind::Extraction => "extraction_logs",
            PhaseKind::Import => "import_logs",
            PhaseKind::Conversion => "conversion_logs",
        }
    }

    pub fn file_prefix(&self) -> &'static str {
        match self {
            PhaseKind::Extraction => "extraction",
            PhaseKind::Import => "calibre_import",
            PhaseKind::Conversion => "calibre_conversion",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            PhaseKind::Extraction => "KINDLE KEY EXTRACTION LOG",
            PhaseKind::Import => "CALIBRE IMPORT LOG",
            PhaseKind::Conversion => "KFX TO EPUB CONVERSION LOG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Failed,
    Timeout,
    Skipped,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Failed => write!(f, "FAILED"),
            EntryKind::Timeout => write!(f, "TIMEOUT"),
            EntryKind::Skipped => write!(f, "SKIPPED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: DateTime<Local>,
    pub kind: EntryKind,
    pub subject: String,
    pub detail: String,
}

impl LogEntry {
    pub fn render(&self) -> String {
        format!(
            "[{}] {} {}: {}",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.subject,
            self.detail
        )
    }
}

/// Collects the noteworthy outcomes of one phase and writes them to a
/// timestamped file under `Logs/<phase>_logs/`.
#[derive(Debug)]
pub struct PhaseLog {
    kind: PhaseKind,
    started: DateTime<Local>,
    context: Vec<(String, String)>,
    entries: Vec<LogEntry>,
}

impl PhaseLog {
    pub fn new(kind: PhaseKind) -> Self {
        Self {
            kind,
            started: Local::now(),
            context: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    /// Adds a `key: value` line to the header.
    pub fn context<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.context.push((key.into(), value.into()));
    }

    pub fn record<S: Into<String>>(&mut self, kind: EntryKind, subject: S, detail: &str) {
        // one line per entry
        let detail = detail
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" | ");

        let entry = LogEntry {
            at: Local::now(),
            kind,
            subject: subject.into(),
            detail,
        };
        tracing::debug!(phase = ?self.kind, entry = %entry.render(), "phase log entry");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn count(&self, kind: EntryKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the log when it has entries. Returns the file written, if any.
    pub fn write(&self, dir: &Path, summary: &[(String, String)]) -> Result<Option<PathBuf>> {
        if self.entries.is_empty() {
            return Ok(None);
        }

        fs::create_dir_all(dir)?;
        let path = unique_log_path(dir, self.kind.file_prefix(), &self.started);

        let rule = "=".repeat(70);
        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", rule)?;
        writeln!(file, "{}", self.kind.title())?;
        writeln!(file, "{}", rule)?;
        writeln!(file, "Started: {}", self.started.format("%Y-%m-%d %H:%M:%S"))?;
        for (key, value) in &self.context {
            writeln!(file, "{}: {}", key, value)?;
        }
        writeln!(file)?;

        for entry in &self.entries {
            writeln!(file, "{}", entry.render())?;
        }

        writeln!(file)?;
        writeln!(file, "{}", rule)?;
        writeln!(file, "SUMMARY")?;
        writeln!(file, "{}", rule)?;
        for (key, value) in summary {
            writeln!(file, "{}: {}", key, value)?;
        }
        writeln!(file, "Completed: {}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        file.flush()?;

        tracing::info!(path = %path.display(), entries = self.entries.len(), "phase log written");
        Ok(Some(path))
    }
}

fn unique_log_path(dir: &Path, prefix: &str, started: &DateTime<Local>) -> PathBuf {
    let stamp = started.format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{}_{}.log", prefix, stamp));
    let mut counter = 2;
    while path.exists() {
        path = dir.join(format!("{}_{}_{}.log", prefix, stamp, counter));
        counter += 1;
    }
    path
}
