mod conversion;
mod extraction;
mod import;
mod plugin_setup;
mod summary;

use crate::calibre::BookId;
use crate::config::Config;
use crate::environment::{UserPaths, Workspace};
use crate::error::{KeyFinderError, Result};
use crate::history::History;
use crate::keys::ExtractorReport;
use crate::phase_log::{EntryKind, PhaseLog};
use crate::supervisor::{wait_for_exit, ProcessTable, ToolOutcome, ToolOutput, WaitOutcome, CALIBRE_PROCESSES, POLL_INTERVAL};
use crate::toolchain::Toolchain;
use crate::ui::{GracefulShutdown, OutputFormatter, ProgressManager, Prompter};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const PHASE_PAUSE_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Validate,
    Extract,
    ConfigurePlugin,
    Import,
    Convert,
    Summary,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseState::Validate => "Validation",
            PhaseState::Extract => "Key Extraction",
            PhaseState::ConfigurePlugin => "DeDRM Plugin Configuration",
            PhaseState::Import => "Calibre Import",
            PhaseState::Convert => "EPUB Conversion",
            PhaseState::Summary => "Summary",
        };
        write!(f, "{}", name)
    }
}

/// Everything a run borrows from the caller.
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    pub config: &'a Config,
    pub workspace: &'a Workspace,
    pub paths: &'a UserPaths,
    pub extractor: &'a Path,
    pub toolchain: &'a dyn Toolchain,
    pub processes: &'a dyn ProcessTable,
    pub prompter: &'a dyn Prompter,
    pub output: &'a OutputFormatter,
    pub progress: &'a ProgressManager,
    pub shutdown: &'a GracefulShutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub phase: PhaseState,
    pub asin: Option<String>,
    pub subject: String,
    pub reason: String,
}

/// Outcome of a whole run, as shown on the final screen.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub books_found: usize,
    pub skipped_by_history: usize,
    pub extraction: PhaseCounts,
    pub plugin_configured: bool,
    pub import: Option<PhaseCounts>,
    pub conversion: Option<PhaseCounts>,
    pub imported_ids: Vec<BookId>,
    pub failures: Vec<ItemFailure>,
    pub log_files: Vec<PathBuf>,
    pub paused: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Items that failed in any phase, each counted once.
    pub fn failed_items(&self) -> usize {
        let mut asins = HashSet::new();
        let mut anonymous = 0;
        for failure in &self.failures {
            match &failure.asin {
                Some(asin) => {
                    asins.insert(asin.as_str());
                }
                None => anonymous += 1,
            }
        }
        asins.len() + anonymous
    }

    /// Extracted items with no failure in a later phase.
    pub fn succeeded_items(&self) -> usize {
        let later_failures: HashSet<&str> = self
            .failures
            .iter()
            .filter(|f| f.phase != PhaseState::Extract)
            .filter_map(|f| f.asin.as_deref())
            .collect();
        self.extraction.succeeded.saturating_sub(later_failures.len())
    }

    pub fn overall_line(&self) -> String {
        format!(
            "{} succeeded, {} skipped by history, {} failed",
            self.succeeded_items(),
            self.skipped_by_history,
            self.failed_items()
        )
    }
}

#[derive(Debug, Clone)]
struct ImportedBook {
    id: BookId,
    asin: String,
}

/// A tool run that did not do its job.
#[derive(Debug, Clone)]
struct ToolFailure {
    kind: EntryKind,
    reason: String,
}

/// Splits a tool run into its output or the reason it failed.
fn completed(result: Result<ToolOutcome>, what: &str) -> std::result::Result<ToolOutput, ToolFailure> {
    match result {
        Ok(ToolOutcome::Completed(output)) => Ok(output),
        Ok(ToolOutcome::TimedOut { after }) => Err(ToolFailure {
            kind: EntryKind::Timeout,
            reason: format!("{} timed out after {} seconds", what, after.as_secs()),
        }),
        Err(e) => Err(ToolFailure {
            kind: EntryKind::Failed,
            reason: e.to_string(),
        }),
    }
}

/// Like `completed`, but a non-zero exit is a failure too.
fn succeeded(result: Result<ToolOutcome>, what: &str) -> std::result::Result<ToolOutput, ToolFailure> {
    let output = completed(result, what)?;
    if output.success() {
        Ok(output)
    } else {
        Err(ToolFailure {
            kind: EntryKind::Failed,
            reason: output.error_text(),
        })
    }
}

/// The linear run `Validate -> Extract -> ConfigurePlugin -> Import ->
/// Convert -> Summary`. Each phase decides which one comes next.
pub struct Pipeline<'a> {
    ctx: PipelineContext<'a>,
    history: History,
    poll_interval: Duration,
    import_library: Option<PathBuf>,
    allow_duplicates: bool,
    report: ExtractorReport,
    extracted: Vec<String>,
    failed_extractions: BTreeMap<String, String>,
    titles: BTreeMap<String, String>,
    imported: Vec<ImportedBook>,
    summary: RunSummary,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: PipelineContext<'a>) -> Result<Self> {
        let history = History::load(ctx.workspace.history_file())?;
        Ok(Self {
            ctx,
            history,
            poll_interval: POLL_INTERVAL,
            import_library: None,
            allow_duplicates: false,
            report: ExtractorReport::default(),
            extracted: Vec::new(),
            failed_extractions: BTreeMap::new(),
            titles: BTreeMap::new(),
            imported: Vec::new(),
            summary: RunSummary::default(),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run(mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut state = PhaseState::Validate;
        loop {
            tracing::info!(phase = %state, "entering phase");
            state = match state {
                PhaseState::Validate => self.validate().await?,
                PhaseState::Extract => self.extract().await?,
                PhaseState::ConfigurePlugin => self.configure_plugin().await?,
                PhaseState::Import => self.import().await?,
                PhaseState::Convert => self.convert().await?,
                PhaseState::Summary => {
                    self.summary.elapsed = started.elapsed();
                    self.summarize()?;
                    return Ok(self.summary);
                }
            };
        }
    }

    async fn validate(&mut self) -> Result<PhaseState> {
        let ctx = self.ctx;

        if crate::kindle::cleanup_leftover_temp_copy(ctx.paths) {
            ctx.output.warning("Removed leftover temporary Kindle copy from a previous run");
        }

        let content = &ctx.config.kindle_content_path;
        if !content.is_dir() {
            return Err(KeyFinderError::InvalidPath {
                path: content.display().to_string(),
            });
        }
        ctx.workspace.prepare()?;

        self.import_library = match ctx.config.import_library() {
            Some(library) => match crate::calibre::validate_library(library) {
                Ok(()) => Some(library.to_path_buf()),
                Err(reason) => {
                    ctx.output.warning(&format!(
                        "Calibre library {} is not usable ({}); import is disabled for this run",
                        library.display(),
                        reason
                    ));
                    None
                }
            },
            None => None,
        };

        if self.import_library.is_some() {
            self.wait_for_calibre().await?;
        }
        Ok(PhaseState::Extract)
    }

    async fn wait_for_calibre(&self) -> Result<WaitOutcome> {
        wait_for_exit(
            self.ctx.processes,
            CALIBRE_PROCESSES,
            self.poll_interval,
            self.ctx.shutdown,
            self.ctx.output,
        )
        .await
    }

    fn begin_phase(&self, number: u8, name: &str) {
        if self.ctx.config.clear_screen_between_phases {
            self.ctx.output.clear_screen();
        }
        self.ctx.output.phase_banner(number, name);
    }

    fn end_phase(&self, number: u8, name: &str, points: &[String]) -> Result<()> {
        self.ctx.output.phase_summary(number, name, points);
        if !self.ctx.config.skip_phase_pauses {
            self.ctx.prompter.countdown(PHASE_PAUSE_SECS, "Next phase in")?;
        }
        Ok(())
    }

    fn fail(&mut self, phase: PhaseState, asin: Option<&str>, subject: &str, reason: &str) {
        self.summary.failures.push(ItemFailure {
            phase,
            asin: asin.map(str::to_string),
            subject: subject.to_string(),
            reason: reason.to_string(),
        });
    }

    fn write_log(&mut self, log: &PhaseLog, summary: &[(String, String)]) {
        match log.write(&self.ctx.workspace.logs_dir(log.kind()), summary) {
            Ok(Some(path)) => {
                self.ctx.output.step("Detailed log saved to:");
                self.ctx.output.detail(&path.display().to_string());
                self.summary.log_files.push(path);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(phase = ?log.kind(), error = %e, "could not write phase log");
                self.ctx.output.warning(&format!("Could not write log file: {}", e));
            }
        }
    }

    fn record_history(&mut self, asin: &str) {
        let title = self.titles.get(asin).map(String::as_str);
        if let Err(e) = self.history.record(asin, title) {
            tracing::warn!(asin, error = %e, "could not record processing history");
        }
    }

    fn skip_by_history(&self, asin: &str) -> bool {
        self.ctx.config.skip_processed_books && self.history.contains(asin)
    }

    fn failed_asins(&self) -> BTreeSet<&str> {
        self.failed_extractions.keys().map(String::as_str).collect()
    }
}
