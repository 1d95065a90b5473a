pub mod calibre;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod fsops;
pub mod history;
pub mod keys;
pub mod kindle;
pub mod logging;
pub mod phase_log;
pub mod pipeline;
pub mod plugin;
pub mod supervisor;
pub mod toolchain;
pub mod ui;
pub mod wizard;

// Public API re-exports
pub use cli::Cli;
pub use config::{Config, ConfigState, ConfigStore, SCRIPT_VERSION};
pub use environment::{UserPaths, Workspace, WorkspaceDecision};
pub use error::{KeyFinderError, Result, UserFriendlyError};
pub use history::History;
pub use pipeline::{ItemFailure, PhaseCounts, PhaseState, Pipeline, PipelineContext, RunSummary};
pub use supervisor::{ProcessTable, SystemProcessTable};
pub use toolchain::{ExternalTools, Toolchain};
pub use ui::{GracefulShutdown, OutputFormatter, ProgressManager, Prompter, ScriptedPrompter, TerminalPrompter};
pub use wizard::Wizard;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main library interface: resolves the workspace and configuration, then
/// drives the pipeline.
pub struct KeyFinder {
    paths: UserPaths,
    output: OutputFormatter,
    progress: ProgressManager,
    shutdown: GracefulShutdown,
    prompter: Box<dyn Prompter>,
    processes: Box<dyn ProcessTable>,
    toolchain: Box<dyn Toolchain>,
    poll_interval: Duration,
}

impl KeyFinder {
    /// Real terminal, real processes, real Calibre tools.
    pub fn new() -> Result<Self> {
        Ok(Self::from_parts(
            UserPaths::from_system()?,
            OutputFormatter::new(false),
            GracefulShutdown::new()?,
            Box::new(TerminalPrompter::new()),
            Box::new(SystemProcessTable),
            Box::new(ExternalTools::new()),
        ))
    }

    pub fn from_parts(
        paths: UserPaths,
        output: OutputFormatter,
        shutdown: GracefulShutdown,
        prompter: Box<dyn Prompter>,
        processes: Box<dyn ProcessTable>,
        toolchain: Box<dyn Toolchain>,
    ) -> Self {
        let progress = ProgressManager::new(!output.is_quiet());
        Self {
            paths,
            output,
            progress,
            shutdown,
            prompter,
            processes,
            toolchain,
            poll_interval: supervisor::POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Full run with `program_dir` as the preferred workspace.
    pub async fn run(&self, program_dir: &Path) -> Result<RunSummary> {
        self.output.clear_screen();
        self.output.print_banner(SCRIPT_VERSION);

        let decision = self.resolve_workspace(program_dir)?;
        let workspace = decision.workspace;

        let extractor = kindle::locate_extractor(&[program_dir.to_path_buf(), workspace.root().to_path_buf()])?;
        let store = ConfigStore::new(workspace.config_file());
        let config = self.resolve_config(&store).await?;

        self.run_pipeline(&config, &workspace, &extractor).await
    }

    fn resolve_workspace(&self, program_dir: &Path) -> Result<WorkspaceDecision> {
        let decision = Workspace::resolve(program_dir, &self.paths)?;
        if let Some(reason) = &decision.fallback {
            self.output.warning(&format!("Not using {}: {}", program_dir.display(), reason));
            self.output.detail(&format!(
                "Working files will be stored in {}",
                decision.workspace.root().display()
            ));
            self.output.blank();
        }
        if let Err(e) = decision.write_location_marker() {
            tracing::warn!(error = %e, "could not write location marker");
        }
        Ok(decision)
    }

    /// Loads the saved configuration, or runs the wizard when there is no
    /// usable one.
    pub async fn resolve_config(&self, store: &ConfigStore) -> Result<Config> {
        let wizard = Wizard::new(
            self.prompter.as_ref(),
            &self.output,
            &self.paths,
            self.processes.as_ref(),
            &self.shutdown,
        )
        .with_poll_interval(self.poll_interval);

        match store.load() {
            ConfigState::Ready(config) => match config.validate().and_then(|()| config.check_paths()) {
                Ok(()) => return wizard.review_saved(store, config).await,
                Err(e) => {
                    self.output.warning(&format!("Saved configuration is incomplete: {}", e));
                    self.output.step("The configuration wizard will run to fix it.");
                }
            },
            ConfigState::Missing => {
                self.output.step("First run detected - starting the configuration wizard");
            }
            ConfigState::Stale { found } => {
                self.output.warning("Configuration version mismatch detected");
                self.output.detail(&format!(
                    "Saved version: {}",
                    found.as_deref().unwrap_or("(none)")
                ));
                self.output.detail(&format!("Current version: {}", SCRIPT_VERSION));
                self.output.detail("The configuration wizard will run to set everything up again.");
                self.prompter.pause("Press Enter to continue...")?;
            }
            ConfigState::Unreadable { reason } => {
                self.output.warning(&format!("Saved configuration could not be read: {}", reason));
                self.output.step("The configuration wizard will run to replace it.");
            }
        }

        wizard.run(store).await
    }

    pub async fn run_pipeline(&self, config: &Config, workspace: &Workspace, extractor: &Path) -> Result<RunSummary> {
        let ctx = PipelineContext {
            config,
            workspace,
            paths: &self.paths,
            extractor,
            toolchain: self.toolchain.as_ref(),
            processes: self.processes.as_ref(),
            prompter: self.prompter.as_ref(),
            output: &self.output,
            progress: &self.progress,
            shutdown: &self.shutdown,
        };
        Pipeline::new(ctx)?
            .with_poll_interval(self.poll_interval)
            .run()
            .await
    }

    pub fn output_formatter(&self) -> &OutputFormatter {
        &self.output
    }

    pub fn user_paths(&self) -> &UserPaths {
        &self.paths
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_running()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request_shutdown();
    }

    /// Prints the error with its suggestion.
    pub fn handle_error(&self, error: &KeyFinderError) {
        self.output.print_user_friendly_error(error);
    }

    /// Last-chance prompt so a double-clicked console window stays open.
    pub fn pause_before_exit(&self) {
        if let Err(e) = self.prompter.pause("Press Enter to exit...") {
            tracing::debug!(error = %e, "exit pause skipped");
        }
    }
}

/// Directory the binary runs from; the preferred workspace.
pub fn program_dir() -> Result<PathBuf> {
    environment::executable_dir()
}

pub fn version_info() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
