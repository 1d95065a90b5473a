use crate::calibre::{last_used_library, validate_library};
use crate::config::{CalibreImportConfig, Config, ConfigStore, KfxZipMode, SourceFileManagement, SCRIPT_VERSION};
use crate::environment::UserPaths;
use crate::error::{KeyFinderError, Result};
use crate::supervisor::{wait_for_exit, ProcessTable, WaitOutcome, CALIBRE_PROCESSES, POLL_INTERVAL};
use crate::ui::{CountdownOutcome, GracefulShutdown, OutputFormatter, Prompter};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const TOTAL_STEPS: usize = 7;

enum Review {
    Save,
    Restart,
    Quit,
}

/// Interactive first-run setup, plus the "configuration found" screen
/// shown on later runs.
pub struct Wizard<'a> {
    prompter: &'a dyn Prompter,
    output: &'a OutputFormatter,
    paths: &'a UserPaths,
    processes: &'a dyn ProcessTable,
    shutdown: &'a GracefulShutdown,
    poll_interval: Duration,
}

impl<'a> Wizard<'a> {
    pub fn new(
        prompter: &'a dyn Prompter,
        output: &'a OutputFormatter,
        paths: &'a UserPaths,
        processes: &'a dyn ProcessTable,
        shutdown: &'a GracefulShutdown,
    ) -> Self {
        Self {
            prompter,
            output,
            paths,
            processes,
            shutdown,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Collects every setting, shows the review and saves on confirmation.
    /// Quitting from the review saves nothing.
    pub async fn run(&self, store: &ConfigStore) -> Result<Config> {
        loop {
            let mut config = self.collect().await?;
            match self.review(&config)? {
                Review::Save => {
                    store.save(&mut config)?;
                    self.output.success(&format!("Configuration saved to {}", store.path().display()));
                    self.output.blank();
                    return Ok(config);
                }
                Review::Restart => {
                    self.output.step("Restarting configuration wizard...");
                }
                Review::Quit => {
                    self.output.warning("Configuration cancelled - exiting without saving");
                    return Err(KeyFinderError::UserQuit);
                }
            }
        }
    }

    /// Shows a valid saved configuration and auto-proceeds after a
    /// countdown. A keypress opens the options menu.
    pub async fn review_saved(&self, store: &ConfigStore, mut config: Config) -> Result<Config> {
        self.output.step("Configuration Found");
        self.output.print_table(&config.summary_rows());

        if let Some(library) = config.import_library().map(Path::to_path_buf) {
            self.output.step("Validating saved Calibre library path...");
            match validate_library(&library) {
                Ok(()) => self.output.success("Library path validated"),
                Err(reason) => {
                    self.output.error("SAVED LIBRARY PATH IS INVALID!");
                    self.output.detail(&format!("Path: {}", library.display()));
                    self.output.detail(&format!("Error: {}", reason));
                    self.output.info("[R] Reconfigure - Update library path");
                    self.output.info("[D] Disable - Turn off Calibre import");
                    self.output.info("[Q] Quit - Exit script");

                    return match self.prompter.choose("Your choice (R/D/Q): ", &['R', 'D', 'Q'])? {
                        'R' => self.run(store).await,
                        'D' => {
                            config.calibre_import.enabled = false;
                            store.save(&mut config)?;
                            self.output.success("Calibre import disabled");
                            Ok(config)
                        }
                        _ => Err(KeyFinderError::UserQuit),
                    };
                }
            }
        }

        let seconds = if config.skip_phase_pauses { 3 } else { 10 };
        self.output.info(&format!(
            "Press any key to show options, or wait {} seconds to use saved configuration...",
            seconds
        ));
        if self.prompter.countdown(seconds, "Countdown:")? == CountdownOutcome::Elapsed {
            self.output.success("Auto-proceeding with saved configuration");
            return Ok(config);
        }

        self.output.step("Configuration Options:");
        self.output.detail("[U] Use saved configuration");
        self.output.detail("[R] Reconfigure settings");
        self.output.detail("[D] Delete saved config and reconfigure");
        self.output.detail("[Q] Quit script");

        match self.prompter.choose("Your choice (U/R/D/Q): ", &['U', 'R', 'D', 'Q'])? {
            'U' => Ok(config),
            'R' => self.run(store).await,
            'D' => {
                if store.delete()? {
                    self.output.success("Saved configuration deleted");
                }
                self.run(store).await
            }
            _ => Err(KeyFinderError::UserQuit),
        }
    }

    async fn collect(&self) -> Result<Config> {
        self.output.clear_screen();
        self.output.print_banner(SCRIPT_VERSION);
        self.output.step("PRE-FLIGHT CONFIGURATION WIZARD");
        self.output.info("This wizard will guide you through configuring all options.");
        self.output.blank();

        let mut config = Config::new();

        self.section(1, "Kindle Content Directory");
        config.kindle_content_path = self.ask_content_path()?;

        self.section(2, "Privacy Settings");
        self.output.detail("Hide sensitive information (DSN, tokens, keys) in console output?");
        config.hide_sensitive_info = self.prompter.confirm("Hide sensitive info? (Y/N) [Y]: ", true)?;

        self.section(3, "Key Extraction Display Options");
        self.output.detail("Fetching titles queries Amazon for each book and slows extraction down.");
        config.fetch_book_titles = self
            .prompter
            .confirm("Fetch book titles during extraction? (Y/N) [N]: ", false)?;

        self.section(4, "Display Options");
        config.clear_screen_between_phases = self
            .prompter
            .confirm("Clear screen between phases? (Y/N) [Y]: ", true)?;

        self.section(5, "Phase Pause Settings");
        self.output.detail("Skipping pauses also cuts the saved-configuration review to 3 seconds.");
        config.skip_phase_pauses = self.prompter.confirm("Skip phase pauses? (Y/N) [N]: ", false)?;

        self.section(6, "Processing History");
        self.output.detail("Books recorded in history.txt are skipped on later runs.");
        config.skip_processed_books = self
            .prompter
            .confirm("Skip previously processed books? (Y/N) [Y]: ", true)?;

        self.section(7, "Calibre Auto-Import");
        config.calibre_import = if self
            .prompter
            .confirm("Configure Calibre import now? (Y/N) [Y]: ", true)?
        {
            self.ask_import_settings().await?
        } else {
            self.output.success("Calibre auto-import disabled");
            CalibreImportConfig::default()
        };

        Ok(config)
    }

    fn section(&self, step: usize, title: &str) {
        self.output.blank();
        self.output.step(&format!("[{}/{}] {}", step, TOTAL_STEPS, title));
        self.output.print_separator();
    }

    fn ask_content_path(&self) -> Result<PathBuf> {
        let default = self.paths.default_content_dir();
        self.output.detail(&format!("Default: {}", default.display()));

        loop {
            if self.prompter.confirm("Use default path? (Y/N) [Y]: ", true)? {
                self.output.success(&format!("Using: {}", default.display()));
                return Ok(default);
            }

            let path = normalize_user_path(&self.prompter.ask("Enter custom path: ")?);
            if path.is_dir() {
                self.output.success(&format!("Using: {}", path.display()));
                return Ok(path);
            }
            self.output.error("Path does not exist. Try again.");
        }
    }

    async fn ask_import_settings(&self) -> Result<CalibreImportConfig> {
        // global.py.json is only trustworthy once Calibre has exited
        let waited = wait_for_exit(
            self.processes,
            CALIBRE_PROCESSES,
            self.poll_interval,
            self.shutdown,
            self.output,
        )
        .await?;
        if waited == WaitOutcome::NotRunning {
            self.output.success("Calibre not detected as running - proceeding automatically");
        }

        let Some(library) = self.ask_library_path()? else {
            self.output.warning("No valid library selected - Calibre auto-import disabled");
            return Ok(CalibreImportConfig::default());
        };

        let mut import = CalibreImportConfig {
            enabled: true,
            library_path: Some(library),
            ..CalibreImportConfig::default()
        };

        self.output.blank();
        self.output.step("Imported eBook to EPUB Conversion");
        import.convert_to_epub = self
            .prompter
            .confirm("Convert imported eBooks to EPUB? (Y/N) [Y]: ", true)?;
        if !import.convert_to_epub {
            return Ok(import);
        }

        self.output.blank();
        self.output.step("KFX-ZIP File Handling");
        self.output.detail("Files with .kfx-zip extension usually indicate DRM removal failed.");
        self.output.detail("[A] Convert All - Attempt every file including .kfx-zip (recommended)");
        self.output.detail("[S] Skip KFX-ZIP - Convert regular .kfx files only");
        import.kfx_zip_mode = match self.prompter.choose_or("Your choice (A/S) [A]: ", &['A', 'S'], 'A')? {
            'S' => KfxZipMode::SkipKfxZip,
            _ => KfxZipMode::ConvertAll,
        };

        self.output.blank();
        self.output.step("Source File Management");
        self.output.detail("[K] Keep Both - Preserve source format and EPUB");
        self.output.detail("[D] Delete Source - Remove the source format after conversion (recommended)");
        self.output.detail("[S] Smart Cleanup - Delete only .kfx-zip formats");
        import.source_file_management =
            match self.prompter.choose_or("Your choice (K/D/S) [D]: ", &['K', 'D', 'S'], 'D')? {
                'K' => SourceFileManagement::KeepBoth,
                'S' => SourceFileManagement::DeleteKfxZipOnly,
                _ => SourceFileManagement::DeleteSource,
            };

        Ok(import)
    }

    fn ask_library_path(&self) -> Result<Option<PathBuf>> {
        match last_used_library(&self.paths.calibre_global_config()) {
            Some(last) => {
                self.output.success(&format!("Last used Calibre library: {}", last.display()));
                if self.prompter.confirm("Use this library? (Y/N) [Y]: ", true)? {
                    match validate_library(&last) {
                        Ok(()) => return Ok(Some(last)),
                        Err(reason) => self.output.warning(&format!("Library path invalid: {}", reason)),
                    }
                }
            }
            None => self.output.warning("Could not find Calibre configuration"),
        }

        self.output.step("Enter Calibre Library Path");
        self.output.detail("This is the folder containing metadata.db");
        loop {
            let raw = self.prompter.ask("Library path: ")?;
            if raw.trim().is_empty() {
                self.output.error("Path cannot be empty");
                continue;
            }

            let path = normalize_user_path(&raw);
            match validate_library(&path) {
                Ok(()) => {
                    self.output.success(&format!("Library path validated: {}", path.display()));
                    return Ok(Some(path));
                }
                Err(reason) => {
                    self.output.error(&format!("Invalid library path: {}", reason));
                    if !self.prompter.confirm("Try again? (Y/N) [N]: ", false)? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn review(&self, config: &Config) -> Result<Review> {
        self.output.clear_screen();
        self.output.step("CONFIGURATION REVIEW");
        self.output.info("Please review your configuration before saving:");
        self.output.print_table(&config.summary_rows());
        self.output.detail("[Y] Yes, save and continue (recommended)");
        self.output.detail("[R] Reconfigure - Start over");
        self.output.detail("[Q] Quit without saving");

        Ok(
            match self.prompter.choose_or("Your choice (Y/R/Q) [Y]: ", &['Y', 'R', 'Q'], 'Y')? {
                'R' => Review::Restart,
                'Q' => Review::Quit,
                _ => Review::Save,
            },
        )
    }
}

/// Strips surrounding quotes and expands `%VAR%`, `$VAR` and `${VAR}`.
pub fn normalize_user_path(input: &str) -> PathBuf {
    let trimmed = input.trim().trim_matches(&['"', '\''][..]);
    PathBuf::from(expand_env_vars(trimmed))
}

/// Unknown variables are left as written.
pub fn expand_env_vars(input: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"%([^%]+)%|\$\{([^}]+)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .map_err(|e| tracing::error!(error = %e, "invalid variable pattern"))
            .ok()
    });
    let Some(pattern) = pattern else {
        return input.to_string();
    };

    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
