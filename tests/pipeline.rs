use async_trait::async_trait;
use kindle_key_finder::calibre::{BookId, LibraryBook};
use kindle_key_finder::config::{CalibreImportConfig, KfxZipMode, SourceFileManagement};
use kindle_key_finder::keys::KeyFilePair;
use kindle_key_finder::kindle::{EXTRACTOR_EXE, KINDLE_EXE, UPDATES_FILE};
use kindle_key_finder::supervisor::{ToolOutcome, ToolOutput};
use kindle_key_finder::ui::CountdownOutcome;
use kindle_key_finder::{
    Config, ConfigStore, GracefulShutdown, KeyFinder, KeyFinderError, OutputFormatter, PhaseCounts, ProcessTable,
    Prompter, Result, RunSummary, ScriptedPrompter, Toolchain, UserPaths,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct Calls {
    extracted: Vec<String>,
    imported: Vec<(BookId, PathBuf)>,
    duplicates_mode: Vec<bool>,
    removed_books: Vec<Vec<BookId>>,
    converted: Vec<(PathBuf, PathBuf)>,
    convert_timeouts: Vec<Duration>,
    added_formats: Vec<(BookId, PathBuf)>,
    removed_formats: Vec<(BookId, String)>,
}

/// What the fake tools do. Everything succeeds unless listed here.
#[derive(Default)]
struct Behaviour {
    failing_extractions: HashSet<String>,
    duplicate_imports: HashSet<String>,
    timed_out_imports: HashSet<String>,
    /// Library format of each imported book, in import order. Unlisted
    /// books alternate between KFX and AZW3.
    formats: Vec<&'static str>,
    failing_conversions: HashSet<&'static str>,
    timed_out_conversions: HashSet<&'static str>,
    leftover_books: Vec<LibraryBook>,
    list_fails: bool,
}

fn asins(list: &[&str]) -> HashSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Stands in for the extractor and Calibre.
#[derive(Clone)]
struct FakeToolchain {
    library: PathBuf,
    behaviour: Arc<Behaviour>,
    calls: Arc<Mutex<Calls>>,
}

impl FakeToolchain {
    fn new(library: &Path, failing: &[&str]) -> Self {
        Self::with_behaviour(
            library,
            Behaviour {
                failing_extractions: asins(failing),
                ..Behaviour::default()
            },
        )
    }

    fn with_behaviour(library: &Path, behaviour: Behaviour) -> Self {
        Self {
            library: library.to_path_buf(),
            behaviour: Arc::new(behaviour),
            calls: Arc::new(Mutex::new(Calls::default())),
        }
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }

    fn imported_book(&self, index: usize, id: BookId) -> LibraryBook {
        let extension = self
            .behaviour
            .formats
            .get(index)
            .copied()
            .unwrap_or(if id % 2 == 1 { "kfx" } else { "azw3" });
        let dir = self.library.join(format!("Book {}", id));
        LibraryBook {
            id,
            title: format!("Book {}", id),
            authors: "Author".to_string(),
            formats: vec![dir.join(format!("book.{}", extension))],
        }
    }
}

fn ok() -> ToolOutcome {
    ToolOutcome::Completed(ToolOutput::new(0, "", ""))
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn extract_keys(
        &self,
        _extractor: &Path,
        staging: &Path,
        output: &KeyFilePair,
        _timeout: Duration,
    ) -> Result<ToolOutcome> {
        let folder = fs::read_dir(staging)?
            .next()
            .expect("staged book folder")?
            .file_name()
            .to_string_lossy()
            .into_owned();
        let asin = folder.split('_').next().unwrap().to_string();
        self.calls().extracted.push(asin.clone());

        if self.behaviour.failing_extractions.contains(&asin) {
            return Ok(ToolOutcome::Completed(ToolOutput::new(1, "", "Failed to decrypt book")));
        }

        fs::write(&output.voucher, format!("voucher-{}\n", asin))?;
        fs::write(
            &output.account,
            json!({
                "DSN": "A1B2C3D4E5F6",
                "kindle.account.tokens": "token-value",
                "kindle.account.secrets": [format!("secret-{}", asin)],
                "kindle.account.new_secrets": [],
                "kindle.account.clear_old_secrets": []
            })
            .to_string(),
        )?;
        Ok(ToolOutcome::Completed(ToolOutput::new(
            0,
            "DSN A1B2C3D4E5F6\nTokens token-value,other",
            "",
        )))
    }

    async fn fetch_title(&self, _asin: &str) -> Option<String> {
        None
    }

    async fn import_book(
        &self,
        book: &Path,
        _library: &Path,
        allow_duplicates: bool,
        timeout: Duration,
    ) -> Result<ToolOutcome> {
        let stem = book.file_stem().unwrap().to_string_lossy().into_owned();
        let asin = stem.split('_').next().unwrap().to_string();
        let mut calls = self.calls();
        calls.duplicates_mode.push(allow_duplicates);

        if self.behaviour.timed_out_imports.contains(&asin) {
            return Ok(ToolOutcome::TimedOut { after: timeout });
        }
        if self.behaviour.duplicate_imports.contains(&asin) {
            return Ok(ToolOutcome::Completed(ToolOutput::new(
                0,
                "The following books were not added as they already exist in the database \
                 (see --duplicates option or --automerge option):\n  Book Title\n",
                "",
            )));
        }

        let id = calls.imported.len() as BookId + 1;
        calls.imported.push((id, book.to_path_buf()));
        Ok(ToolOutcome::Completed(ToolOutput::new(
            0,
            format!("Added book ids: {}", id),
            "",
        )))
    }

    async fn list_books(&self, _library: &Path) -> Result<Vec<LibraryBook>> {
        if self.behaviour.list_fails {
            return Err(KeyFinderError::Config {
                message: "calibredb list returned no book data".to_string(),
            });
        }
        let calls = self.calls();
        let mut books = self.behaviour.leftover_books.clone();
        books.extend(
            calls
                .imported
                .iter()
                .enumerate()
                .map(|(index, (id, _))| self.imported_book(index, *id)),
        );
        Ok(books)
    }

    async fn remove_books(&self, _library: &Path, ids: &[BookId]) -> Result<ToolOutcome> {
        self.calls().removed_books.push(ids.to_vec());
        Ok(ok())
    }

    async fn convert(&self, source: &Path, target: &Path, timeout: Duration) -> Result<ToolOutcome> {
        let extension = source
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        {
            let mut calls = self.calls();
            calls.converted.push((source.to_path_buf(), target.to_path_buf()));
            calls.convert_timeouts.push(timeout);
        }

        if self.behaviour.timed_out_conversions.contains(extension.as_str()) {
            return Ok(ToolOutcome::TimedOut { after: timeout });
        }
        if self.behaviour.failing_conversions.contains(extension.as_str()) {
            return Ok(ToolOutcome::Completed(ToolOutput::new(1, "", "Input file is DRM protected")));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, b"converted")?;
        Ok(ok())
    }

    async fn add_format(&self, _library: &Path, id: BookId, file: &Path) -> Result<ToolOutcome> {
        self.calls().added_formats.push((id, file.to_path_buf()));
        Ok(ok())
    }

    async fn remove_format(&self, _library: &Path, id: BookId, format: &str) -> Result<ToolOutcome> {
        self.calls().removed_formats.push((id, format.to_string()));
        Ok(ok())
    }
}

struct NothingRunning;

impl ProcessTable for NothingRunning {
    fn running_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Lets the test keep a handle on the prompter the finder owns.
struct SharedPrompter(Arc<ScriptedPrompter>);

impl Prompter for SharedPrompter {
    fn ask(&self, question: &str) -> Result<String> {
        self.0.ask(question)
    }

    fn countdown(&self, seconds: u64, label: &str) -> Result<CountdownOutcome> {
        self.0.countdown(seconds, label)
    }

    fn pause(&self, message: &str) -> Result<()> {
        self.0.pause(message)
    }

    fn invalid_choice(&self, message: &str) {
        self.0.invalid_choice(message)
    }
}

struct Fixture {
    _temp_dir: TempDir,
    paths: UserPaths,
    program_dir: PathBuf,
    content: PathBuf,
    library: PathBuf,
}

impl Fixture {
    fn new(asins: &[&str]) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let paths = UserPaths::rooted_at(temp_dir.path());

        let program_dir = temp_dir.path().join("program");
        fs::create_dir_all(&program_dir).unwrap();
        fs::write(program_dir.join(EXTRACTOR_EXE), b"extractor").unwrap();

        let kindle = paths.kindle_appdata_dir();
        fs::create_dir_all(&kindle).unwrap();
        fs::write(kindle.join(KINDLE_EXE), b"kindle").unwrap();

        let content = paths.default_content_dir();
        for asin in asins {
            let folder = content.join(format!("{}_EBOK", asin));
            fs::create_dir_all(&folder).unwrap();
            fs::write(folder.join(format!("{}_EBOK.azw", asin)), b"book").unwrap();
        }

        let library = paths.home.join("Calibre Library");
        fs::create_dir_all(&library).unwrap();
        fs::write(library.join("metadata.db"), b"").unwrap();

        let dedrm = paths.dedrm_config();
        fs::create_dir_all(dedrm.parent().unwrap()).unwrap();
        fs::write(
            &dedrm,
            json!({ "configured": true, "kindlekeys": {}, "serials": ["B0SERIAL"] }).to_string(),
        )
        .unwrap();

        Self {
            _temp_dir: temp_dir,
            paths,
            program_dir,
            content,
            library,
        }
    }

    fn save_config(&self, import: bool, skip_processed_books: bool) {
        self.save_config_with(import, skip_processed_books, |_| {});
    }

    fn save_config_with<F: FnOnce(&mut Config)>(&self, import: bool, skip_processed_books: bool, adjust: F) {
        let mut config = Config::new();
        config.kindle_content_path = self.content.clone();
        config.clear_screen_between_phases = false;
        config.skip_phase_pauses = true;
        config.skip_processed_books = skip_processed_books;
        if import {
            config.calibre_import = CalibreImportConfig {
                enabled: true,
                library_path: Some(self.library.clone()),
                source_file_management: SourceFileManagement::DeleteSource,
                ..CalibreImportConfig::default()
            };
        }
        adjust(&mut config);
        ConfigStore::new(self.program_dir.join("key_finder_config.json"))
            .save(&mut config)
            .unwrap();
    }

    async fn run(&self, tools: &FakeToolchain, prompter: &Arc<ScriptedPrompter>) -> Result<RunSummary> {
        let finder = KeyFinder::from_parts(
            self.paths.clone(),
            OutputFormatter::new(true),
            GracefulShutdown::new_for_test(),
            Box::new(SharedPrompter(prompter.clone())),
            Box::new(NothingRunning),
            Box::new(tools.clone()),
        )
        .with_poll_interval(Duration::from_millis(1));
        finder.run(&self.program_dir).await
    }

    fn history(&self) -> String {
        fs::read_to_string(self.program_dir.join("history.txt")).unwrap_or_default()
    }

    fn dedrm(&self) -> Value {
        serde_json::from_str(&fs::read_to_string(self.paths.dedrm_config()).unwrap()).unwrap()
    }

    /// Every log written for one phase, concatenated.
    fn logs(&self, phase_dir: &str) -> String {
        let dir = self.program_dir.join("Logs").join(phase_dir);
        let Ok(entries) = fs::read_dir(dir) else {
            return String::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| fs::read_to_string(e.path()).unwrap())
            .collect()
    }

    fn files_in(&self, dir: &str) -> usize {
        fs::read_dir(self.program_dir.join(dir))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

#[tokio::test]
async fn test_full_run_with_one_failing_book() {
    let fixture = Fixture::new(&["B0001", "B0002", "B0003"]);
    fixture.save_config(true, true);
    let tools = FakeToolchain::new(&fixture.library, &["B0002"]);
    let prompter = Arc::new(ScriptedPrompter::default());

    let summary = fixture.run(&tools, &prompter).await.unwrap();

    assert_eq!(summary.overall_line(), "2 succeeded, 0 skipped by history, 1 failed");
    assert_eq!(summary.books_found, 3);
    assert_eq!(summary.extraction.succeeded, 2);
    assert_eq!(summary.extraction.failed, 1);
    assert!(summary.plugin_configured);
    assert_eq!(summary.imported_ids, vec![1, 2]);
    assert!(summary.paused);
    assert_eq!(prompter.pauses(), vec!["Press Enter to exit..."]);

    // keys merged from both good books
    let voucher = fs::read_to_string(fixture.program_dir.join("Keys").join("kindlekey.txt")).unwrap();
    assert_eq!(voucher.lines().collect::<Vec<_>>(), vec!["voucher-B0001", "voucher-B0003"]);

    // plugin config rewritten over a backup, other keys kept
    let dedrm = fixture.dedrm();
    let key = &dedrm["kindlekeys"]["kindlekey"];
    assert_eq!(key["DSN"], "A1B2C3D4E5F6");
    assert_eq!(key["kindle.account.secrets"], json!(["secret-B0001", "secret-B0003"]));
    assert_eq!(dedrm["serials"], json!(["B0SERIAL"]));
    assert!(dedrm["kindleextrakeyfile"].as_str().unwrap().ends_with("kindlekey.txt"));
    assert_eq!(fixture.files_in("backups"), 1);

    // the failed book is neither imported nor recorded
    let calls = tools.calls();
    assert_eq!(calls.extracted, vec!["B0001", "B0002", "B0003"]);
    let imported: Vec<String> = calls
        .imported
        .iter()
        .map(|(_, path)| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(imported, vec!["B0001_EBOK.azw", "B0003_EBOK.azw"]);
    assert!(calls.duplicates_mode.iter().all(|mode| !mode));
    let history = fixture.history();
    assert!(history.contains("B0001") && history.contains("B0003"));
    assert!(!history.contains("B0002"));

    // KFX converts directly, AZW3 through a MOBI intermediate
    assert_eq!(calls.converted.len(), 3);
    assert!(calls.converted[1].1.extension().unwrap() == "mobi");
    assert_eq!(calls.added_formats.len(), 2);
    assert_eq!(
        calls.removed_formats,
        vec![(1, "KFX".to_string()), (2, "AZW3".to_string())]
    );

    // the extractor copy and staging folders are gone, auto-update is blocked
    assert!(!fixture.paths.kindle_appdata_dir().join(EXTRACTOR_EXE).exists());
    assert!(fixture.paths.kindle_base_dir().join(UPDATES_FILE).exists());
    let leftovers = fs::read_dir(&fixture.program_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("temp_"))
        .count();
    assert_eq!(leftovers, 0);

    let extraction_logs = fixture.program_dir.join("Logs").join("extraction_logs");
    let log = fs::read_dir(&extraction_logs).unwrap().next().unwrap().unwrap().path();
    let log = fs::read_to_string(log).unwrap();
    assert!(log.contains("FAILED B0002_EBOK: Failed to decrypt book"));
}

#[tokio::test]
async fn test_second_run_skips_recorded_books() {
    let fixture = Fixture::new(&["B0001", "B0002", "B0003"]);
    fixture.save_config(true, true);
    let tools = FakeToolchain::new(&fixture.library, &["B0002"]);

    fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();
    let dedrm_after_first = fixture.dedrm();
    let history_after_first = fixture.history();

    let second_tools = FakeToolchain::new(&fixture.library, &["B0002"]);
    let summary = fixture
        .run(&second_tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(summary.overall_line(), "0 succeeded, 2 skipped by history, 1 failed");
    assert!(!summary.plugin_configured);
    assert_eq!(second_tools.calls().extracted, vec!["B0002"]);
    assert!(second_tools.calls().imported.is_empty());
    assert_eq!(fixture.dedrm(), dedrm_after_first);
    assert_eq!(fixture.history(), history_after_first);
}

#[tokio::test]
async fn test_history_ignored_when_reprocessing() {
    let fixture = Fixture::new(&["B0001", "B0002"]);
    fs::write(fixture.program_dir.join("history.txt"), "B0001 Already Done\n").unwrap();
    fixture.save_config(false, false);
    let tools = FakeToolchain::new(&fixture.library, &[]);

    let summary = fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(summary.overall_line(), "2 succeeded, 0 skipped by history, 0 failed");
    assert!(!summary.paused);
    assert_eq!(tools.calls().extracted, vec!["B0001", "B0002"]);
    assert!(tools.calls().imported.is_empty());

    // import disabled: extraction itself is recorded, once per book
    let history = fixture.history();
    assert_eq!(history.matches("B0001").count(), 1);
    assert!(history.contains("B0002"));
}

#[tokio::test]
async fn test_all_books_in_history_goes_straight_to_summary() {
    let fixture = Fixture::new(&["B0001"]);
    fs::write(fixture.program_dir.join("history.txt"), "B0001\n").unwrap();
    fixture.save_config(false, true);
    let tools = FakeToolchain::new(&fixture.library, &[]);

    let summary = fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(summary.overall_line(), "0 succeeded, 1 skipped by history, 0 failed");
    assert!(tools.calls().extracted.is_empty());
    assert!(!fixture.paths.kindle_appdata_dir().join(EXTRACTOR_EXE).exists());
}

#[tokio::test]
async fn test_menu_quit_is_user_quit() {
    let fixture = Fixture::new(&["B0001"]);
    fixture.save_config(false, true);
    let tools = FakeToolchain::new(&fixture.library, &[]);
    let prompter = Arc::new(ScriptedPrompter::new(["q"]).with_countdowns([CountdownOutcome::Interrupted]));

    let result = fixture.run(&tools, &prompter).await;

    assert!(matches!(result, Err(KeyFinderError::UserQuit)));
    assert!(tools.calls().extracted.is_empty());
}

#[tokio::test]
async fn test_missing_kindle_installation_is_fatal() {
    let fixture = Fixture::new(&["B0001"]);
    fs::remove_dir_all(fixture.paths.kindle_appdata_dir()).unwrap();
    fixture.save_config(false, true);
    let tools = FakeToolchain::new(&fixture.library, &[]);

    let result = fixture.run(&tools, &Arc::new(ScriptedPrompter::default())).await;

    assert!(matches!(result, Err(KeyFinderError::KindleNotFound { .. })));
}

#[tokio::test]
async fn test_duplicate_import_is_recorded_in_history() {
    let fixture = Fixture::new(&["B0001"]);
    fixture.save_config(true, true);
    let tools = FakeToolchain::with_behaviour(
        &fixture.library,
        Behaviour {
            duplicate_imports: asins(&["B0001"]),
            ..Behaviour::default()
        },
    );

    let summary = fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(
        summary.import,
        Some(PhaseCounts {
            succeeded: 0,
            skipped: 1,
            failed: 0
        })
    );
    assert_eq!(summary.conversion, None);
    assert_eq!(summary.overall_line(), "1 succeeded, 0 skipped by history, 0 failed");
    assert!(fixture.history().contains("B0001"));
    assert!(fixture
        .logs("import_logs")
        .contains("SKIPPED B0001_EBOK.azw: Already in library: Book Title"));

    let second_tools = FakeToolchain::new(&fixture.library, &[]);
    let summary = fixture
        .run(&second_tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(summary.overall_line(), "0 succeeded, 1 skipped by history, 0 failed");
    assert!(second_tools.calls().extracted.is_empty());
}

#[tokio::test]
async fn test_timeouts_are_logged_and_the_run_continues() {
    let fixture = Fixture::new(&["B0001", "B0002", "B0003"]);
    fixture.save_config_with(true, true, |config| config.conversion_timeout_secs = 45);
    let tools = FakeToolchain::with_behaviour(
        &fixture.library,
        Behaviour {
            timed_out_imports: asins(&["B0001"]),
            formats: vec!["kfx", "azw3"],
            timed_out_conversions: ["kfx"].into_iter().collect(),
            ..Behaviour::default()
        },
    );

    let summary = fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(
        summary.import,
        Some(PhaseCounts {
            succeeded: 2,
            skipped: 0,
            failed: 1
        })
    );
    assert_eq!(
        summary.conversion,
        Some(PhaseCounts {
            succeeded: 1,
            skipped: 0,
            failed: 1
        })
    );
    assert_eq!(summary.overall_line(), "1 succeeded, 0 skipped by history, 2 failed");
    assert!(summary.paused);

    let import_log = fixture.logs("import_logs");
    assert!(import_log.contains("TIMEOUT B0001_EBOK.azw: Import timed out after 60 seconds"));
    assert!(import_log.contains("Timed Out: 1"));
    let conversion_log = fixture.logs("conversion_logs");
    assert!(conversion_log.contains("TIMEOUT Book 1 'Book 1' by Author: Conversion timed out after 45 seconds"));

    // the AZW3 book still went through both steps
    let calls = tools.calls();
    assert_eq!(calls.converted.len(), 3);
    assert!(calls.convert_timeouts.iter().all(|t| *t == Duration::from_secs(45)));
    assert_eq!(calls.added_formats.len(), 1);
    assert!(!fixture.history().contains("B0001"));
}

#[tokio::test]
async fn test_kfx_zip_skipped_when_configured() {
    let fixture = Fixture::new(&["B0001", "B0002"]);
    fixture.save_config_with(true, true, |config| {
        config.calibre_import.kfx_zip_mode = KfxZipMode::SkipKfxZip;
    });
    let tools = FakeToolchain::with_behaviour(
        &fixture.library,
        Behaviour {
            formats: vec!["kfx-zip", "kfx"],
            ..Behaviour::default()
        },
    );

    let summary = fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(
        summary.conversion,
        Some(PhaseCounts {
            succeeded: 1,
            skipped: 1,
            failed: 0
        })
    );
    assert!(!summary.paused);
    let log = fixture.logs("conversion_logs");
    assert!(log.contains("SKIPPED Book 1 'Book 1' by Author: KFX-ZIP file (DRM-protected)"));
    assert!(log.contains("Skipped KFX-ZIP: 1"));

    let calls = tools.calls();
    assert_eq!(calls.converted.len(), 1);
    assert_eq!(calls.converted[0].0.extension().unwrap(), "kfx");
    assert_eq!(calls.removed_formats, vec![(2, "KFX".to_string())]);
}

#[tokio::test]
async fn test_failed_kfx_zip_conversion_counts_as_drm_protected() {
    let fixture = Fixture::new(&["B0001"]);
    fixture.save_config(true, true);
    let tools = FakeToolchain::with_behaviour(
        &fixture.library,
        Behaviour {
            formats: vec!["kfx-zip"],
            failing_conversions: ["kfx-zip"].into_iter().collect(),
            ..Behaviour::default()
        },
    );

    let summary = fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(
        summary.conversion,
        Some(PhaseCounts {
            succeeded: 0,
            skipped: 0,
            failed: 1
        })
    );
    assert!(summary.paused);
    let log = fixture.logs("conversion_logs");
    assert!(log.contains("FAILED Book 1 'Book 1' by Author"));
    assert!(log.contains("Likely DRM-Protected: 1"));
    assert!(tools.calls().added_formats.is_empty());
}

fn leftover_kfx_zip(library: &Path) -> LibraryBook {
    LibraryBook {
        id: 100,
        title: "Old Copy".to_string(),
        authors: "Author".to_string(),
        formats: vec![library.join("Old Copy").join("book.kfx-zip")],
    }
}

#[tokio::test]
async fn test_declined_kfx_zip_cleanup_imports_with_duplicates() {
    let fixture = Fixture::new(&["B0001"]);
    fixture.save_config(true, true);
    let tools = FakeToolchain::with_behaviour(
        &fixture.library,
        Behaviour {
            leftover_books: vec![leftover_kfx_zip(&fixture.library)],
            ..Behaviour::default()
        },
    );
    let prompter = Arc::new(ScriptedPrompter::new(["s"]));

    let summary = fixture.run(&tools, &prompter).await.unwrap();

    assert_eq!(summary.imported_ids, vec![1]);
    assert!(prompter.questions().iter().any(|q| q == "Your choice (C/S) [C]: "));
    let calls = tools.calls();
    assert_eq!(calls.duplicates_mode, vec![true]);
    assert!(calls.removed_books.is_empty());
}

#[tokio::test]
async fn test_accepted_kfx_zip_cleanup_removes_old_books() {
    let fixture = Fixture::new(&["B0001"]);
    fixture.save_config(true, true);
    let tools = FakeToolchain::with_behaviour(
        &fixture.library,
        Behaviour {
            leftover_books: vec![leftover_kfx_zip(&fixture.library)],
            ..Behaviour::default()
        },
    );

    fixture
        .run(&tools, &Arc::new(ScriptedPrompter::new([""])))
        .await
        .unwrap();

    let calls = tools.calls();
    assert_eq!(calls.removed_books, vec![vec![100]]);
    assert_eq!(calls.duplicates_mode, vec![false]);
    // only the fresh import is converted
    assert!(calls.added_formats.iter().all(|(id, _)| *id == 1));
}

#[tokio::test]
async fn test_library_listing_failure_fails_conversion() {
    let fixture = Fixture::new(&["B0001", "B0002"]);
    fixture.save_config(true, true);
    let tools = FakeToolchain::with_behaviour(
        &fixture.library,
        Behaviour {
            list_fails: true,
            ..Behaviour::default()
        },
    );

    let summary = fixture
        .run(&tools, &Arc::new(ScriptedPrompter::default()))
        .await
        .unwrap();

    assert_eq!(summary.imported_ids, vec![1, 2]);
    assert_eq!(
        summary.conversion,
        Some(PhaseCounts {
            succeeded: 0,
            skipped: 0,
            failed: 2
        })
    );
    assert_eq!(summary.overall_line(), "0 succeeded, 0 skipped by history, 2 failed");
    assert!(summary.paused);

    let calls = tools.calls();
    assert_eq!(calls.duplicates_mode, vec![true, true]);
    assert!(calls.converted.is_empty());
}
