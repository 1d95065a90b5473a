use crate::calibre::{self, BookId, LibraryBook};
use crate::error::{KeyFinderError, Result};
use crate::keys::KeyFilePair;
use crate::supervisor::{ProcessSupervisor, ToolCommand, ToolOutcome};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TITLE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const LIBRARY_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the pipeline asks of the outside world's binaries.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Runs the key extractor over `staging`, writing into `output`.
    async fn extract_keys(
        &self,
        extractor: &Path,
        staging: &Path,
        output: &KeyFilePair,
        timeout: Duration,
    ) -> Result<ToolOutcome>;

    /// Best-effort store lookup; `None` on any failure.
    async fn fetch_title(&self, asin: &str) -> Option<String>;

    async fn import_book(
        &self,
        book: &Path,
        library: &Path,
        allow_duplicates: bool,
        timeout: Duration,
    ) -> Result<ToolOutcome>;

    async fn list_books(&self, library: &Path) -> Result<Vec<LibraryBook>>;

    async fn remove_books(&self, library: &Path, ids: &[BookId]) -> Result<ToolOutcome>;

    async fn convert(&self, source: &Path, target: &Path, timeout: Duration) -> Result<ToolOutcome>;

    async fn add_format(&self, library: &Path, id: BookId, file: &Path) -> Result<ToolOutcome>;

    async fn remove_format(&self, library: &Path, id: BookId, format: &str) -> Result<ToolOutcome>;
}

/// Subprocess-backed toolchain. Calibre's programs are looked up on PATH
/// unless overridden.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    supervisor: ProcessSupervisor,
    calibredb: PathBuf,
    ebook_convert: PathBuf,
    fetch_metadata: PathBuf,
}

impl ExternalTools {
    pub fn new() -> Self {
        Self {
            supervisor: ProcessSupervisor::new(),
            calibredb: PathBuf::from(calibre::CALIBREDB),
            ebook_convert: PathBuf::from(calibre::EBOOK_CONVERT),
            fetch_metadata: PathBuf::from(calibre::FETCH_METADATA),
        }
    }

    pub fn with_calibredb<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.calibredb = program.into();
        self
    }

    pub fn with_ebook_convert<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.ebook_convert = program.into();
        self
    }

    pub fn with_fetch_metadata<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.fetch_metadata = program.into();
        self
    }

    async fn run(&self, command: ToolCommand, timeout: Duration) -> Result<ToolOutcome> {
        self.supervisor.run(&command, timeout).await
    }
}

impl Default for ExternalTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Toolchain for ExternalTools {
    async fn extract_keys(
        &self,
        extractor: &Path,
        staging: &Path,
        output: &KeyFilePair,
        timeout: Duration,
    ) -> Result<ToolOutcome> {
        let command = ToolCommand::new(extractor)
            .arg(staging.as_os_str())
            .arg(output.voucher.as_os_str())
            .arg(output.account.as_os_str());
        self.run(command, timeout).await
    }

    async fn fetch_title(&self, asin: &str) -> Option<String> {
        let command = calibre::fetch_metadata_command(&self.fetch_metadata, asin);
        match self.run(command, TITLE_LOOKUP_TIMEOUT).await {
            Ok(ToolOutcome::Completed(output)) if output.success() => {
                calibre::parse_metadata_title(&output.stdout)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(asin, error = %e, "title lookup unavailable");
                None
            }
        }
    }

    async fn import_book(
        &self,
        book: &Path,
        library: &Path,
        allow_duplicates: bool,
        timeout: Duration,
    ) -> Result<ToolOutcome> {
        let command = calibre::add_book_command(&self.calibredb, book, library, allow_duplicates);
        self.run(command, timeout).await
    }

    async fn list_books(&self, library: &Path) -> Result<Vec<LibraryBook>> {
        let command = calibre::list_books_command(&self.calibredb, library);
        match self.run(command, LIBRARY_COMMAND_TIMEOUT).await? {
            ToolOutcome::Completed(output) if output.success() => calibre::parse_book_list(&output.stdout),
            ToolOutcome::Completed(output) => Err(KeyFinderError::InvalidLibrary {
                path: library.display().to_string(),
                reason: output.error_text(),
            }),
            ToolOutcome::TimedOut { after } => Err(KeyFinderError::Timeout {
                seconds: after.as_secs(),
            }),
        }
    }

    async fn remove_books(&self, library: &Path, ids: &[BookId]) -> Result<ToolOutcome> {
        let command = calibre::remove_books_command(&self.calibredb, library, ids);
        self.run(command, LIBRARY_COMMAND_TIMEOUT).await
    }

    async fn convert(&self, source: &Path, target: &Path, timeout: Duration) -> Result<ToolOutcome> {
        let command = calibre::convert_command(&self.ebook_convert, source, target);
        self.run(command, timeout).await
    }

    async fn add_format(&self, library: &Path, id: BookId, file: &Path) -> Result<ToolOutcome> {
        let command = calibre::add_format_command(&self.calibredb, library, id, file);
        self.run(command, LIBRARY_COMMAND_TIMEOUT).await
    }

    async fn remove_format(&self, library: &Path, id: BookId, format: &str) -> Result<ToolOutcome> {
        let command = calibre::remove_format_command(&self.calibredb, library, id, format);
        self.run(command, LIBRARY_COMMAND_TIMEOUT).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_import_times_out_on_hung_calibredb() {
        let temp_dir = TempDir::new().unwrap();
        let tools = ExternalTools::new().with_calibredb(script(temp_dir.path(), "calibredb", "sleep 30"));

        let started = std::time::Instant::now();
        let outcome = tools
            .import_book(
                Path::new("book.azw"),
                temp_dir.path(),
                false,
                Duration::from_millis(300),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ToolOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_list_books_parses_output() {
        let temp_dir = TempDir::new().unwrap();
        let body = r#"echo '[{"id": 7, "title": "Dune", "authors": "Frank Herbert", "formats": ["/lib/Dune.kfx"]}]'"#;
        let tools = ExternalTools::new().with_calibredb(script(temp_dir.path(), "calibredb", body));

        let books = tools.list_books(temp_dir.path()).await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].id, 7);
    }

    #[tokio::test]
    async fn test_convert_passes_epub_options() {
        let temp_dir = TempDir::new().unwrap();
        let args_file = temp_dir.path().join("args.txt");
        let body = format!("echo \"$@\" > '{}'\ntouch \"$2\"", args_file.display());
        let tools = ExternalTools::new().with_ebook_convert(script(temp_dir.path(), "ebook-convert", &body));

        let source = temp_dir.path().join("book.kfx");
        let target = temp_dir.path().join("book.epub");
        let outcome = tools.convert(&source, &target, Duration::from_secs(10)).await.unwrap();

        let ToolOutcome::Completed(output) = outcome else {
            panic!("conversion timed out");
        };
        assert!(output.success());
        assert!(target.exists());
        let args = fs::read_to_string(&args_file).unwrap();
        assert!(args.contains("--output-profile=tablet"));
        assert!(args.contains("--epub-version=3"));
    }

    #[tokio::test]
    async fn test_fetch_title() {
        let temp_dir = TempDir::new().unwrap();
        let lookup = script(temp_dir.path(), "fetch-ebook-metadata", "echo 'Title               : Dune'");
        let tools = ExternalTools::new().with_fetch_metadata(lookup);
        assert_eq!(tools.fetch_title("B00AAA").await.as_deref(), Some("Dune"));

        let missing = ExternalTools::new().with_fetch_metadata(temp_dir.path().join("absent"));
        assert_eq!(missing.fetch_title("B00AAA").await, None);
    }
}
