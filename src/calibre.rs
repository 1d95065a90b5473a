use crate::error::{KeyFinderError, Result};
use crate::supervisor::{ToolCommand, ToolOutput};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

pub const CALIBREDB: &str = "calibredb";
pub const EBOOK_CONVERT: &str = "ebook-convert";
pub const FETCH_METADATA: &str = "fetch-ebook-metadata";

pub type BookId = u64;

const EPUB_OPTIONS: [&str; 4] = [
    "--input-profile=default",
    "--output-profile=tablet",
    "--no-svg-cover",
    "--epub-version=3",
];
const INTERMEDIATE_OPTIONS: [&str; 2] = ["--input-profile=default", "--output-profile=tablet"];

fn library_arg(library: &Path) -> String {
    format!("--library-path={}", library.display())
}

pub fn add_book_command(program: &Path, book: &Path, library: &Path, allow_duplicates: bool) -> ToolCommand {
    let mut command = ToolCommand::new(program).arg("add");
    if allow_duplicates {
        command = command.arg("-d");
    }
    command
        .arg("-1")
        .arg(book.as_os_str())
        .arg(library_arg(library))
}

pub fn list_books_command(program: &Path, library: &Path) -> ToolCommand {
    ToolCommand::new(program).args([
        "list".to_string(),
        "--for-machine".to_string(),
        "--fields=title,authors,formats".to_string(),
        library_arg(library),
    ])
}

pub fn remove_books_command(program: &Path, library: &Path, ids: &[BookId]) -> ToolCommand {
    let ids = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
    ToolCommand::new(program).args(["remove".to_string(), ids, "--permanent".to_string(), library_arg(library)])
}

pub fn add_format_command(program: &Path, library: &Path, id: BookId, file: &Path) -> ToolCommand {
    ToolCommand::new(program)
        .arg("add_format")
        .arg(id.to_string())
        .arg(file.as_os_str())
        .arg(library_arg(library))
}

pub fn remove_format_command(program: &Path, library: &Path, id: BookId, format: &str) -> ToolCommand {
    ToolCommand::new(program)
        .arg("remove_format")
        .arg(id.to_string())
        .arg(format.to_uppercase())
        .arg(library_arg(library))
}

/// `ebook-convert`; EPUB targets get the full option set, the MOBI
/// intermediate only the profiles.
pub fn convert_command(program: &Path, source: &Path, target: &Path) -> ToolCommand {
    let is_epub = target
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("epub"));
    let options: &[&str] = if is_epub { &EPUB_OPTIONS } else { &INTERMEDIATE_OPTIONS };
    ToolCommand::new(program)
        .arg(source.as_os_str())
        .arg(target.as_os_str())
        .args(options.iter().copied())
}

pub fn fetch_metadata_command(program: &Path, asin: &str) -> ToolCommand {
    ToolCommand::new(program).args(["-I".to_string(), format!("asin:{}", asin)])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportResult {
    Imported { book_id: BookId },
    Duplicate { title: Option<String> },
    Failed { error: String },
}

pub fn parse_add_output(output: &ToolOutput) -> ImportResult {
    if output.success() {
        for line in output.stdout.lines() {
            if let Some((_, ids)) = line.split_once("Added book ids:") {
                let first = ids.split(',').next().unwrap_or_default().trim();
                if let Ok(book_id) = first.parse() {
                    return ImportResult::Imported { book_id };
                }
            }
        }
    }

    // calibredb reports skipped duplicates on either stream
    for text in [&output.stderr, &output.stdout] {
        if let Some(title) = duplicate_title(text) {
            return ImportResult::Duplicate { title };
        }
    }

    let error = if output.stderr.trim().is_empty() {
        output.error_text()
    } else {
        output.stderr.trim().to_string()
    };
    ImportResult::Failed { error }
}

// Some(None) when the duplicate notice has no title line after it.
fn duplicate_title(text: &str) -> Option<Option<String>> {
    let mut lines = text.lines();
    lines.find(|line| line.contains("already exist in the database"))?;
    Some(
        lines
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('('))
            .map(str::to_string),
    )
}

/// First result title from `fetch-ebook-metadata` output.
pub fn parse_metadata_title(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "Title" {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Kfx,
    Azw,
    Azw3,
    KfxZip,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".kfx-zip") {
            Some(SourceKind::KfxZip)
        } else if name.ends_with(".kfx") {
            Some(SourceKind::Kfx)
        } else if name.ends_with(".azw3") {
            Some(SourceKind::Azw3)
        } else if name.ends_with(".azw") {
            Some(SourceKind::Azw)
        } else {
            None
        }
    }

    /// Format name as calibredb knows it.
    pub fn format_name(&self) -> &'static str {
        match self {
            SourceKind::Kfx => "KFX",
            SourceKind::Azw => "AZW",
            SourceKind::Azw3 => "AZW3",
            SourceKind::KfxZip => "KFX-ZIP",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LibraryBook {
    pub id: BookId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub authors: String,
    #[serde(default)]
    pub formats: Vec<PathBuf>,
}

impl LibraryBook {
    /// First Kindle-format file attached to the book.
    pub fn source_file(&self) -> Option<SourceFile> {
        self.formats.iter().find_map(|path| {
            SourceKind::from_path(path).map(|kind| SourceFile {
                path: path.clone(),
                kind,
            })
        })
    }

    pub fn has_kfx_zip(&self) -> bool {
        self.formats
            .iter()
            .any(|p| SourceKind::from_path(p) == Some(SourceKind::KfxZip))
    }
}

pub fn parse_book_list(stdout: &str) -> Result<Vec<LibraryBook>> {
    // calibredb may print warnings before the JSON array
    let start = stdout.find('[').ok_or_else(|| KeyFinderError::Config {
        message: "calibredb list returned no book data".to_string(),
    })?;
    Ok(serde_json::from_str(&stdout[start..])?)
}

/// A library is valid when its directory holds `metadata.db`.
pub fn validate_library(path: &Path) -> std::result::Result<(), String> {
    if !path.is_dir() {
        return Err("Library path does not exist".to_string());
    }
    if !path.join("metadata.db").is_file() {
        return Err("Not a valid Calibre library (metadata.db not found)".to_string());
    }
    Ok(())
}

/// Library Calibre last opened, from its `global.py.json`.
pub fn last_used_library(global_config: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(global_config).ok()?;
    let config: Value = match serde_json::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %global_config.display(), error = %e, "could not read Calibre config");
            return None;
        }
    };
    config
        .get("library_path")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}
