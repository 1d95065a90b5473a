use crate::environment::UserPaths;
use crate::error::{KeyFinderError, Result};
use crate::fsops::{copy_file, copy_tree, remove_dir_quietly};
use crate::ui::{OutputFormatter, Prompter};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

pub const EXTRACTOR_EXE: &str = "KFXKeyExtractor28.exe";
pub const KINDLE_EXE: &str = "Kindle.exe";
pub const TEMP_MARKER: &str = "TEMP.txt";
pub const UPDATES_FILE: &str = "updates";

const BOOK_EXTENSIONS: [&str; 4] = ["azw", "kfx", "kfx-zip", "azw3"];

/// Returns the first candidate that holds the extractor.
pub fn locate_extractor(candidates: &[PathBuf]) -> Result<PathBuf> {
    for dir in candidates {
        let path = dir.join(EXTRACTOR_EXE);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "extractor found");
            return Ok(path);
        }
    }

    let path = candidates
        .first()
        .map(|dir| dir.join(EXTRACTOR_EXE))
        .unwrap_or_else(|| PathBuf::from(EXTRACTOR_EXE));
    Err(KeyFinderError::ExtractorNotFound {
        path: path.display().to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallLayout {
    AppData(PathBuf),
    ProgramFiles(PathBuf),
    Both { appdata: PathBuf, program_files: PathBuf },
    Missing { searched: Vec<PathBuf> },
}

pub fn detect_installation(paths: &UserPaths) -> InstallLayout {
    let appdata = paths.kindle_appdata_dir();
    let program_files = paths.kindle_program_files_dir();
    let in_appdata = appdata.join(KINDLE_EXE).is_file() && !appdata.join(TEMP_MARKER).exists();
    let in_program_files = program_files.join(KINDLE_EXE).is_file();

    match (in_appdata, in_program_files) {
        (true, true) => InstallLayout::Both {
            appdata,
            program_files,
        },
        (true, false) => InstallLayout::AppData(appdata),
        (false, true) => InstallLayout::ProgramFiles(program_files),
        (false, false) => InstallLayout::Missing {
            searched: vec![appdata.join(KINDLE_EXE), program_files.join(KINDLE_EXE)],
        },
    }
}

/// Removes a temporary AppData copy left behind by an interrupted run.
/// Only directories carrying the marker file are touched.
pub fn cleanup_leftover_temp_copy(paths: &UserPaths) -> bool {
    let dir = paths.kindle_appdata_dir();
    if !dir.join(TEMP_MARKER).exists() {
        return false;
    }
    tracing::info!(dir = %dir.display(), "removing leftover temporary Kindle copy");
    remove_dir_quietly(&dir)
}

/// Copies a Program Files installation into AppData and marks it as ours.
pub fn create_temp_copy(source: &Path, dest: &Path) -> Result<()> {
    if let Err(e) = copy_tree(source, dest) {
        remove_dir_quietly(dest);
        return Err(e);
    }

    let marker = format!(
        "Temporary Kindle copy for key extraction\nCreated: {}\nSource: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        source.display()
    );
    if let Err(e) = fs::write(dest.join(TEMP_MARKER), marker) {
        remove_dir_quietly(dest);
        return Err(e.into());
    }
    Ok(())
}

/// The Kindle directory the extractor runs from, plus whatever this run
/// put there. Cleanup happens in `finish`, or on drop if the run bails out.
#[derive(Debug)]
pub struct KindleSession {
    dir: PathBuf,
    extractor: PathBuf,
    temp_copy: bool,
    extractor_copied: bool,
    released: bool,
}

impl KindleSession {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Extractor path inside the Kindle directory.
    pub fn extractor(&self) -> &Path {
        &self.extractor
    }

    pub fn is_temp_copy(&self) -> bool {
        self.temp_copy
    }

    pub fn finish(mut self, output: &OutputFormatter) {
        let (extractor_removed, copy_removed) = self.release();
        if extractor_removed {
            output.success("Extractor cleaned up from Kindle folder");
        }
        if copy_removed {
            output.success("Temporary Kindle copy removed");
        }
    }

    fn release(&mut self) -> (bool, bool) {
        if self.released {
            return (false, false);
        }
        self.released = true;

        let mut extractor_removed = false;
        if self.extractor_copied && !self.temp_copy {
            match fs::remove_file(&self.extractor) {
                Ok(()) => extractor_removed = true,
                Err(e) => {
                    tracing::warn!(path = %self.extractor.display(), error = %e, "could not remove extractor copy")
                }
            }
        }

        let copy_removed = self.temp_copy
            && self.dir.join(TEMP_MARKER).exists()
            && remove_dir_quietly(&self.dir);
        (extractor_removed, copy_removed)
    }
}

impl Drop for KindleSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Picks the installation the extractor will use and stages the extractor
/// next to `Kindle.exe`. The extractor only works from the AppData
/// location, so a Program Files install is copied there for the run.
pub fn prepare_session(
    paths: &UserPaths,
    extractor: &Path,
    prompter: &dyn Prompter,
    output: &OutputFormatter,
) -> Result<KindleSession> {
    output.step("Searching for Kindle installation...");

    let (dir, temp_copy) = match detect_installation(paths) {
        InstallLayout::AppData(dir) => {
            output.success(&format!("Found Kindle at: {}", dir.display()));
            (dir, false)
        }
        InstallLayout::ProgramFiles(source) => {
            output.success(&format!("Found Kindle at: {}", source.display()));
            output.warning("Kindle is installed in Program Files (Global mode)");
            (stage_temp_copy(paths, &source, output)?, true)
        }
        InstallLayout::Both {
            appdata,
            program_files,
        } => {
            output.warning("Found Kindle.exe in BOTH locations:");
            output.detail(&format!("1. {}", appdata.display()));
            output.detail(&format!("2. {}", program_files.display()));
            output.info("[C] Continue - Delete AppData copy and use the Program Files installation");
            output.info("[Q] Quit - Exit and resolve manually");

            if prompter.choose("Your choice (C/Q): ", &['C', 'Q'])? == 'Q' {
                return Err(KeyFinderError::UserQuit);
            }
            fs::remove_dir_all(&appdata).map_err(|e| KeyFinderError::Permission {
                path: format!("{} ({})", appdata.display(), e),
            })?;
            output.success("AppData copy deleted");
            (stage_temp_copy(paths, &program_files, output)?, true)
        }
        InstallLayout::Missing { searched } => {
            return Err(KeyFinderError::KindleNotFound {
                searched: searched.iter().map(|p| p.display().to_string()).collect(),
            });
        }
    };

    let mut session = KindleSession {
        extractor: dir.join(EXTRACTOR_EXE),
        dir,
        temp_copy,
        extractor_copied: false,
        released: false,
    };

    if !session.extractor.exists() {
        copy_file(extractor, &session.extractor)?;
        session.extractor_copied = true;
    }
    Ok(session)
}

fn stage_temp_copy(paths: &UserPaths, source: &Path, output: &OutputFormatter) -> Result<PathBuf> {
    let dest = paths.kindle_appdata_dir();
    output.step("Creating temporary Kindle copy...");
    output.detail(&format!("Copying from: {}", source.display()));
    output.detail(&format!("Copying to: {}", dest.display()));
    create_temp_copy(source, &dest)?;
    output.success("Kindle folder copied; it will be deleted after extraction");
    Ok(dest)
}

/// Drops the `updates` file that stops Kindle for PC from updating itself.
/// Does nothing when Kindle was never installed for this user.
pub fn prevent_auto_update(paths: &UserPaths) -> Result<Option<PathBuf>> {
    let base = paths.kindle_base_dir();
    if !base.is_dir() {
        return Ok(None);
    }

    let path = base.join(UPDATES_FILE);
    fs::write(
        &path,
        "This file prevents Kindle for PC from auto-updating.\n\
         Created by Kindle Key Finder script.\n\
         Safe to delete if you want to allow auto-updates.\n",
    )?;
    Ok(Some(path))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookFolder {
    pub asin: String,
    pub folder_name: String,
    pub path: PathBuf,
}

/// `B00N17VVZC_EBOK` -> `B00N17VVZC`.
pub fn asin_from_name(name: &str) -> &str {
    name.split('_').next().unwrap_or(name)
}

/// Book folders directly under the content directory, sorted by name.
pub fn scan_content_dir(dir: &Path) -> Result<Vec<BookFolder>> {
    let mut books = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let files = match fs::read_dir(&path) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(folder = %path.display(), error = %e, "unreadable book folder");
                continue;
            }
        };
        let has_book = files
            .filter_map(|f| f.ok())
            .any(|f| f.path().is_file() && is_book_file(&f.path()));
        if !has_book {
            continue;
        }

        let folder_name = entry.file_name().to_string_lossy().into_owned();
        books.push(BookFolder {
            asin: asin_from_name(&folder_name).to_string(),
            folder_name,
            path,
        });
    }

    books.sort_by(|a, b| a.folder_name.cmp(&b.folder_name));
    Ok(books)
}

/// Every `.azw` below `dir` whose ASIN is not excluded, as `(asin, path)`.
pub fn find_import_files<F>(dir: &Path, mut exclude: F) -> Vec<(String, PathBuf)>
where
    F: FnMut(&str) -> bool,
{
    let mut files: Vec<(String, PathBuf)> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| has_extension(e.path(), "azw"))
        .filter_map(|e| {
            let stem = e.path().file_stem()?.to_string_lossy().into_owned();
            let asin = asin_from_name(&stem).to_string();
            Some((asin, e.into_path()))
        })
        .filter(|(asin, _)| !exclude(asin))
        .collect();

    files.sort_by(|a, b| a.1.cmp(&b.1));
    files
}

fn is_book_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(OsStr::to_str) else {
        return false;
    };
    let name = name.to_lowercase();
    BOOK_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(&format!(".{}", ext)))
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}
