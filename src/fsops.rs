use crate::error::{KeyFinderError, Result};
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use walkdir::WalkDir;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

/// Copies a directory tree, keeping file modification times. The
/// extractor only sees these copies, never the live Kindle folders.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<CopyStats> {
    if !source.is_dir() {
        return Err(KeyFinderError::InvalidPath {
            path: format!("Source is not a directory: {}", source.display()),
        });
    }

    let mut stats = CopyStats::default();
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| KeyFinderError::Io(e.into()))?;
        let relative = match entry.path().strip_prefix(source) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            stats.bytes += copy_file(entry.path(), &target)?;
            stats.files += 1;
        }
    }

    Ok(stats)
}

/// Buffered copy that carries the source's modification time over.
pub fn copy_file(source: &Path, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, fs::File::open(source)?);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, fs::File::create(dest)?);

    let mut total_bytes = 0u64;
    let mut buffer = vec![0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read])?;
        total_bytes += bytes_read as u64;
    }
    writer.flush()?;
    drop(writer);

    preserve_mtime(source, dest);
    Ok(total_bytes)
}

/// Copies the modification time of `source` onto `dest`. Returns whether it
/// was applied.
fn preserve_mtime(source: &Path, dest: &Path) -> bool {
    let modified = match fs::metadata(source).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) => {
            tracing::debug!(path = %source.display(), error = %e, "source modification time unavailable");
            return false;
        }
    };
    match filetime::set_file_mtime(dest, filetime::FileTime::from_system_time(modified)) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(path = %dest.display(), error = %e, "could not set modification time");
            false
        }
    }
}

/// Removes a directory tree, logging rather than failing.
pub fn remove_dir_quietly(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    match fs::remove_dir_all(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not remove directory");
            false
        }
    }
}
