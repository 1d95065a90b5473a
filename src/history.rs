use crate::error::Result;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const HISTORY_FILE_NAME: &str = "history.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub title: Option<String>,
}

/// Append-only record of items finished in earlier runs, one per line as
/// `<ASIN>` or `<ASIN> <title>`.
#[derive(Debug)]
pub struct History {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
    ids: HashSet<String>,
    needs_newline: bool,
}

impl History {
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut history = Self {
            path,
            entries: Vec::new(),
            ids: HashSet::new(),
            needs_newline: false,
        };

        if history.path.exists() {
            let content = std::fs::read_to_string(&history.path)?;
            history.needs_newline = !content.is_empty() && !content.ends_with('\n');
            for entry in content.lines().filter_map(parse_line) {
                if history.ids.insert(entry.id.clone()) {
                    history.entries.push(entry);
                }
            }
        }

        tracing::debug!(
            path = %history.path.display(),
            entries = history.entries.len(),
            "history loaded"
        );
        Ok(history)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Appends one line and flushes it. Returns false if the id was already
    /// recorded.
    pub fn record(&mut self, id: &str, title: Option<&str>) -> Result<bool> {
        if self.ids.contains(id) {
            return Ok(false);
        }

        let title = title
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty());
        let mut line = match &title {
            Some(title) => format!("{} {}\n", id, title),
            None => format!("{}\n", id),
        };
        if self.needs_newline {
            line.insert(0, '\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        self.needs_newline = false;

        self.ids.insert(id.to_string());
        self.entries.push(HistoryEntry {
            id: id.to_string(),
            title,
        });
        Ok(true)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_line(line: &str) -> Option<HistoryEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (id, title) = match line.split_once(char::is_whitespace) {
        Some((id, title)) => (id, Some(title.trim().to_string())),
        None => (line, None),
    };

    Some(HistoryEntry {
        id: id.to_string(),
        title: title.filter(|t| !t.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let history = History::load(temp_dir.path().join(HISTORY_FILE_NAME)).unwrap();
        assert!(history.is_empty());
        assert!(!history.contains("B00TEST"));
    }

    #[test]
    fn test_parse_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HISTORY_FILE_NAME);
        std::fs::write(
            &path,
            "# processed books\nB00AAA_EBOK The First Book\n\nB00BBB_EBOK\nB00AAA_EBOK again\n",
        )
        .unwrap();

        let history = History::load(&path).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.contains("B00AAA_EBOK"));
        assert!(history.contains("B00BBB_EBOK"));
        assert_eq!(
            history.entries()[0].title.as_deref(),
            Some("The First Book")
        );
        assert_eq!(history.entries()[1].title, None);
    }

    #[test]
    fn test_record_appends_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HISTORY_FILE_NAME);
        std::fs::write(&path, "B00AAA_EBOK\n").unwrap();

        let mut history = History::load(&path).unwrap();
        assert!(history.record("B00BBB_EBOK", Some("A Title\nWith Newline")).unwrap());
        assert!(!history.record("B00BBB_EBOK", None).unwrap());
        assert!(!history.record("B00AAA_EBOK", None).unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "B00AAA_EBOK\nB00BBB_EBOK A Title With Newline\n");

        let reloaded = History::load(&path).unwrap();
        assert!(reloaded.contains("B00BBB_EBOK"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_record_after_unterminated_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HISTORY_FILE_NAME);
        std::fs::write(&path, "B00AAA_EBOK").unwrap();

        let mut history = History::load(&path).unwrap();
        history.record("B00BBB_EBOK", None).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "B00AAA_EBOK\nB00BBB_EBOK\n");
    }
}
