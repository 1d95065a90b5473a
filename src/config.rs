use crate::error::{KeyFinderError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Version tag written into every saved configuration. A file carrying any
/// other tag is treated as stale and sends the user back through the wizard.
pub const SCRIPT_VERSION: &str = "2025.11.08.JH";

pub const CONFIG_FILE_NAME: &str = "key_finder_config.json";

const DEFAULT_ITEM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONVERSION_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub script_version: String,
    pub last_updated: Option<String>,
    pub kindle_content_path: PathBuf,
    pub hide_sensitive_info: bool,
    pub fetch_book_titles: bool,
    pub clear_screen_between_phases: bool,
    pub skip_phase_pauses: bool,
    pub skip_processed_books: bool,
    pub per_item_timeout_secs: u64,
    /// Bound on each `ebook-convert` step.
    pub conversion_timeout_secs: u64,
    pub calibre_import: CalibreImportConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibreImportConfig {
    pub enabled: bool,
    pub library_path: Option<PathBuf>,
    pub convert_to_epub: bool,
    pub kfx_zip_mode: KfxZipMode,
    pub source_file_management: SourceFileManagement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KfxZipMode {
    #[default]
    ConvertAll,
    SkipKfxZip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFileManagement {
    #[default]
    KeepBoth,
    DeleteSource,
    DeleteKfxZipOnly,
}

impl fmt::Display for KfxZipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KfxZipMode::ConvertAll => write!(f, "Convert all formats"),
            KfxZipMode::SkipKfxZip => write!(f, "Skip KFX-ZIP books"),
        }
    }
}

impl fmt::Display for SourceFileManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFileManagement::KeepBoth => write!(f, "Keep source and EPUB"),
            SourceFileManagement::DeleteSource => write!(f, "Delete source after conversion"),
            SourceFileManagement::DeleteKfxZipOnly => write!(f, "Delete KFX-ZIP sources only"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            script_version: SCRIPT_VERSION.to_string(),
            last_updated: None,
            kindle_content_path: PathBuf::new(),
            hide_sensitive_info: true,
            fetch_book_titles: false,
            clear_screen_between_phases: true,
            skip_phase_pauses: false,
            skip_processed_books: true,
            per_item_timeout_secs: DEFAULT_ITEM_TIMEOUT_SECS,
            conversion_timeout_secs: DEFAULT_CONVERSION_TIMEOUT_SECS,
            calibre_import: CalibreImportConfig::default(),
        }
    }
}

impl Default for CalibreImportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            library_path: None,
            convert_to_epub: true,
            kfx_zip_mode: KfxZipMode::default(),
            source_file_management: SourceFileManagement::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.kindle_content_path.as_os_str().is_empty() {
            return Err(KeyFinderError::Config {
                message: "Kindle content path must be set".to_string(),
            });
        }

        if self.per_item_timeout_secs == 0 {
            return Err(KeyFinderError::Config {
                message: "Per-item timeout must be greater than 0".to_string(),
            });
        }

        if self.conversion_timeout_secs == 0 {
            return Err(KeyFinderError::Config {
                message: "Conversion timeout must be greater than 0".to_string(),
            });
        }

        if self.calibre_import.enabled && self.calibre_import.library_path.is_none() {
            return Err(KeyFinderError::Config {
                message: "Calibre import is enabled but no library path is set".to_string(),
            });
        }

        Ok(())
    }

    pub fn per_item_timeout(&self) -> Duration {
        Duration::from_secs(self.per_item_timeout_secs)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    /// Checks the saved paths against the disk. A content folder that has
    /// gone away makes the saved configuration unusable.
    pub fn check_paths(&self) -> Result<()> {
        if !self.kindle_content_path.is_dir() {
            return Err(KeyFinderError::Config {
                message: format!(
                    "Kindle content folder no longer exists: {}",
                    self.kindle_content_path.display()
                ),
            });
        }
        Ok(())
    }

    /// Library path, present only when import is switched on.
    pub fn import_library(&self) -> Option<&Path> {
        if self.calibre_import.enabled {
            self.calibre_import.library_path.as_deref()
        } else {
            None
        }
    }

    /// Label/value rows used by the wizard review and the saved-config screen.
    pub fn summary_rows(&self) -> Vec<(String, String)> {
        let yes_no = |flag: bool| if flag { "Yes" } else { "No" }.to_string();
        let mut rows = vec![
            (
                "Kindle Content Path".to_string(),
                self.kindle_content_path.display().to_string(),
            ),
            ("Hide Sensitive Info".to_string(), yes_no(self.hide_sensitive_info)),
            ("Fetch Book Titles".to_string(), yes_no(self.fetch_book_titles)),
            (
                "Clear Screen Between Phases".to_string(),
                yes_no(self.clear_screen_between_phases),
            ),
            ("Skip Phase Pauses".to_string(), yes_no(self.skip_phase_pauses)),
            (
                "Skip Processed Books".to_string(),
                yes_no(self.skip_processed_books),
            ),
            (
                "Calibre Auto-Import".to_string(),
                if self.calibre_import.enabled { "Enabled" } else { "Disabled" }.to_string(),
            ),
        ];

        if self.calibre_import.enabled {
            let import = &self.calibre_import;
            rows.push((
                "Calibre Library".to_string(),
                import
                    .library_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string()),
            ));
            rows.push(("Convert to EPUB".to_string(), yes_no(import.convert_to_epub)));
            if import.convert_to_epub {
                rows.push(("KFX-ZIP Handling".to_string(), import.kfx_zip_mode.to_string()));
                rows.push((
                    "Source Files".to_string(),
                    import.source_file_management.to_string(),
                ));
            }
        }

        rows
    }
}

/// Result of looking for a saved configuration. Anything other than
/// `Ready` means the wizard has to run.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigState {
    Ready(Config),
    Missing,
    Stale { found: Option<String> },
    Unreadable { reason: String },
}

impl ConfigState {
    pub fn wizard_required(&self) -> bool {
        !matches!(self, ConfigState::Ready(_))
    }

    pub fn into_config(self) -> Option<Config> {
        match self {
            ConfigState::Ready(config) => Some(config),
            _ => None,
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ConfigState {
        if !self.path.exists() {
            return ConfigState::Missing;
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                return ConfigState::Unreadable {
                    reason: format!("Failed to read {}: {}", self.path.display(), e),
                }
            }
        };

        let raw: Value = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                return ConfigState::Unreadable {
                    reason: format!("Failed to parse {}: {}", self.path.display(), e),
                }
            }
        };

        // The version tag is checked on the raw document so a missing tag
        // cannot be filled in by serde defaults.
        let found = raw
            .get("script_version")
            .and_then(Value::as_str)
            .map(str::to_string);
        if found.as_deref() != Some(SCRIPT_VERSION) {
            tracing::info!(?found, expected = SCRIPT_VERSION, "saved configuration is stale");
            return ConfigState::Stale { found };
        }

        let config: Config = match serde_json::from_value(raw) {
            Ok(config) => config,
            Err(e) => {
                return ConfigState::Unreadable {
                    reason: format!("Invalid configuration values: {}", e),
                }
            }
        };

        match config.validate() {
            Ok(()) => ConfigState::Ready(config),
            Err(e) => ConfigState::Unreadable {
                reason: e.to_string(),
            },
        }
    }

    /// Stamps the version and time and overwrites the file.
    pub fn save(&self, config: &mut Config) -> Result<()> {
        config.script_version = SCRIPT_VERSION.to_string();
        config.last_updated = Some(chrono::Local::now().to_rfc3339());

        let content = serde_json::to_string_pretty(config).map_err(|e| KeyFinderError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&self.path, content).map_err(|e| KeyFinderError::Config {
            message: format!("Failed to write config file {}: {}", self.path.display(), e),
        })?;

        tracing::debug!(path = %self.path.display(), "configuration saved");
        Ok(())
    }

    pub fn delete(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path)?;
        Ok(true)
    }
}
