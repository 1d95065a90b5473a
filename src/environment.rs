use crate::config::CONFIG_FILE_NAME;
use crate::error::{KeyFinderError, Result};
use crate::phase_log::PhaseKind;
use directories::BaseDirs;
use std::fmt;
use std::path::{Component, Path, PathBuf};

pub const FALLBACK_DIR_NAME: &str = "Kindle_Key_Finder";
pub const LOCATION_MARKER_FILE: &str = "key_finder_location.txt";
pub const STAGING_PREFIX: &str = "temp_extraction";
pub const CONVERSION_STAGING_PREFIX: &str = "temp_conversion";

// Matched against the start of each lower-cased path component.
const CLOUD_MARKERS: &[(&str, &str)] = &[
    ("onedrive", "OneDrive"),
    ("dropbox", "Dropbox"),
    ("google drive", "Google Drive"),
    ("googledrive", "Google Drive"),
    ("icloud", "iCloud Drive"),
    ("box sync", "Box"),
    ("pcloud", "pCloud"),
    ("mega", "MEGA"),
];

/// Per-user OS locations the tool reads from or writes to.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPaths {
    pub home: PathBuf,
    pub local_data: PathBuf,
    pub roaming_data: PathBuf,
    pub program_files_x86: PathBuf,
}

impl UserPaths {
    pub fn from_system() -> Result<Self> {
        let dirs = BaseDirs::new().ok_or_else(|| KeyFinderError::Config {
            message: "Could not determine the user profile directory".to_string(),
        })?;

        let program_files_x86 = std::env::var_os("ProgramFiles(x86)")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("C:\\Program Files (x86)"));

        Ok(Self {
            home: dirs.home_dir().to_path_buf(),
            local_data: dirs.data_local_dir().to_path_buf(),
            roaming_data: dirs.config_dir().to_path_buf(),
            program_files_x86,
        })
    }

    /// All locations under one root, for tests and sandboxed runs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            home: root.join("home"),
            local_data: root.join("local"),
            roaming_data: root.join("roaming"),
            program_files_x86: root.join("programs"),
        }
    }

    pub fn default_content_dir(&self) -> PathBuf {
        self.home.join("Documents").join("My Kindle Content")
    }

    pub fn calibre_global_config(&self) -> PathBuf {
        self.roaming_data.join("calibre").join("global.py.json")
    }

    pub fn dedrm_config(&self) -> PathBuf {
        self.roaming_data
            .join("calibre")
            .join("plugins")
            .join("dedrm.json")
    }

    pub fn kindle_base_dir(&self) -> PathBuf {
        self.local_data.join("Amazon").join("Kindle")
    }

    pub fn kindle_appdata_dir(&self) -> PathBuf {
        self.kindle_base_dir().join("application")
    }

    pub fn kindle_program_files_dir(&self) -> PathBuf {
        self.program_files_x86.join("Amazon").join("Kindle")
    }

    pub fn fallback_workspace(&self) -> PathBuf {
        self.local_data.join(FALLBACK_DIR_NAME)
    }
}

/// The resolved working directory and the fixed layout beneath it.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    CloudSynced { provider: String },
    NotWritable { error: String },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::CloudSynced { provider } => {
                write!(f, "the folder is synced by {}", provider)
            }
            FallbackReason::NotWritable { error } => {
                write!(f, "the folder is not writable ({})", error)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceDecision {
    pub workspace: Workspace,
    pub candidate: PathBuf,
    pub fallback: Option<FallbackReason>,
}

impl Workspace {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Picks the candidate directory unless it is cloud-synced or cannot be
    /// written to, in which case the local fallback is created and used.
    pub fn resolve(candidate: &Path, user_paths: &UserPaths) -> Result<WorkspaceDecision> {
        let reason = match detect_cloud_provider(candidate) {
            Some(provider) => Some(FallbackReason::CloudSynced {
                provider: provider.to_string(),
            }),
            None => check_writable(candidate)
                .err()
                .map(|e| FallbackReason::NotWritable {
                    error: e.to_string(),
                }),
        };

        let root = match &reason {
            None => candidate.to_path_buf(),
            Some(reason) => {
                let fallback = user_paths.fallback_workspace();
                tracing::warn!(
                    candidate = %candidate.display(),
                    fallback = %fallback.display(),
                    %reason,
                    "using fallback workspace"
                );
                std::fs::create_dir_all(&fallback).map_err(|_| KeyFinderError::Permission {
                    path: fallback.display().to_string(),
                })?;
                fallback
            }
        };

        Ok(WorkspaceDecision {
            workspace: Workspace::new(root),
            candidate: candidate.to_path_buf(),
            fallback: reason,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("Keys")
    }

    pub fn voucher_key_file(&self) -> PathBuf {
        self.keys_dir().join(crate::keys::VOUCHER_KEY_FILE)
    }

    pub fn account_key_file(&self) -> PathBuf {
        self.keys_dir().join(crate::keys::ACCOUNT_KEY_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn logs_root(&self) -> PathBuf {
        self.root.join("Logs")
    }

    pub fn logs_dir(&self, phase: PhaseKind) -> PathBuf {
        self.logs_root().join(phase.dir_name())
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join(crate::history::HISTORY_FILE_NAME)
    }

    pub fn marker_file(&self) -> PathBuf {
        self.root.join(LOCATION_MARKER_FILE)
    }

    /// Fresh staging directory under the root, removed when dropped.
    pub fn staging_dir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new().prefix(prefix).tempdir_in(&self.root)?)
    }

    /// Creates the working subdirectories and clears staging directories
    /// left behind by an interrupted run.
    pub fn prepare(&self) -> Result<()> {
        for dir in [self.keys_dir(), self.backups_dir(), self.logs_root()] {
            std::fs::create_dir_all(&dir)?;
        }

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_staging =
                name.starts_with(STAGING_PREFIX) || name.starts_with(CONVERSION_STAGING_PREFIX);
            if is_staging && entry.file_type()?.is_dir() {
                tracing::debug!(dir = %entry.path().display(), "removing leftover staging directory");
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!(dir = %entry.path().display(), error = %e, "could not remove staging directory");
                }
            }
        }

        Ok(())
    }
}

impl WorkspaceDecision {
    /// Records where the working files live. Written in the chosen root and,
    /// when a fallback happened, best-effort next to the executable too.
    pub fn write_location_marker(&self) -> Result<()> {
        let mut content = format!(
            "Kindle Key Finder working files are stored in:\n{}\n",
            self.workspace.root().display()
        );
        if let Some(reason) = &self.fallback {
            content.push_str(&format!(
                "\nThe program folder {} was not used because {}.\n",
                self.candidate.display(),
                reason
            ));
        }

        std::fs::write(self.workspace.marker_file(), &content)?;

        if self.fallback.is_some() {
            let beside_exe = self.candidate.join(LOCATION_MARKER_FILE);
            if let Err(e) = std::fs::write(&beside_exe, &content) {
                tracing::debug!(path = %beside_exe.display(), error = %e, "location marker not written");
            }
        }

        Ok(())
    }
}

pub fn detect_cloud_provider(path: &Path) -> Option<&'static str> {
    path.components().find_map(|component| match component {
        Component::Normal(part) => {
            let part = part.to_string_lossy().to_lowercase();
            CLOUD_MARKERS
                .iter()
                .find(|(marker, _)| component_matches(&part, marker))
                .map(|(_, provider)| *provider)
        }
        _ => None,
    })
}

// "OneDrive - Contoso" and "Dropbox (Personal)" match, "Megan" does not.
fn component_matches(component: &str, marker: &str) -> bool {
    match component.strip_prefix(marker) {
        Some(rest) => {
            rest.is_empty()
                || rest.starts_with(&[' ', '-', '_', '(', '.'][..])
                || marker.contains("drive")
                || marker == "icloud"
        }
        None => false,
    }
}

/// Creates and removes a uniquely named subdirectory.
pub fn check_writable(dir: &Path) -> std::io::Result<()> {
    let marker = tempfile::Builder::new()
        .prefix(".write_check")
        .tempdir_in(dir)?;
    marker.close()
}

/// Directory holding the running executable.
pub fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| KeyFinderError::InvalidPath {
            path: exe.display().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_cloud_provider() {
        assert_eq!(
            detect_cloud_provider(Path::new("/Users/reader/OneDrive - Contoso/tools")),
            Some("OneDrive")
        );
        assert_eq!(
            detect_cloud_provider(Path::new("/home/reader/Dropbox/kindle")),
            Some("Dropbox")
        );
        assert_eq!(
            detect_cloud_provider(Path::new("/mnt/Google Drive/My Drive/tools")),
            Some("Google Drive")
        );
        assert_eq!(
            detect_cloud_provider(Path::new("/Users/reader/iCloudDrive/x")),
            Some("iCloud Drive")
        );
        assert_eq!(detect_cloud_provider(Path::new("/home/reader/MEGA/x")), Some("MEGA"));
        assert_eq!(detect_cloud_provider(Path::new("/home/megan/tools")), None);
        assert_eq!(detect_cloud_provider(Path::new("/opt/tools")), None);
    }

    #[test]
    fn test_resolve_uses_writable_candidate() {
        let temp_dir = TempDir::new().unwrap();
        let candidate = temp_dir.path().join("tools");
        std::fs::create_dir_all(&candidate).unwrap();
        let user_paths = UserPaths::rooted_at(temp_dir.path());

        let decision = Workspace::resolve(&candidate, &user_paths).unwrap();
        assert_eq!(decision.workspace.root(), candidate.as_path());
        assert!(decision.fallback.is_none());
        assert_eq!(std::fs::read_dir(&candidate).unwrap().count(), 0);
    }

    #[test]
    fn test_resolve_falls_back_for_cloud_folder() {
        let temp_dir = TempDir::new().unwrap();
        let candidate = temp_dir.path().join("OneDrive").join("tools");
        std::fs::create_dir_all(&candidate).unwrap();
        let user_paths = UserPaths::rooted_at(temp_dir.path());

        let decision = Workspace::resolve(&candidate, &user_paths).unwrap();
        assert_eq!(decision.workspace.root(), user_paths.fallback_workspace().as_path());
        assert!(decision.workspace.root().is_dir());
        assert_eq!(
            decision.fallback,
            Some(FallbackReason::CloudSynced {
                provider: "OneDrive".to_string()
            })
        );
    }

    #[test]
    fn test_resolve_falls_back_when_not_writable() {
        let temp_dir = TempDir::new().unwrap();
        let candidate = temp_dir.path().join("does-not-exist");
        let user_paths = UserPaths::rooted_at(temp_dir.path());

        let decision = Workspace::resolve(&candidate, &user_paths).unwrap();
        assert_eq!(decision.workspace.root(), user_paths.fallback_workspace().as_path());
        assert!(matches!(
            decision.fallback,
            Some(FallbackReason::NotWritable { .. })
        ));
    }

    #[test]
    fn test_location_marker_written() {
        let temp_dir = TempDir::new().unwrap();
        let candidate = temp_dir.path().join("Dropbox");
        std::fs::create_dir_all(&candidate).unwrap();
        let user_paths = UserPaths::rooted_at(temp_dir.path());

        let decision = Workspace::resolve(&candidate, &user_paths).unwrap();
        decision.write_location_marker().unwrap();

        let marker = std::fs::read_to_string(decision.workspace.marker_file()).unwrap();
        assert!(marker.contains(FALLBACK_DIR_NAME));
        assert!(marker.contains("Dropbox"));
        assert!(candidate.join(LOCATION_MARKER_FILE).exists());
    }

    #[test]
    fn test_prepare_creates_layout_and_clears_staging() {
        let temp_dir = TempDir::new().unwrap();
        let workspace = Workspace::new(temp_dir.path());
        let leftover = temp_dir.path().join("temp_extraction_abc123");
        std::fs::create_dir_all(leftover.join("B00TEST_EBOK")).unwrap();

        workspace.prepare().unwrap();

        assert!(workspace.keys_dir().is_dir());
        assert!(workspace.backups_dir().is_dir());
        assert!(workspace.logs_root().is_dir());
        assert!(!leftover.exists());
        assert!(workspace
            .voucher_key_file()
            .ends_with(Path::new("Keys").join("kindlekey.txt")));
    }
}
