use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyFinderError {
    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Key extractor not found: {path}")]
    ExtractorNotFound { path: String },

    #[error("Kindle for PC installation not found")]
    KindleNotFound { searched: Vec<String> },

    #[error("Invalid Calibre library: {path}")]
    InvalidLibrary { path: String, reason: String },

    #[error("Failed to launch {program}: {source}")]
    ToolLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process listing failed: {message}")]
    ProcessList { message: String },

    #[error("DeDRM plugin configuration failed: {message}")]
    Plugin { message: String },

    #[error("Key file error: {message}")]
    KeyFile { message: String },

    #[error("Input error: {message}")]
    Input { message: String },

    #[error("Permission denied: {path}")]
    Permission { path: String },

    #[error("This tool only runs on Windows")]
    UnsupportedPlatform,

    #[error("Operation was cancelled by user")]
    Cancelled,

    #[error("Stopped at user request")]
    UserQuit,

    #[error("Operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Path validation failed: {path}")]
    InvalidPath { path: String },
}

pub trait UserFriendlyError {
    fn user_message(&self) -> String;
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for KeyFinderError {
    fn user_message(&self) -> String {
        match self {
            KeyFinderError::Config { message } => {
                format!("Configuration error: {}", message)
            }
            KeyFinderError::ExtractorNotFound { path } => {
                format!("KFXKeyExtractor28.exe not found at: {}", path)
            }
            KeyFinderError::KindleNotFound { searched } => {
                format!(
                    "Kindle for PC is not installed. Searched: {}",
                    searched.join(", ")
                )
            }
            KeyFinderError::InvalidLibrary { path, reason } => {
                format!("Invalid Calibre library at {}: {}", path, reason)
            }
            KeyFinderError::ToolLaunch { program, source } => {
                format!("Could not start {}: {}", program, source)
            }
            KeyFinderError::Plugin { message } => {
                format!("DeDRM plugin configuration failed: {}", message)
            }
            KeyFinderError::Permission { path } => {
                format!("Permission denied accessing: {}", path)
            }
            KeyFinderError::Cancelled => "Operation was cancelled by user".to_string(),
            KeyFinderError::UserQuit => "Script stopped at your request".to_string(),
            KeyFinderError::Timeout { seconds } => {
                format!("Operation timed out after {} seconds", seconds)
            }
            KeyFinderError::InvalidPath { path } => {
                format!("Invalid file path: {}", path)
            }
            _ => self.to_string(),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            KeyFinderError::ExtractorNotFound { .. } => Some(
                "Place KFXKeyExtractor28.exe in the same folder as this program and run it again."
                    .to_string(),
            ),
            KeyFinderError::KindleNotFound { .. } => Some(
                "Install Kindle for PC, download your books once, then run this tool again."
                    .to_string(),
            ),
            KeyFinderError::InvalidLibrary { .. } => Some(
                "Open Calibre once to create the library, or run the configuration wizard again."
                    .to_string(),
            ),
            KeyFinderError::ToolLaunch { .. } => Some(
                "Make sure Calibre is installed and its command-line tools are on PATH."
                    .to_string(),
            ),
            KeyFinderError::Plugin { .. } => Some(
                "Close Calibre completely and check that the DeDRM plugin is installed.".to_string(),
            ),
            KeyFinderError::Config { .. } => Some(
                "Delete key_finder_config.json and run the configuration wizard again.".to_string(),
            ),
            KeyFinderError::Permission { .. } => Some(
                "Ensure you have the necessary read/write permissions for the target directory."
                    .to_string(),
            ),
            KeyFinderError::UnsupportedPlatform => Some(
                "Kindle for PC and KFXKeyExtractor28.exe are Windows programs; run this on Windows."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyFinderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_friendly_messages() {
        let error = KeyFinderError::ExtractorNotFound {
            path: "C:\\tools\\KFXKeyExtractor28.exe".to_string(),
        };
        assert!(error.user_message().contains("KFXKeyExtractor28.exe"));
        assert!(error.suggestion().is_some());
    }

    #[test]
    fn test_fallback_message_uses_display() {
        let error = KeyFinderError::KeyFile {
            message: "bad json".to_string(),
        };
        assert_eq!(error.user_message(), "Key file error: bad json");
        assert!(error.suggestion().is_none());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error = KeyFinderError::from(io);
        assert!(matches!(error, KeyFinderError::Io(_)));
    }
}
