use crate::error::{KeyFinderError, Result};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const KINDLE_KEY_NAME: &str = "kindlekey";
const BACKUP_PREFIX: &str = "dedrm_backup";

/// Structure the DeDRM plugin writes on first start.
pub fn default_plugin_config() -> Value {
    json!({
        "adeptkeys": {},
        "adobe_pdf_passphrases": [],
        "adobewineprefix": "",
        "androidkeys": {},
        "bandnkeys": {},
        "configured": true,
        "deobfuscate_fonts": true,
        "ereaderkeys": {},
        "kindleextrakeyfile": "",
        "kindlekeys": {},
        "kindlewineprefix": "",
        "lcp_passphrases": [],
        "pids": [],
        "remove_watermarks": false,
        "serials": []
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginSummary {
    pub kindle_key_count: usize,
    pub extra_key_file: String,
    pub kindle_key: Option<Value>,
}

/// Reads and rewrites `dedrm.json`, keeping a timestamped backup of the
/// previous file.
pub struct PluginConfigurator {
    config_path: PathBuf,
    backups_dir: PathBuf,
}

impl PluginConfigurator {
    pub fn new<C: Into<PathBuf>, B: Into<PathBuf>>(config_path: C, backups_dir: B) -> Self {
        Self {
            config_path: config_path.into(),
            backups_dir: backups_dir.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Copies the current config into `backups/`. Returns `None` when there
    /// is nothing to back up.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.config_path.exists() {
            return Ok(None);
        }

        fs::create_dir_all(&self.backups_dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let mut path = self.backups_dir.join(format!("{}_{}.json", BACKUP_PREFIX, stamp));
        let mut counter = 2;
        while path.exists() {
            path = self
                .backups_dir
                .join(format!("{}_{}_{}.json", BACKUP_PREFIX, stamp, counter));
            counter += 1;
        }

        fs::copy(&self.config_path, &path)?;
        tracing::info!(backup = %path.display(), "plugin configuration backed up");
        Ok(Some(path))
    }

    /// Uses the existing config as a template when it parses as an object,
    /// otherwise the plugin's default structure. Other key sources in the
    /// template are left alone.
    pub fn build(&self, kindle_key: Value, voucher_file: &Path) -> Result<Value> {
        let mut config = match self.read_existing() {
            Some(Value::Object(map)) => Value::Object(map),
            _ => default_plugin_config(),
        };

        let Value::Object(root) = &mut config else {
            return Err(KeyFinderError::Plugin {
                message: "plugin configuration is not a JSON object".to_string(),
            });
        };

        root.insert(
            "kindleextrakeyfile".to_string(),
            Value::String(voucher_file.display().to_string()),
        );
        let keys = root
            .entry("kindlekeys".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !keys.is_object() {
            *keys = Value::Object(Map::new());
        }
        if let Value::Object(keys) = keys {
            keys.insert(KINDLE_KEY_NAME.to_string(), kindle_key);
        }

        Ok(config)
    }

    pub fn write(&self, config: &Value) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.config_path, serde_json::to_string_pretty(config)?)?;
        tracing::debug!(path = %self.config_path.display(), "plugin configuration written");
        Ok(())
    }

    /// Re-reads the written file and checks the key landed.
    pub fn verify(&self) -> Result<PluginSummary> {
        let content = fs::read_to_string(&self.config_path)?;
        let config: Value = serde_json::from_str(&content).map_err(|e| KeyFinderError::Plugin {
            message: format!("written configuration does not parse: {}", e),
        })?;

        let keys = config
            .get("kindlekeys")
            .and_then(Value::as_object)
            .ok_or_else(|| KeyFinderError::Plugin {
                message: "kindlekeys section missing after write".to_string(),
            })?;
        let kindle_key = keys.get(KINDLE_KEY_NAME).cloned();
        if kindle_key.is_none() {
            return Err(KeyFinderError::Plugin {
                message: format!("{} entry missing after write", KINDLE_KEY_NAME),
            });
        }

        Ok(PluginSummary {
            kindle_key_count: keys.len(),
            extra_key_file: config
                .get("kindleextrakeyfile")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kindle_key,
        })
    }

    pub fn restore(&self, backup: &Path) -> Result<()> {
        fs::copy(backup, &self.config_path)?;
        tracing::warn!(backup = %backup.display(), "plugin configuration restored from backup");
        Ok(())
    }

    /// Build, write and verify; on any failure the backup (if one was
    /// taken) is put back.
    pub fn apply(&self, kindle_key: Value, voucher_file: &Path, backup: Option<&Path>) -> Result<PluginSummary> {
        let result = self
            .build(kindle_key, voucher_file)
            .and_then(|config| self.write(&config))
            .and_then(|()| self.verify());

        if let (Err(e), Some(backup)) = (&result, backup) {
            tracing::error!(error = %e, "plugin configuration failed, restoring backup");
            if let Err(restore_error) = self.restore(backup) {
                tracing::error!(error = %restore_error, "backup restore failed");
            }
        }
        result
    }

    fn read_existing(&self) -> Option<Value> {
        let content = fs::read_to_string(&self.config_path).ok()?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "existing plugin configuration unreadable, starting from defaults");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn configurator(temp_dir: &TempDir) -> PluginConfigurator {
        PluginConfigurator::new(
            temp_dir.path().join("calibre").join("plugins").join("dedrm.json"),
            temp_dir.path().join("backups"),
        )
    }

    fn sample_key() -> Value {
        json!({"DSN": "dsn", "kindle.account.secrets": ["s1"], "kindle.account.tokens": "tok"})
    }

    #[test]
    fn test_build_from_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = configurator(&temp_dir);
        assert!(plugin.backup().unwrap().is_none());

        let config = plugin.build(sample_key(), Path::new("C:\\Keys\\kindlekey.txt")).unwrap();
        assert_eq!(config["configured"], true);
        assert_eq!(config["kindleextrakeyfile"], "C:\\Keys\\kindlekey.txt");
        assert_eq!(config["kindlekeys"]["kindlekey"]["DSN"], "dsn");

        let fields: Vec<&String> = config.as_object().unwrap().keys().collect();
        assert_eq!(fields.first().map(|s| s.as_str()), Some("adeptkeys"));
        assert_eq!(fields.last().map(|s| s.as_str()), Some("serials"));
    }

    #[test]
    fn test_existing_config_kept_as_template() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = configurator(&temp_dir);
        fs::create_dir_all(plugin.config_path().parent().unwrap()).unwrap();
        fs::write(
            plugin.config_path(),
            json!({
                "configured": true,
                "adeptkeys": {"adobe": "abc"},
                "kindlekeys": {"otherkey": {"DSN": "x"}}
            })
            .to_string(),
        )
        .unwrap();

        let backup = plugin.backup().unwrap().unwrap();
        assert!(backup.file_name().unwrap().to_string_lossy().starts_with("dedrm_backup_"));

        let summary = plugin
            .apply(sample_key(), Path::new("kindlekey.txt"), Some(&backup))
            .unwrap();
        assert_eq!(summary.kindle_key_count, 2);
        assert_eq!(summary.extra_key_file, "kindlekey.txt");

        let written: Value =
            serde_json::from_str(&fs::read_to_string(plugin.config_path()).unwrap()).unwrap();
        assert_eq!(written["adeptkeys"]["adobe"], "abc");
        assert_eq!(written["kindlekeys"]["otherkey"]["DSN"], "x");
    }

    #[test]
    fn test_restore_after_failed_verify() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = configurator(&temp_dir);
        fs::create_dir_all(plugin.config_path().parent().unwrap()).unwrap();
        let original = json!({"configured": true, "kindlekeys": {}}).to_string();
        fs::write(plugin.config_path(), &original).unwrap();
        let backup = plugin.backup().unwrap().unwrap();

        fs::write(plugin.config_path(), "{ broken").unwrap();
        assert!(plugin.verify().is_err());

        plugin.restore(&backup).unwrap();
        assert_eq!(fs::read_to_string(plugin.config_path()).unwrap(), original);
    }

    #[test]
    fn test_backups_do_not_overwrite_each_other() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = configurator(&temp_dir);
        fs::create_dir_all(plugin.config_path().parent().unwrap()).unwrap();
        fs::write(plugin.config_path(), "{}").unwrap();

        let first = plugin.backup().unwrap().unwrap();
        let second = plugin.backup().unwrap().unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }
}
