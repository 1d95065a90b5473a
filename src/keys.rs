use crate::error::{KeyFinderError, Result};
use crate::supervisor::ToolOutput;
use regex::Regex;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const VOUCHER_KEY_FILE: &str = "kindlekey.txt";
pub const ACCOUNT_KEY_FILE: &str = "kindlekey.k4i";

pub const DSN_FIELD: &str = "DSN";
pub const TOKENS_FIELD: &str = "kindle.account.tokens";
pub const SECRET_FIELDS: [&str; 3] = [
    "kindle.account.secrets",
    "kindle.account.new_secrets",
    "kindle.account.clear_old_secrets",
];

// Harmless noise the extractor's Qt runtime prints on every run.
const NOISE_MARKERS: [&str; 3] = ["QObject::startTimer", "Fontconfig error", "QThread"];

/// The two files the extractor writes: voucher keys as text and account
/// secrets as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilePair {
    pub voucher: PathBuf,
    pub account: PathBuf,
}

impl KeyFilePair {
    pub fn new<V: Into<PathBuf>, A: Into<PathBuf>>(voucher: V, account: A) -> Self {
        Self {
            voucher: voucher.into(),
            account: account.into(),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(VOUCHER_KEY_FILE), dir.join(ACCOUNT_KEY_FILE))
    }

    /// `kindlekey.txt.temp` / `kindlekey.k4i.temp` next to the main pair.
    pub fn temp_sibling(&self) -> Self {
        let with_suffix = |path: &Path| {
            let mut name = path.as_os_str().to_owned();
            name.push(".temp");
            PathBuf::from(name)
        };
        Self::new(with_suffix(&self.voucher), with_suffix(&self.account))
    }

    pub fn exists(&self) -> bool {
        self.voucher.is_file() && self.account.is_file()
    }

    pub fn remove(&self) {
        for path in [&self.voucher, &self.account] {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "could not remove key file");
                }
            }
        }
    }
}

/// Values the extractor prints on stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractorReport {
    pub dsn: Option<String>,
    pub tokens: Option<String>,
}

impl ExtractorReport {
    /// Keeps earlier values when a later book printed nothing.
    pub fn absorb(&mut self, other: ExtractorReport) {
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.tokens.is_some() {
            self.tokens = other.tokens;
        }
    }
}

pub fn parse_extractor_output(stdout: &str) -> ExtractorReport {
    let mut report = ExtractorReport::default();
    for line in stdout.lines() {
        if let Some(dsn) = line.strip_prefix("DSN ") {
            let dsn = dsn.trim();
            if !dsn.is_empty() {
                report.dsn = Some(dsn.to_string());
            }
        } else if let Some(tokens) = line.strip_prefix("Tokens ") {
            let first = tokens.split(',').next().unwrap_or_default().trim();
            if !first.is_empty() {
                report.tokens = Some(first.to_string());
            }
        }
    }
    report
}

/// Short failure reason from a non-zero extractor run.
pub fn summarize_extractor_failure(output: &ToolOutput) -> String {
    let errors: Vec<&str> = output
        .stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !NOISE_MARKERS.iter().any(|marker| line.contains(marker)))
        .collect();
    if !errors.is_empty() {
        return errors.join("\n");
    }

    let stdout = output.stdout.trim();
    let lower = stdout.to_lowercase();
    if !stdout.is_empty() && (lower.contains("error") || lower.contains("failed")) {
        return stdout.to_string();
    }

    match output.exit_code {
        Some(code) => format!("Key extraction failed (exit code {})", code),
        None => "Key extraction was terminated".to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub voucher_lines_added: usize,
    pub secrets_added: usize,
}

/// Merges a freshly extracted pair into the accumulated one. Voucher lines
/// and secrets are de-duplicated; DSN and tokens are replaced only by
/// non-empty values.
pub fn merge_key_files(target: &KeyFilePair, new: &KeyFilePair) -> Result<MergeOutcome> {
    if !new.exists() {
        return Err(KeyFinderError::KeyFile {
            message: "Temporary key files not found".to_string(),
        });
    }

    let mut outcome = MergeOutcome::default();

    let new_voucher = fs::read_to_string(&new.voucher)?;
    let existing_voucher = if target.voucher.exists() {
        fs::read_to_string(&target.voucher)?
    } else {
        String::new()
    };
    let mut lines: Vec<String> = existing_voucher
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    for line in new_voucher.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !lines.iter().any(|l| l == line) {
            lines.push(line.to_string());
            outcome.voucher_lines_added += 1;
        }
    }
    if outcome.voucher_lines_added > 0 || !target.voucher.exists() {
        fs::write(&target.voucher, lines.join("\n"))?;
    }

    let new_account = read_account_file(&new.account)?;
    let mut account = if target.account.exists() {
        read_account_file(&target.account)?
    } else {
        Map::new()
    };
    let before = account.clone();
    outcome.secrets_added = merge_account_json(&mut account, &new_account);
    if account != before || !target.account.exists() {
        fs::write(&target.account, serde_json::to_string_pretty(&account)?)?;
    }

    Ok(outcome)
}

/// Returns the number of secrets added.
pub fn merge_account_json(existing: &mut Map<String, Value>, new: &Map<String, Value>) -> usize {
    let mut added = 0;

    for field in SECRET_FIELDS {
        let Some(Value::Array(new_items)) = new.get(field) else {
            continue;
        };
        let entry = existing
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            for item in new_items {
                if !items.contains(item) {
                    items.push(item.clone());
                    added += 1;
                }
            }
        }
    }

    for field in [DSN_FIELD, TOKENS_FIELD] {
        if let Some(value) = new.get(field) {
            if value.as_str().is_some_and(|s| !s.is_empty()) {
                existing.insert(field.to_string(), value.clone());
            }
        }
    }

    added
}

fn read_account_file(path: &Path) -> Result<Map<String, Value>> {
    let content = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(KeyFinderError::KeyFile {
            message: format!("{} does not contain a JSON object", path.display()),
        }),
        Err(e) => Err(KeyFinderError::KeyFile {
            message: format!("Failed to parse {}: {}", path.display(), e),
        }),
    }
}

/// Builds the plugin's Kindle key entry from the merged account file, in
/// the field order the plugin itself writes.
pub fn build_kindle_key(account_file: &Path, report: &ExtractorReport) -> Result<Value> {
    let account = read_account_file(account_file)?;
    let text_field = |field: &str, fallback: &Option<String>| {
        account
            .get(field)
            .cloned()
            .unwrap_or_else(|| Value::String(fallback.clone().unwrap_or_default()))
    };
    let array_field = |field: &str| {
        account
            .get(field)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    };

    let mut key = Map::new();
    key.insert(DSN_FIELD.to_string(), text_field(DSN_FIELD, &report.dsn));
    key.insert(
        "kindle.account.clear_old_secrets".to_string(),
        array_field("kindle.account.clear_old_secrets"),
    );
    key.insert(
        "kindle.account.new_secrets".to_string(),
        array_field("kindle.account.new_secrets"),
    );
    key.insert(
        "kindle.account.secrets".to_string(),
        array_field("kindle.account.secrets"),
    );
    key.insert(TOKENS_FIELD.to_string(), text_field(TOKENS_FIELD, &report.tokens));
    Ok(Value::Object(key))
}

/// Keeps the first and last two characters of values longer than four.
pub fn obfuscate(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 4 {
        return text.to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}

struct SecretPatterns {
    drm_key: Option<Regex>,
    opened: Option<Regex>,
    reused: Option<Regex>,
    working: Option<Regex>,
    serial: Option<Regex>,
}

fn patterns() -> &'static SecretPatterns {
    static PATTERNS: OnceLock<SecretPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| SecretPatterns {
        drm_key: compile(r"(amzn1\.drm-key\.v1\.)([a-f0-9\-]+)(\$secret_key:)([a-f0-9]+)"),
        opened: compile(r"(Opened book with secret:\s*)([A-Za-z0-9+/=]+)"),
        reused: compile(r"(Opened book with reused secret:\s*)([A-Za-z0-9+/=]+)"),
        working: compile(r#"(Working secret:\s*")([A-Za-z0-9+/=]+)(")"#),
        serial: compile(r#""device_serial_number":"([^"]+)""#),
    })
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(pattern, error = %e, "invalid secret pattern");
            None
        }
    }
}

/// Drops Qt noise and, when `hide` is set, masks secrets in extractor
/// output before it reaches the console or a log.
pub fn filter_sensitive_output(text: &str, hide: bool) -> String {
    text.lines()
        .filter(|line| {
            !line.contains("QObject::startTimer: Timers can only be used with threads started with QThread")
                && !line.contains("Fontconfig error: Cannot load default config file")
        })
        .map(|line| if hide { mask_line(line) } else { line.to_string() })
        .collect::<Vec<_>>()
        .join("\n")
}

fn mask_line(line: &str) -> String {
    let p = patterns();

    if let Some(dsn) = line.strip_prefix("DSN ") {
        let dsn = dsn.trim();
        if !dsn.is_empty() {
            return format!("DSN {}", obfuscate(dsn));
        }
        return line.to_string();
    }

    if let Some(tokens) = line.strip_prefix("Tokens ") {
        let tokens = tokens.trim();
        if !tokens.is_empty() {
            let masked: Vec<String> = tokens.split(',').map(|t| obfuscate(t.trim())).collect();
            return format!("Tokens {}", masked.join(","));
        }
        return line.to_string();
    }

    if line.contains("amzn1.drm-key.v1.") && line.contains("$secret_key:") {
        if let Some(re) = &p.drm_key {
            return re
                .replace(line, |caps: &regex::Captures| {
                    format!("{}{}{}{}", &caps[1], obfuscate(&caps[2]), &caps[3], obfuscate(&caps[4]))
                })
                .into_owned();
        }
        return line.to_string();
    }

    if let Some((prefix, secret)) = line.split_once("$secret_key:") {
        let secret = secret.trim();
        if !secret.is_empty() && !secret.contains("$secret_key:") {
            return format!("{}$secret_key:{}", prefix, obfuscate(secret));
        }
        return line.to_string();
    }

    for re in [&p.reused, &p.opened].into_iter().flatten() {
        if re.is_match(line) {
            return re
                .replace(line, |caps: &regex::Captures| {
                    format!("{}{}", &caps[1], obfuscate(&caps[2]))
                })
                .into_owned();
        }
    }

    if let Some(re) = p.working.as_ref().filter(|re| re.is_match(line)) {
        return re
            .replace(line, |caps: &regex::Captures| {
                format!("{}{}{}", &caps[1], obfuscate(&caps[2]), &caps[3])
            })
            .into_owned();
    }

    if let Some(re) = p.serial.as_ref().filter(|re| re.is_match(line)) {
        return re
            .replace(line, |caps: &regex::Captures| {
                format!("\"device_serial_number\":\"{}\"", obfuscate(&caps[1]))
            })
            .into_owned();
    }

    line.to_string()
}

/// Number of non-empty voucher lines in a key file.
pub fn count_voucher_keys(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}
