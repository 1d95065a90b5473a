use crate::error::{KeyFinderError, UserFriendlyError};
use console::{style, Emoji, Term};
use std::time::Duration;

// Emojis with text fallbacks
static CHECKMARK: Emoji = Emoji("✅ ", "[OK] ");
static CROSS: Emoji = Emoji("❌ ", "[ERROR] ");
static INFO: Emoji = Emoji("ℹ️  ", "[i] ");
static WARNING: Emoji = Emoji("⚠️  ", "[WARN] ");
static ROCKET: Emoji = Emoji("🚀 ", "[*] ");
static SPARKLES: Emoji = Emoji("✨ ", "");

const RULE_WIDTH: usize = 70;

pub struct OutputFormatter {
    term: Term,
    use_colors: bool,
    quiet: bool,
}

impl OutputFormatter {
    /// A quiet formatter prints nothing; tests use it.
    pub fn new(quiet: bool) -> Self {
        let term = Term::stdout();
        let use_colors = term.features().colors_supported() && !quiet;
        Self {
            term,
            use_colors,
            quiet,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    // Core messaging methods
    pub fn success(&self, message: &str) {
        self.print_message(MessageType::Success, message);
    }

    pub fn error(&self, message: &str) {
        self.print_message(MessageType::Error, message);
    }

    pub fn warning(&self, message: &str) {
        self.print_message(MessageType::Warning, message);
    }

    pub fn info(&self, message: &str) {
        self.print_message(MessageType::Info, message);
    }

    pub fn step(&self, message: &str) {
        if self.quiet {
            return;
        }
        if self.use_colors {
            println!("{}{}", ROCKET, style(message).bold());
        } else {
            println!("{}{}", ROCKET, message);
        }
    }

    /// Indented follow-up line under a step.
    pub fn detail(&self, message: &str) {
        if self.quiet {
            return;
        }
        if self.use_colors {
            println!("   {}", style(message).dim());
        } else {
            println!("   {}", message);
        }
    }

    pub fn blank(&self) {
        if !self.quiet {
            println!();
        }
    }

    /// Per-item progress line: `[2/5] B00AAA_EBOK - Title... OK`.
    pub fn item_result(&self, index: usize, total: usize, label: &str, result: ItemStatus) {
        if self.quiet {
            return;
        }
        let prefix = format!("[{}/{}] {}...", index, total, label);
        let (text, painted) = match result {
            ItemStatus::Ok => ("OK", style("OK").green().bold()),
            ItemStatus::Skipped => ("SKIPPED", style("SKIPPED").yellow()),
            ItemStatus::Failed => ("FAILED", style("FAILED").red().bold()),
            ItemStatus::TimedOut => ("TIMEOUT", style("TIMEOUT").red().bold()),
        };
        if self.use_colors {
            println!("{} {}", prefix, painted);
        } else {
            println!("{} {}", prefix, text);
        }
    }

    // User-friendly error handling
    pub fn print_user_friendly_error(&self, error: &KeyFinderError) {
        self.error(&error.user_message());

        if let Some(suggestion) = error.suggestion() {
            if self.quiet {
                return;
            }
            println!();
            if self.use_colors {
                println!("{}{}", INFO, style(format!("Suggestion: {}", suggestion)).cyan());
            } else {
                println!("Suggestion: {}", suggestion);
            }
        }
    }

    pub fn print_banner(&self, version: &str) {
        if self.quiet {
            return;
        }
        self.print_rule('=');
        if self.use_colors {
            println!("{}{}", SPARKLES, style("Kindle Key Finder").bold().cyan());
        } else {
            println!("Kindle Key Finder");
        }
        println!("Version {}", version);
        self.print_rule('=');
        println!("Phase 1: Key Extraction (Plugin-Compatible)");
        println!("Phase 2: DeDRM Plugin Auto-Configuration");
        println!("Phase 3: Calibre Auto-Import");
        println!("Phase 4: Imported eBooks to EPUB Conversion");
        self.print_rule('=');
        println!();
    }

    pub fn phase_banner(&self, number: u8, name: &str) {
        if self.quiet {
            return;
        }
        let title = format!("PHASE {}: {}", number, name.to_uppercase());
        println!();
        self.print_rule('=');
        if self.use_colors {
            println!("{}", style(title).bold().cyan());
        } else {
            println!("{}", title);
        }
        self.print_rule('=');
        println!();
    }

    pub fn phase_summary(&self, number: u8, name: &str, points: &[String]) {
        if self.quiet {
            return;
        }
        println!();
        self.print_rule('=');
        let title = format!("PHASE {} COMPLETE: {}", number, name);
        if self.use_colors {
            println!("{}{}", CHECKMARK, style(title).green().bold());
        } else {
            println!("{}{}", CHECKMARK, title);
        }
        self.print_rule('=');
        for point in points {
            println!("  - {}", point);
        }
        println!();
    }

    /// Two-column table; the first column is padded to the widest label.
    pub fn print_table(&self, rows: &[(String, String)]) {
        if self.quiet {
            return;
        }
        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        self.print_separator();
        for (label, value) in rows {
            if self.use_colors {
                println!("  {:<width$}  {}", label, style(value).cyan(), width = width);
            } else {
                println!("  {:<width$}  {}", label, value, width = width);
            }
        }
        self.print_separator();
    }

    pub fn print_separator(&self) {
        if self.quiet {
            return;
        }
        if self.use_colors {
            println!("{}", style("-".repeat(RULE_WIDTH)).dim());
        } else {
            println!("{}", "-".repeat(RULE_WIDTH));
        }
    }

    pub fn clear_screen(&self) {
        if self.quiet || !self.term.is_term() {
            return;
        }
        if let Err(e) = self.term.clear_screen() {
            tracing::debug!(error = %e, "could not clear screen");
        }
    }

    /// Prints a prompt without a newline.
    pub fn prompt(&self, message: &str) {
        if self.quiet {
            return;
        }
        let text = if self.use_colors {
            style(message).bold().to_string()
        } else {
            message.to_string()
        };
        if let Err(e) = self.term.write_str(&text) {
            tracing::debug!(error = %e, "could not write prompt");
        }
    }

    // Private helper methods
    fn print_rule(&self, ch: char) {
        println!("{}", ch.to_string().repeat(RULE_WIDTH));
    }

    fn print_message(&self, msg_type: MessageType, message: &str) {
        if self.quiet {
            return;
        }

        #[allow(clippy::type_complexity)]
        let (emoji, color_fn): (&Emoji, Box<dyn Fn(&str) -> console::StyledObject<&str>>) =
            match msg_type {
                MessageType::Success => (&CHECKMARK, Box::new(|msg| style(msg).green())),
                MessageType::Error => (&CROSS, Box::new(|msg| style(msg).red().bold())),
                MessageType::Warning => (&WARNING, Box::new(|msg| style(msg).yellow().bold())),
                MessageType::Info => (&INFO, Box::new(|msg| style(msg).cyan())),
            };

        let line = if self.use_colors {
            format!("{}{}", emoji, color_fn(message))
        } else {
            format!("{}{}", emoji, message)
        };

        match msg_type {
            MessageType::Error => eprintln!("{}", line),
            _ => println!("{}", line),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MessageType {
    Success,
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Ok,
    Skipped,
    Failed,
    TimedOut,
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_mode() {
        let formatter = OutputFormatter::new(true);
        assert!(formatter.is_quiet());
        assert!(!formatter.use_colors);
        formatter.phase_summary(1, "Key Extraction", &["nothing printed".to_string()]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_millis(0)), "0ms");
    }
}
