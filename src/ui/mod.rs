pub mod output;
pub mod progress;
pub mod prompt;
pub mod signals;

pub use output::{ItemStatus, OutputFormatter};
pub use progress::ProgressManager;
pub use prompt::{CountdownOutcome, Prompter, ScriptedPrompter, TerminalPrompter};
pub use signals::GracefulShutdown;
