use clap::Parser;
use kindle_key_finder::{logging, program_dir, Cli, KeyFinder, KeyFinderError, OutputFormatter};
use std::process;

#[tokio::main]
async fn main() {
    let exit_code = run().await;
    process::exit(exit_code);
}

async fn run() -> i32 {
    // Only --help and --version; both exit here
    let _cli = Cli::parse();
    logging::init();

    if !cfg!(windows) {
        print_startup_error(&KeyFinderError::UnsupportedPlatform);
        return exit_code(&KeyFinderError::UnsupportedPlatform);
    }

    let finder = match KeyFinder::new() {
        Ok(finder) => finder,
        Err(e) => {
            print_startup_error(&e);
            return exit_code(&e);
        }
    };

    let result = match program_dir() {
        Ok(dir) => finder.run(&dir).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(summary) => {
            tracing::info!(summary = %summary.overall_line(), "finished");
            if summary.has_failures() {
                2
            } else {
                0
            }
        }
        Err(KeyFinderError::UserQuit) => {
            finder.output_formatter().info("Script stopped at your request.");
            0
        }
        Err(KeyFinderError::Cancelled) => {
            finder.output_formatter().warning("Cancelled.");
            130
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            finder.handle_error(&e);
            finder.pause_before_exit();
            exit_code(&e)
        }
    }
}

fn exit_code(error: &KeyFinderError) -> i32 {
    match error {
        KeyFinderError::UserQuit => 0,
        KeyFinderError::ExtractorNotFound { .. } => 3,
        KeyFinderError::Cancelled => 130,
        _ => 1,
    }
}

fn print_startup_error(error: &KeyFinderError) {
    let formatter = OutputFormatter::new(false);
    formatter.print_user_friendly_error(error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&KeyFinderError::UserQuit), 0);
        assert_eq!(
            exit_code(&KeyFinderError::ExtractorNotFound {
                path: "KFXKeyExtractor28.exe".to_string()
            }),
            3
        );
        assert_eq!(exit_code(&KeyFinderError::Cancelled), 130);
        assert_eq!(exit_code(&KeyFinderError::UnsupportedPlatform), 1);
        assert_eq!(
            exit_code(&KeyFinderError::KindleNotFound { searched: Vec::new() }),
            1
        );
    }
}
