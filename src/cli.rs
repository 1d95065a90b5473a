use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kindle-key-finder")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Extract Kindle for PC keys and configure the DeDRM plugin")]
#[command(
    long_about = "Kindle Key Finder extracts the DRM keys of your Kindle for PC books with \
                  KFXKeyExtractor28.exe, configures the DeDRM plugin for Calibre with them, \
                  and can import the books into a Calibre library and convert them to EPUB.\n\n\
                  All settings are collected by an interactive wizard on the first run and \
                  saved to key_finder_config.json next to the program."
)]
#[command(before_help = "Kindle Key Finder")]
#[command(after_help = "Place KFXKeyExtractor28.exe in the same folder as this program, \
                        then run it without arguments.")]
pub struct Cli {}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_arguments_needed() {
        assert!(Cli::try_parse_from(["kindle-key-finder"]).is_ok());
    }

    #[test]
    fn test_behaviour_flags_are_rejected() {
        assert!(Cli::try_parse_from(["kindle-key-finder", "--quiet"]).is_err());
        assert!(Cli::try_parse_from(["kindle-key-finder", "books"]).is_err());
    }
}
