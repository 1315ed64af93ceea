use clap::Parser;
use std::path::PathBuf;

/// Wrap a CLI tool, mirror its output untouched, and turn its stream into
/// structured events for plugins.
#[derive(Parser, Debug)]
#[command(name = "wiretap")]
#[command(about = "Mirror a CLI tool's output while parsing it into structured events", long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Additional plugin directory (repeatable)
    #[arg(long = "plugin-dir")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Override the record store path
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Command to wrap, e.g. `wiretap -- mytool --flag`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_command_with_its_own_flags() {
        let cli = Cli::parse_from(["wiretap", "--", "mytool", "--flag", "-x"]);
        assert_eq!(cli.command, vec!["mytool", "--flag", "-x"]);
    }

    #[test]
    fn collects_repeated_plugin_dirs() {
        let cli = Cli::parse_from([
            "wiretap",
            "--plugin-dir",
            "a",
            "--plugin-dir",
            "b",
            "--",
            "mytool",
        ]);
        assert_eq!(cli.plugin_dirs.len(), 2);
    }

    #[test]
    fn requires_a_command() {
        assert!(Cli::try_parse_from(["wiretap"]).is_err());
    }
}
