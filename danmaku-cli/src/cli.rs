use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "bili-danmaku",
    version,
    about = "Watch Bilibili live chat from the terminal"
)]
pub struct Args {
    /// Live room id (short ids are resolved)
    pub room_id: u64,

    /// Cookie header of a logged-in session
    #[arg(short, long, env = "BILI_COOKIES", hide_env_values = true)]
    pub cookies: Option<String>,

    /// Configuration file (defaults to <config dir>/bili-danmaku/config.toml)
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub output: OutputFormat,

    /// Print every command, not only chat messages
    #[arg(short, long)]
    pub all: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// One human-readable line per message
    Pretty,
    /// One JSON object per line
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from(["bili-danmaku", "21452505", "--output", "json", "-a"]);
        assert_eq!(args.room_id, 21452505);
        assert_eq!(args.output, OutputFormat::Json);
        assert!(args.all);
        assert!(!args.verbose);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Args::try_parse_from(["bili-danmaku", "1", "-v", "-q"]).is_err());
    }
}
