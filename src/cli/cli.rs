use std::path::PathBuf;

use clap::Parser;

use crate::application::data::LogLevel;

/// Mirrors a mounted filesystem in memory and keeps it current from kernel
/// change notifications.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Cli {
    /// Root of the mount to watch
    pub mountpoint: PathBuf,
    #[clap(long, short, default_value = "warn", value_enum)]
    pub log_level: LogLevel,

    /// YAML file with tracker settings
    #[clap(long, short)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mountpoint_is_required() {
        assert!(Cli::try_parse_from(["inotrack"]).is_err());
    }

    #[test]
    fn defaults_apply_without_flags() {
        let cli = Cli::try_parse_from(["inotrack", "/mnt/data"]).unwrap();
        assert_eq!(cli.mountpoint, PathBuf::from("/mnt/data"));
        assert!(matches!(cli.log_level, LogLevel::Warn));
        assert_eq!(cli.config, None);
    }

    #[rstest]
    #[case("debug", Some(tracing::Level::DEBUG))]
    #[case("info", Some(tracing::Level::INFO))]
    #[case("error", Some(tracing::Level::ERROR))]
    #[case("silent", None)]
    fn log_level_is_parsed(#[case] flag: &str, #[case] expected: Option<tracing::Level>) {
        let cli = Cli::try_parse_from(["inotrack", "--log-level", flag, "/mnt"]).unwrap();
        assert_eq!(cli.log_level.to_tracing_level(), expected);
    }

    #[test]
    fn config_path_is_accepted() {
        let cli =
            Cli::try_parse_from(["inotrack", "/mnt", "--config", "tracker.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("tracker.yaml")));
    }
}
