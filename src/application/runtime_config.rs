use std::path::PathBuf;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mountpoint: PathBuf,
    pub config: Option<PathBuf>,
}

impl From<Cli> for RuntimeConfig {
    fn from(cli: Cli) -> Self {
        Self {
            mountpoint: cli.mountpoint,
            config: cli.config,
        }
    }
}
