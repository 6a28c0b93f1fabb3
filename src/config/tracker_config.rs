use compio::{fs::File, io::AsyncReadExt, io::BufReader};
use saphyr::{LoadableYamlNode, Scalar, Yaml};
use snafu::prelude::*;
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::ext::BestEffortPathExt;

const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
/// fanotify refuses reads into buffers that cannot hold a single record.
const MIN_READ_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Check the identity of every listed child, even when its name and inode
    /// number are unchanged.
    pub strict: bool,
    /// How long a record without links survives before it is destroyed.
    pub reclaim_grace: Duration,
    pub unlimited_queue: bool,
    pub read_buffer_size: usize,
    pub store: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            strict: false,
            reclaim_grace: Duration::ZERO,
            unlimited_queue: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            store: None,
        }
    }
}

impl TrackerConfig {
    /// Reads the config file if one was given, otherwise uses the defaults.
    pub async fn read(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_path(path.to_path_buf()).await,
            None => {
                debug!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub async fn from_path(path: PathBuf) -> Result<Self, ConfigError> {
        debug!("Opening config file: {}", path.best_effort_path_display());
        let file = File::open(&path).await.context(ReadSnafu {
            file_path: path.best_effort_path_display(),
        })?;

        let cursor = Cursor::new(file);
        let mut reader = BufReader::new(cursor);
        let res = reader.read_to_string(String::new()).await;
        match res.0 {
            Ok(n) => debug!("Successfully read config file: {n} bytes"),
            _ => {
                res.0.context(ReadSnafu {
                    file_path: path.best_effort_path_display(),
                })?;
            }
        }
        res.1.as_str().try_into()
    }

    fn apply(&mut self, key: &str, value: &Yaml) -> Result<(), ConfigError> {
        match key {
            "strict" => self.strict = expect_bool(key, value)?,
            "unlimited_queue" => self.unlimited_queue = expect_bool(key, value)?,
            "reclaim_grace_ms" => {
                self.reclaim_grace = Duration::from_millis(expect_unsigned(key, value)?);
            }
            "read_buffer_size" => {
                let size = expect_unsigned(key, value)? as usize;
                ensure!(
                    size >= MIN_READ_BUFFER_SIZE,
                    BufferTooSmallSnafu {
                        size,
                        minimum: MIN_READ_BUFFER_SIZE,
                    }
                );
                self.read_buffer_size = size;
            }
            "store" => {
                self.store = match value {
                    Yaml::Value(Scalar::Null) => None,
                    Yaml::Value(Scalar::String(path)) => Some(PathBuf::from(path.to_string())),
                    _ => {
                        return InvalidValueSnafu {
                            key,
                            expected: "a path",
                        }
                        .fail();
                    }
                }
            }
            _ => debug!("Ignoring unknown config key '{key}'"),
        }
        Ok(())
    }
}

fn expect_bool(key: &str, value: &Yaml) -> Result<bool, ConfigError> {
    match value {
        Yaml::Value(Scalar::Boolean(flag)) => Ok(*flag),
        _ => InvalidValueSnafu {
            key,
            expected: "a boolean",
        }
        .fail(),
    }
}

fn expect_unsigned(key: &str, value: &Yaml) -> Result<u64, ConfigError> {
    match value {
        Yaml::Value(Scalar::Integer(number)) if *number >= 0 => Ok(*number as u64),
        _ => InvalidValueSnafu {
            key,
            expected: "a non-negative integer",
        }
        .fail(),
    }
}

impl TryFrom<&str> for TrackerConfig {
    type Error = ConfigError;

    fn try_from(contents: &str) -> Result<Self, Self::Error> {
        let contents_vec =
            Yaml::load_from_str(contents).map_err(|e| ConfigError::ParseError { source: e })?;
        let contents = contents_vec.first().ok_or(ConfigError::MalformedConfig)?;

        let top_level = contents.as_mapping().ok_or(ConfigError::TopLevelNotMap)?;

        let mut config = Self::default();
        for (key, value) in top_level {
            match key {
                Yaml::Value(Scalar::String(key)) => config.apply(key, value)?,
                _ => debug!("Skipping non-string config key: {:?}", key),
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read the config file: {}", file_path))]
    ReadError {
        file_path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse the config file"))]
    ParseError { source: saphyr::ScanError },
    #[snafu(display("Improperly formatted config file"))]
    MalformedConfig,
    #[snafu(display("Top level of config should be a map"))]
    TopLevelNotMap,
    #[snafu(display("Config key '{}' should be {}", key, expected))]
    InvalidValue { key: String, expected: &'static str },
    #[snafu(display("Read buffer of {} bytes is below the minimum of {}", size, minimum))]
    BufferTooSmall { size: usize, minimum: usize },
}
