mod tracker_config;

pub use tracker_config::{ConfigError, TrackerConfig};
