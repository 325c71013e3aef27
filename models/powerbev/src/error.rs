use std::path::PathBuf;

use bev_dataset::DataError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("override '{0}' has no value; overrides are KEY VALUE pairs")]
    UnpairedOverride(String),

    #[error("unknown config key '{0}'")]
    UnknownKey(String),

    #[error("malformed config: {0}")]
    Malformed(#[source] serde_yaml::Error),

    #[error("invalid setting {key}: {reason}")]
    Setting { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot '{0}' does not exist")]
    NotFound(PathBuf),

    #[error("cannot read snapshot '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot deserialize snapshot '{path}': {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot write snapshot '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize snapshot: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("cannot prepare run directory '{path}': {source}")]
    RunDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics log write failed: {0}")]
    MetricsLog(String),

    #[error("no training device configured")]
    NoDevice,
}
