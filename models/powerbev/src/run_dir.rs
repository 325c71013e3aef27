use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, TimeZone};
use log::info;

use crate::error::TrainError;

const CHECKPOINT_DIR: &str = "checkpoint";
const METRICS_DIR: &str = "powerbev_logs";
const METRICS_FILE: &str = "scalars.jsonl";

/// Per-run output directory: `<log_dir>/<time>_<host>_<tag>/`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
}

impl RunDirectory {
    /// Creates the directory for a run starting now on this host.
    pub fn prepare(log_dir: &Path, tag: &str) -> Result<Self, TrainError> {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        let path = log_dir.join(run_name(&Local::now(), &host, tag));

        fs::create_dir_all(&path).map_err(|source| TrainError::RunDirectory {
            path: path.clone(),
            source,
        })?;
        info!("run directory: {}", path.display());

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.path.join(CHECKPOINT_DIR)
    }

    pub fn metrics_log_path(&self) -> PathBuf {
        self.path.join(METRICS_DIR).join(METRICS_FILE)
    }

    /// Writes `contents` to `file_name` inside the run directory.
    pub fn write(&self, file_name: &str, contents: &str) -> Result<PathBuf, TrainError> {
        let path = self.path.join(file_name);
        fs::write(&path, contents).map_err(|source| TrainError::RunDirectory {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// e.g. `17October2026at09:41:07+02:00_gpu-node-3_baseline`. Only second
/// resolution, so two runs with the same tag on one host in the same second
/// share a directory.
pub fn run_name<Tz>(time: &DateTime<Tz>, host: &str, tag: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{}_{host}_{tag}", time.format("%d%B%Yat%H:%M:%S%Z"))
}
