use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::data::dataset::{Dataset, InMemDataset};

use crate::synthetic::SyntheticBevDataset;
use crate::types::{BevGeometry, BevItem, SampleRecord};
use crate::DataError;

/// Validation scenes are drawn from a disjoint seed stream.
const VALIDATION_SEED_OFFSET: u64 = 1_000_003;

#[derive(Debug, Clone)]
pub enum BevDataSource {
    Synthetic {
        train_samples: usize,
        val_samples: usize,
        seed: u64,
    },
    /// `root/train/*.json` and `root/val/*.json`, one [`SampleRecord`] per file.
    Directory { root: PathBuf },
}

pub enum BevDataset {
    Synthetic(SyntheticBevDataset),
    InMemory(InMemDataset<BevItem>),
}

impl Dataset<BevItem> for BevDataset {
    fn get(&self, index: usize) -> Option<BevItem> {
        match self {
            BevDataset::Synthetic(dataset) => dataset.get(index),
            BevDataset::InMemory(dataset) => dataset.get(index),
        }
    }

    fn len(&self) -> usize {
        match self {
            BevDataset::Synthetic(dataset) => dataset.len(),
            BevDataset::InMemory(dataset) => dataset.len(),
        }
    }
}

pub struct BevSplits {
    pub train: BevDataset,
    pub valid: BevDataset,
}

impl BevSplits {
    pub fn build(source: &BevDataSource, geometry: &BevGeometry) -> Result<Self, DataError> {
        let splits = match source {
            BevDataSource::Synthetic {
                train_samples,
                val_samples,
                seed,
            } => Self {
                train: BevDataset::Synthetic(SyntheticBevDataset::new(
                    geometry.clone(),
                    *train_samples,
                    *seed,
                )),
                valid: BevDataset::Synthetic(SyntheticBevDataset::new(
                    geometry.clone(),
                    *val_samples,
                    seed.wrapping_add(VALIDATION_SEED_OFFSET),
                )),
            },
            BevDataSource::Directory { root } => Self {
                train: BevDataset::InMemory(InMemDataset::new(read_split(
                    &root.join("train"),
                    geometry,
                )?)),
                valid: BevDataset::InMemory(InMemDataset::new(read_split(
                    &root.join("val"),
                    geometry,
                )?)),
            },
        };

        if splits.train.is_empty() {
            return Err(DataError::Empty { split: "train" });
        }
        if splits.valid.is_empty() {
            return Err(DataError::Empty { split: "val" });
        }
        tracing::info!(
            "dataset ready: {} train / {} val samples",
            splits.train.len(),
            splits.valid.len()
        );

        Ok(splits)
    }
}

fn read_split(dir: &Path, geometry: &BevGeometry) -> Result<Vec<BevItem>, DataError> {
    let unreadable = |source| DataError::Unreadable {
        path: dir.to_path_buf(),
        source,
    };

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(unreadable)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    // Stable order keeps validation deterministic across runs.
    files.sort();

    files
        .iter()
        .map(|path| {
            let raw = fs::read(path).map_err(|source| DataError::Unreadable {
                path: path.clone(),
                source,
            })?;
            let record: SampleRecord =
                serde_json::from_slice(&raw).map_err(|e| DataError::Schema {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            record.into_item(geometry, path)
        })
        .collect()
}
