//! Name-addressed parameter snapshots and partial (non-strict) loading.

use std::{collections::BTreeMap, fs, path::Path};

use burn::{
    module::Param,
    nn::{conv::Conv2d, Linear},
    tensor::{backend::Backend, Tensor, TensorData},
};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Parameter name to value, e.g. `backbone.stem.weight`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict(BTreeMap<String, ParamSnapshot>);

impl StateDict {
    pub fn get(&self, name: &str) -> Option<&ParamSnapshot> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, param: ParamSnapshot) {
        self.0.insert(name.into(), param);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries whose name starts with `prefix`.
    pub fn filter_prefix(&self, prefix: &str) -> StateDict {
        StateDict(
            self.0
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, param)| (name.clone(), param.clone()))
                .collect(),
        )
    }
}

/// A serialized parameter mapping as stored on disk: `{"state_dict": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state_dict: StateDict,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        if !path.exists() {
            return Err(SnapshotError::NotFound(path.to_path_buf()));
        }
        let raw = fs::read(path).map_err(|source| SnapshotError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| SnapshotError::Deserialize {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec(self).map_err(SnapshotError::Serialize)?;
        fs::write(path, json).map_err(|source| SnapshotError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Present in both, but the snapshot's shape or length doesn't fit.
    pub mismatched: Vec<String>,
    /// In the snapshot, not in the model.
    pub unexpected: Vec<String>,
    /// In the model, not in the snapshot; keeps its current value.
    pub missing: Vec<String>,
}

impl LoadReport {
    pub(crate) fn finish(&mut self, snapshot: &StateDict) {
        let known: Vec<&String> = self
            .loaded
            .iter()
            .chain(&self.mismatched)
            .chain(&self.missing)
            .collect();
        self.unexpected = snapshot
            .names()
            .filter(|name| !known.iter().any(|k| k.as_str() == *name))
            .map(str::to_string)
            .collect();

        for name in &self.mismatched {
            warn!("skipping '{name}': shape does not match the model");
        }
        for name in &self.unexpected {
            warn!("skipping '{name}': no such parameter in the model");
        }
    }
}

/// Export and partial import of parameters under dotted names.
pub trait NamedParameters: Sized {
    fn export(&self, name: &str, dict: &mut StateDict);

    fn import(self, name: &str, dict: &StateDict, report: &mut LoadReport) -> Self;
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl<B: Backend, const D: usize> NamedParameters for Param<Tensor<B, D>> {
    fn export(&self, name: &str, dict: &mut StateDict) {
        let value = self.val();
        let shape = value.dims().to_vec();
        let values = value.into_data().iter::<f32>().collect();
        dict.insert(name, ParamSnapshot { shape, values });
    }

    fn import(self, name: &str, dict: &StateDict, report: &mut LoadReport) -> Self {
        let Some(entry) = dict.get(name) else {
            report.missing.push(name.to_string());
            return self;
        };

        let current = self.val();
        let fits = entry.shape.as_slice() == current.dims().as_slice()
            && entry.values.len() == entry.shape.iter().product::<usize>();
        if !fits {
            report.mismatched.push(name.to_string());
            return self;
        }

        let require_grad = current.is_require_grad();
        let loaded = Tensor::<B, D>::from_data(
            TensorData::new(entry.values.clone(), entry.shape.clone()),
            &current.device(),
        );
        report.loaded.push(name.to_string());

        self.map(|_| loaded.clone().set_require_grad(require_grad))
    }
}

impl<B: Backend> NamedParameters for Conv2d<B> {
    fn export(&self, name: &str, dict: &mut StateDict) {
        self.weight.export(&join(name, "weight"), dict);
        if let Some(bias) = &self.bias {
            bias.export(&join(name, "bias"), dict);
        }
    }

    fn import(mut self, name: &str, dict: &StateDict, report: &mut LoadReport) -> Self {
        self.weight = self.weight.import(&join(name, "weight"), dict, report);
        self.bias = self
            .bias
            .map(|bias| bias.import(&join(name, "bias"), dict, report));
        self
    }
}

impl<B: Backend> NamedParameters for Linear<B> {
    fn export(&self, name: &str, dict: &mut StateDict) {
        self.weight.export(&join(name, "weight"), dict);
        if let Some(bias) = &self.bias {
            bias.export(&join(name, "bias"), dict);
        }
    }

    fn import(mut self, name: &str, dict: &StateDict, report: &mut LoadReport) -> Self {
        self.weight = self.weight.import(&join(name, "weight"), dict, report);
        self.bias = self
            .bias
            .map(|bias| bias.import(&join(name, "bias"), dict, report));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::LinearConfig;

    type TestBackend = NdArray<f32>;

    #[test]
    fn linear_round_trips_by_name() {
        let device = Default::default();
        let source = LinearConfig::new(3, 2).init::<TestBackend>(&device);
        let target = LinearConfig::new(3, 2).init::<TestBackend>(&device);

        let mut dict = StateDict::default();
        source.export("head", &mut dict);
        assert_eq!(dict.names().collect::<Vec<_>>(), vec!["head.bias", "head.weight"]);

        let mut report = LoadReport::default();
        let target = target.import("head", &dict, &mut report);
        report.finish(&dict);

        let mut after = StateDict::default();
        target.export("head", &mut after);
        assert_eq!(after, dict);
        assert_eq!(report.loaded.len(), 2);
        assert!(report.mismatched.is_empty() && report.unexpected.is_empty());
    }

    #[test]
    fn mismatched_and_unexpected_entries_are_skipped() {
        let device = Default::default();
        let target = LinearConfig::new(3, 2).init::<TestBackend>(&device);
        let mut before = StateDict::default();
        target.export("head", &mut before);

        let mut dict = StateDict::default();
        dict.insert(
            "head.weight",
            ParamSnapshot {
                shape: vec![2, 3],
                values: vec![0.0; 6],
            },
        );
        dict.insert(
            "neck.weight",
            ParamSnapshot {
                shape: vec![1],
                values: vec![1.0],
            },
        );

        let mut report = LoadReport::default();
        let target = target.import("head", &dict, &mut report);
        report.finish(&dict);

        let mut after = StateDict::default();
        target.export("head", &mut after);
        assert_eq!(after, before);
        assert_eq!(report.mismatched, vec!["head.weight".to_string()]);
        assert_eq!(report.missing, vec!["head.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["neck.weight".to_string()]);
    }

    #[test]
    fn snapshot_file_round_trip_and_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("weights.json");

        let mut state_dict = StateDict::default();
        state_dict.insert(
            "backbone.stem.bias",
            ParamSnapshot {
                shape: vec![2],
                values: vec![0.5, -0.5],
            },
        );
        let snapshot = Snapshot { state_dict };
        snapshot.save(&path).unwrap();
        assert_eq!(Snapshot::load(&path).unwrap(), snapshot);

        assert!(matches!(
            Snapshot::load(&tmp.path().join("absent.json")),
            Err(SnapshotError::NotFound(_))
        ));

        fs::write(&path, b"{\"state_dict\": 3}").unwrap();
        assert!(matches!(Snapshot::load(&path), Err(SnapshotError::Deserialize { .. })));
    }
}
