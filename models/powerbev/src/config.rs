//! Run settings: built-in defaults, overlaid by a YAML file, overlaid by
//! `KEY VALUE` command-line overrides, validated once.

use std::{fs, path::PathBuf};

use bev_dataset::{BevDataSource, BevGeometry};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::checkpoint::Direction;
use crate::error::ConfigError;
use crate::PowerBevConfig;

/// Each camera contributes an RGB image.
pub const CHANNELS_PER_CAMERA: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    pub config_file: Option<PathBuf>,
    pub opts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Auto,
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Synthetic,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct RunConfig {
    pub log_dir: PathBuf,
    pub tag: String,
    pub gpus: Vec<usize>,
    pub accelerator: Accelerator,
    pub precision: u32,
    pub batchsize: usize,
    pub epochs: usize,
    pub n_workers: usize,
    pub logging_interval: usize,
    pub grad_norm_clip: f32,
    pub seed: u64,
    pub pretrained: PretrainedConfig,
    pub dataset: DatasetConfig,
    pub image: ImageConfig,
    pub lift: LiftConfig,
    pub model: ModelConfig,
    pub semantic_seg: SemanticSegConfig,
    pub optimizer: OptimizerConfig,
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct PretrainedConfig {
    pub load_weights: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct DatasetConfig {
    pub name: DatasetKind,
    pub dataroot: PathBuf,
    pub train_samples: usize,
    pub val_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ImageConfig {
    pub final_dim: [usize; 2],
    pub n_cameras: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct LiftConfig {
    /// `[lower, upper, resolution]` in metres.
    pub x_bound: [f64; 3],
    pub y_bound: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ModelConfig {
    pub encoder: EncoderConfig,
    pub ego_motion_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct EncoderConfig {
    pub out_channels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct SemanticSegConfig {
    pub weights: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct CheckpointConfig {
    pub monitor: String,
    pub mode: Direction,
    pub save_top_k: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("tensorboard_logs"),
            tag: "default".to_string(),
            gpus: vec![0],
            accelerator: Accelerator::Auto,
            precision: 32,
            batchsize: 3,
            epochs: 20,
            n_workers: 5,
            logging_interval: 500,
            grad_norm_clip: 5.0,
            seed: 0,
            pretrained: PretrainedConfig::default(),
            dataset: DatasetConfig::default(),
            image: ImageConfig::default(),
            lift: LiftConfig::default(),
            model: ModelConfig::default(),
            semantic_seg: SemanticSegConfig::default(),
            optimizer: OptimizerConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Default for PretrainedConfig {
    fn default() -> Self {
        Self {
            load_weights: false,
            path: PathBuf::new(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: DatasetKind::Synthetic,
            dataroot: PathBuf::from("./nuscenes/"),
            train_samples: 64,
            val_samples: 16,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            final_dim: [224, 480],
            n_cameras: 6,
        }
    }
}

impl Default for LiftConfig {
    fn default() -> Self {
        Self {
            x_bound: [-50.0, 50.0, 0.5],
            y_bound: [-50.0, 50.0, 0.5],
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig { out_channels: 64 },
            ego_motion_dim: 6,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self { out_channels: 64 }
    }
}

impl Default for SemanticSegConfig {
    fn default() -> Self {
        Self {
            weights: vec![1.0, 2.0],
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            weight_decay: 1e-7,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            monitor: "vpq".to_string(),
            mode: Direction::Max,
            save_top_k: 5,
        }
    }
}

pub fn load(args: &ConfigArgs) -> Result<RunConfig, ConfigError> {
    let mut tree = serde_yaml::to_value(RunConfig::default()).map_err(ConfigError::Malformed)?;

    if let Some(path) = &args.config_file {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let file: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        merge(&mut tree, file);
    }

    apply_overrides(&mut tree, &args.opts)?;

    let config: RunConfig = serde_yaml::from_value(tree).map_err(ConfigError::Malformed)?;
    config.validate()?;
    log::debug!("resolved config: {config:?}");

    Ok(config)
}

/// Recursively overlays `overlay` on `base`. Keys the defaults don't know
/// are carried along and ignored at deserialization.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        // An empty file parses as null.
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

fn apply_overrides(tree: &mut Value, opts: &[String]) -> Result<(), ConfigError> {
    for pair in opts.chunks(2) {
        let [key, raw] = pair else {
            return Err(ConfigError::UnpairedOverride(pair[0].clone()));
        };

        let mut slot = &mut *tree;
        for part in key.split('.') {
            slot = match slot {
                Value::Mapping(map) => lookup(map, part),
                _ => None,
            }
            .ok_or_else(|| ConfigError::UnknownKey(key.clone()))?;
        }

        *slot = serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
    }
    Ok(())
}

fn lookup<'a>(map: &'a mut Mapping, key: &str) -> Option<&'a mut Value> {
    map.get_mut(&Value::String(key.to_string()))
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let setting = |key: &'static str, reason: &str| {
            Err(ConfigError::Setting {
                key,
                reason: reason.to_string(),
            })
        };

        if self.epochs == 0 {
            return setting("EPOCHS", "must be at least 1");
        }
        if self.batchsize == 0 {
            return setting("BATCHSIZE", "must be at least 1");
        }
        if self.logging_interval == 0 {
            return setting("LOGGING_INTERVAL", "must be at least 1");
        }
        if self.precision != 32 {
            return setting("PRECISION", "only 32-bit training is supported");
        }
        if !(self.grad_norm_clip > 0.0) {
            return setting("GRAD_NORM_CLIP", "must be positive");
        }
        if self.accelerator == Accelerator::Gpu && self.gpus.is_empty() {
            return setting("GPUS", "at least one device index is required on gpu");
        }
        if self.pretrained.load_weights && self.pretrained.path.as_os_str().is_empty() {
            return setting("PRETRAINED.PATH", "required when LOAD_WEIGHTS is set");
        }
        if self.image.n_cameras == 0 || self.image.final_dim.contains(&0) {
            return setting("IMAGE", "camera count and FINAL_DIM must be positive");
        }
        if self.model.encoder.out_channels == 0 {
            return setting("MODEL.ENCODER.OUT_CHANNELS", "must be positive");
        }
        if self.semantic_seg.weights.len() != 2 {
            return setting("SEMANTIC_SEG.WEIGHTS", "expected background and vehicle weights");
        }
        if self.checkpoint.monitor.is_empty() {
            return setting("CHECKPOINT.MONITOR", "must name a validation metric");
        }
        for (key, bound) in [("LIFT.X_BOUND", self.lift.x_bound), ("LIFT.Y_BOUND", self.lift.y_bound)] {
            let [lower, upper, resolution] = bound;
            if !(upper > lower) || !(resolution > 0.0) {
                return setting(key, "expected [lower, upper, resolution] with upper > lower");
            }
            if grid_cells(bound) == 0 {
                return setting(key, "resolution is coarser than the extent");
            }
        }

        Ok(())
    }

    /// BEV grid as `[rows, columns]`; rows follow the x axis.
    pub fn bev_size(&self) -> [usize; 2] {
        [grid_cells(self.lift.x_bound), grid_cells(self.lift.y_bound)]
    }

    pub fn geometry(&self) -> BevGeometry {
        BevGeometry::new(
            self.image.n_cameras * CHANNELS_PER_CAMERA,
            self.image.final_dim,
            self.bev_size(),
            self.model.ego_motion_dim,
        )
    }

    pub fn data_source(&self) -> BevDataSource {
        match self.dataset.name {
            DatasetKind::Synthetic => BevDataSource::Synthetic {
                train_samples: self.dataset.train_samples,
                val_samples: self.dataset.val_samples,
                seed: self.seed,
            },
            DatasetKind::Directory => BevDataSource::Directory {
                root: self.dataset.dataroot.clone(),
            },
        }
    }

    pub fn model_config(&self) -> PowerBevConfig {
        PowerBevConfig::new(
            self.image.n_cameras * CHANNELS_PER_CAMERA,
            self.model.ego_motion_dim,
            self.bev_size(),
        )
        .with_encoder_channels(self.model.encoder.out_channels)
        .with_background_weight(self.semantic_seg.weights[0])
        .with_vehicle_weight(self.semantic_seg.weights[1])
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Malformed)
    }
}

fn grid_cells([lower, upper, resolution]: [f64; 3]) -> usize {
    ((upper - lower) / resolution).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(yaml: Option<&str>, opts: &[&str]) -> (Option<tempfile::NamedTempFile>, ConfigArgs) {
        let file = yaml.map(|yaml| {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            f.write_all(yaml.as_bytes()).unwrap();
            f
        });
        let args = ConfigArgs {
            config_file: file.as_ref().map(|f| f.path().to_path_buf()),
            opts: opts.iter().map(|s| s.to_string()).collect(),
        };
        (file, args)
    }

    #[test]
    fn defaults_are_valid() {
        let config = load(&ConfigArgs::default()).unwrap();
        assert_eq!(config.epochs, 20);
        assert_eq!(config.checkpoint.save_top_k, 5);
        assert_eq!(config.checkpoint.mode, Direction::Max);
        assert_eq!(config.bev_size(), [200, 200]);
        assert_eq!(config.geometry().channels, 18);
    }

    #[test]
    fn file_then_overrides() {
        let yaml = r#"
TAG: powerbev_static
EPOCHS: 7
GRAD_NORM_CLIP: 5
PRETRAINED:
  LOAD_WEIGHTS: true
  PATH: weights/static.json
LIFT:
  X_BOUND: [-30.0, 30.0, 0.15]
SOMETHING_ELSE:
  IGNORED: 1
"#;
        let (_file, args) = args(Some(yaml), &["EPOCHS", "1", "PRETRAINED.LOAD_WEIGHTS", "False"]);
        let config = load(&args).unwrap();

        assert_eq!(config.tag, "powerbev_static");
        assert_eq!(config.epochs, 1);
        assert!(!config.pretrained.load_weights);
        assert_eq!(config.pretrained.path, PathBuf::from("weights/static.json"));
        assert_eq!(config.bev_size(), [400, 200]);
        assert_eq!(config.n_workers, 5);
    }

    #[test]
    fn override_strings_stay_strings() {
        let (_file, args) = args(None, &["TAG", "run 3", "DATASET.NAME", "directory"]);
        let config = load(&args).unwrap();
        assert_eq!(config.tag, "run 3");
        assert_eq!(config.dataset.name, DatasetKind::Directory);
    }

    #[test]
    fn unknown_override_key_is_rejected() {
        let (_file, args) = args(None, &["OPTIMIZER.MOMENTUM", "0.9"]);
        assert!(matches!(load(&args), Err(ConfigError::UnknownKey(key)) if key == "OPTIMIZER.MOMENTUM"));
    }

    #[test]
    fn unpaired_override_is_rejected() {
        let (_file, args) = args(None, &["EPOCHS"]);
        assert!(matches!(load(&args), Err(ConfigError::UnpairedOverride(_))));
    }

    #[test]
    fn malformed_value_is_rejected() {
        let (_file, args) = args(None, &["EPOCHS", "many"]);
        assert!(matches!(load(&args), Err(ConfigError::Malformed(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let args = ConfigArgs {
            config_file: Some(PathBuf::from("/nonexistent/powerbev.yml")),
            opts: vec![],
        };
        assert!(matches!(load(&args), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn validation_catches_bad_settings() {
        for opts in [
            &["EPOCHS", "0"][..],
            &["PRECISION", "8"][..],
            &["PRETRAINED.LOAD_WEIGHTS", "true"][..],
            &["LIFT.Y_BOUND", "[10.0, -10.0, 0.5]"][..],
            &["SEMANTIC_SEG.WEIGHTS", "[1.0]"][..],
            &["ACCELERATOR", "gpu", "GPUS", "[]"][..],
        ] {
            let (_file, args) = args(None, opts);
            assert!(
                matches!(load(&args), Err(ConfigError::Setting { .. })),
                "{opts:?} should fail validation"
            );
        }
    }

    #[test]
    fn half_precision_is_rejected_not_ignored() {
        let (_file, args) = args(None, &["PRECISION", "16"]);
        match load(&args) {
            Err(ConfigError::Setting { key, reason }) => {
                assert_eq!(key, "PRECISION");
                assert!(reason.contains("32"));
            }
            other => panic!("expected a PRECISION error, got {other:?}"),
        }
    }

    #[test]
    fn weight_decay_keeps_double_precision() {
        let (_file, args) = args(None, &["OPTIMIZER.WEIGHT_DECAY", "1.0e-7"]);
        let config = load(&args).unwrap();
        assert_eq!(config.optimizer.weight_decay, 1.0e-7_f64);
    }

    #[test]
    fn model_and_data_views_carry_required_settings() {
        let (_file, args) = args(
            None,
            &["IMAGE.N_CAMERAS", "2", "MODEL.ENCODER.OUT_CHANNELS", "8", "SEMANTIC_SEG.WEIGHTS", "[0.5, 3.0]"],
        );
        let config = load(&args).unwrap();

        let model = config.model_config();
        assert_eq!(model.in_channels, 6);
        assert_eq!(model.encoder_channels, 8);
        assert_eq!(model.bev_size, config.bev_size());
        assert_eq!(model.vehicle_weight, 3.0);

        let geometry = config.geometry();
        assert_eq!(geometry.channels, model.in_channels);
        assert_eq!(geometry.aux_dim, model.aux_dim);
        assert!(matches!(config.data_source(), BevDataSource::Synthetic { train_samples: 64, .. }));
    }

    #[test]
    fn resolved_config_round_trips_through_yaml() {
        let config = load(&ConfigArgs::default()).unwrap();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("LOGGING_INTERVAL: 500"));
    }
}
